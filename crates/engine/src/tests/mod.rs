//! Shared helpers for unit tests.

use crate::graph::{GraphFixture, SqliteGraph};
use rusqlite::Connection;
use std::path::Path;

pub const FIXTURE_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/catalog.json");

/// Read-only, but keeps a connection busy for minutes unless interrupted.
pub const RUNAWAY_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 \
                                 FROM c WHERE x < 2000000000) SELECT count(*) AS n FROM c";

/// The bundled product catalog loaded into an in-memory graph.
pub fn fixture_graph() -> SqliteGraph {
    GraphFixture::from_file(Path::new(FIXTURE_PATH))
        .unwrap()
        .in_memory()
        .unwrap()
}

/// The bundled catalog behind a single connection.
pub fn single_connection_graph() -> SqliteGraph {
    let fixture = GraphFixture::from_file(Path::new(FIXTURE_PATH)).unwrap();
    let mut conn = Connection::open_in_memory().unwrap();
    fixture.write_into(&mut conn).unwrap();
    SqliteGraph::from_connection(conn).unwrap()
}
