//! JSON graph fixtures and import into a SQLite graph database.

use super::sqlite::{create_schema, READ_POOL_SIZE};
use super::{GraphNode, NodeRef, SqliteGraph};
use kgqa_core::{AppError, AppResult};
use rusqlite::{params, Connection, OpenFlags};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use uuid::Uuid;

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureEdge {
    #[serde(rename = "type", alias = "rel_type")]
    pub rel_type: String,
    pub from: NodeRef,
    pub to: NodeRef,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

/// A small graph described as JSON:
/// `{"nodes": [{"type", "sku", "name", ...}], "edges": [{"type", "from", "to", ...}]}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphFixture {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<FixtureEdge>,
}

impl GraphFixture {
    pub fn from_json(contents: &str) -> AppResult<Self> {
        serde_json::from_str(contents)
            .map_err(|e| AppError::Graph(format!("Failed to parse graph fixture: {}", e)))
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AppError::Graph(format!("Failed to read fixture {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    /// Insert every node and edge in one transaction. Edges whose endpoints
    /// are missing abort the import.
    pub fn write_into(&self, conn: &mut Connection) -> AppResult<(usize, usize)> {
        create_schema(conn)?;

        let tx = conn
            .transaction()
            .map_err(|e| AppError::Graph(format!("Failed to start import: {}", e)))?;

        for node in &self.nodes {
            let attributes = serde_json::to_string(&node.attributes)?;
            tx.execute(
                "INSERT OR REPLACE INTO nodes (node_type, identifier, secondary_id, name, attributes, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    node.node_type,
                    node.identifier,
                    node.secondary_id,
                    node.name,
                    attributes,
                    node.source,
                ],
            )
            .map_err(|e| AppError::Graph(format!("Failed to insert node {}: {}", node.key(), e)))?;
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                let exists: bool = tx
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM nodes WHERE node_type = ?1 AND identifier = ?2)",
                        params![endpoint.node_type, endpoint.identifier],
                        |row| row.get(0),
                    )
                    .map_err(|e| AppError::Graph(format!("Failed to check endpoint: {}", e)))?;
                if !exists {
                    return Err(AppError::Graph(format!(
                        "Edge {} references unknown node {}",
                        edge.rel_type, endpoint
                    )));
                }
            }

            let properties = serde_json::to_string(&edge.properties)?;
            tx.execute(
                "INSERT INTO edges (rel_type, from_type, from_id, to_type, to_id, properties, weight)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    edge.rel_type,
                    edge.from.node_type,
                    edge.from.identifier,
                    edge.to.node_type,
                    edge.to.identifier,
                    properties,
                    edge.weight,
                ],
            )
            .map_err(|e| AppError::Graph(format!("Failed to insert edge: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| AppError::Graph(format!("Failed to commit import: {}", e)))?;

        Ok((self.nodes.len(), self.edges.len()))
    }

    /// Load into a fresh in-memory database shared by a pool of
    /// connections.
    pub fn in_memory(&self) -> AppResult<SqliteGraph> {
        let uri = format!("file:kgqa-{}?mode=memory&cache=shared", Uuid::new_v4());
        let open = || {
            Connection::open_with_flags(
                &uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| AppError::Graph(format!("Failed to open in-memory graph: {}", e)))
        };

        let mut first = open()?;
        self.write_into(&mut first)?;

        let mut connections = vec![first];
        for _ in 1..READ_POOL_SIZE {
            connections.push(open()?);
        }
        SqliteGraph::from_connections(connections)
    }
}

/// Import a JSON fixture file into the database at `db_path`, creating it
/// when needed.
pub fn import_file(fixture_path: &Path, db_path: &Path) -> AppResult<(usize, usize)> {
    let fixture = GraphFixture::from_file(fixture_path)?;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AppError::Graph(format!("Failed to create graph directory: {}", e)))?;
    }

    let mut conn = Connection::open(db_path)
        .map_err(|e| AppError::Graph(format!("Failed to open graph database: {}", e)))?;
    let counts = fixture.write_into(&mut conn)?;

    tracing::info!(
        "Imported {} nodes and {} edges into {:?}",
        counts.0,
        counts.1,
        db_path
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use tempfile::TempDir;

    #[test]
    fn test_edge_with_unknown_endpoint_rejected() {
        let fixture = GraphFixture::from_json(
            r#"{
                "nodes": [{"type": "Panel", "sku": "4007ES", "name": "Panel"}],
                "edges": [{"type": "HAS_MODULE",
                           "from": {"type": "Panel", "identifier": "4007ES"},
                           "to": {"type": "Module", "identifier": "missing"}}]
            }"#,
        )
        .unwrap();

        let mut conn = Connection::open_in_memory().unwrap();
        let err = fixture.write_into(&mut conn).unwrap_err();
        assert!(err.to_string().contains("unknown node"));
    }

    #[tokio::test]
    async fn test_import_file_then_open_read_only() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join(".kgqa/graph.sqlite");

        let (nodes, edges) =
            import_file(Path::new(crate::tests::FIXTURE_PATH), &db).unwrap();
        assert!(nodes > 0 && edges > 0);

        let graph = SqliteGraph::open(&db).unwrap();
        let stats = graph.stats().await.unwrap();
        assert_eq!(stats.total_nodes() as usize, nodes);
        assert_eq!(stats.total_edges() as usize, edges);
    }
}
