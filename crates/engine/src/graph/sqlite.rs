//! SQLite-backed graph store.
//!
//! Nodes and edges live in two tables; attributes and edge properties are
//! JSON text. Reads go through a small pool of read-only connections and
//! every call runs on the blocking pool. A call whose caller stops waiting
//! has its statement interrupted, so a runaway query frees its connection.

use super::{
    GraphEdge, GraphNode, GraphQuery, GraphStats, GraphStore, NodeField, NodeRef, PathMatch,
    PathSpec, Row, Triplet,
};
use kgqa_core::{AppError, AppResult};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, InterruptHandle, OpenFlags};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const NODE_COLUMNS: usize = 6;
const EDGE_COLUMNS: usize = 8;

/// Number of read connections opened per graph.
pub const READ_POOL_SIZE: usize = 4;

/// Create the graph tables if they do not exist.
pub fn create_schema(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            node_type TEXT NOT NULL,
            identifier TEXT NOT NULL,
            secondary_id TEXT,
            name TEXT NOT NULL,
            attributes TEXT NOT NULL DEFAULT '{}',
            source TEXT,
            PRIMARY KEY (node_type, identifier)
        );

        CREATE TABLE IF NOT EXISTS edges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rel_type TEXT NOT NULL,
            from_type TEXT NOT NULL,
            from_id TEXT NOT NULL,
            to_type TEXT NOT NULL,
            to_id TEXT NOT NULL,
            properties TEXT NOT NULL DEFAULT '{}',
            weight REAL NOT NULL DEFAULT 1.0
        );

        CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_type, from_id);
        CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_type, to_id);
        "#,
    )
    .map_err(|e| AppError::Graph(format!("Failed to create graph tables: {}", e)))?;

    Ok(())
}

struct Slot {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
}

/// Read connections handed out to blocking calls.
struct ReadPool {
    slots: Vec<Slot>,
    next: AtomicUsize,
}

impl ReadPool {
    /// Take the first idle connection, or queue on one round-robin when all
    /// are busy.
    fn acquire(&self) -> AppResult<(usize, MutexGuard<'_, Connection>)> {
        for (index, slot) in self.slots.iter().enumerate() {
            if let Ok(guard) = slot.conn.try_lock() {
                return Ok((index, guard));
            }
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let guard = self.slots[index]
            .conn
            .lock()
            .map_err(|_| AppError::Graph("Graph connection lock poisoned".to_string()))?;
        Ok((index, guard))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Queued,
    Running(usize),
    Done,
    Abandoned,
}

/// Dropped with the caller's future. A call still queued is told not to
/// start; a call still running has its statement interrupted.
struct AbandonGuard {
    pool: Arc<ReadPool>,
    state: Arc<Mutex<CallState>>,
    what: &'static str,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match *state {
            CallState::Queued => *state = CallState::Abandoned,
            CallState::Running(slot) => {
                tracing::warn!("Interrupting abandoned graph {}", self.what);
                self.pool.slots[slot].interrupt.interrupt();
            }
            CallState::Done | CallState::Abandoned => {}
        }
    }
}

/// Read-only graph store over a SQLite database.
#[derive(Clone)]
pub struct SqliteGraph {
    pool: Arc<ReadPool>,
}

impl SqliteGraph {
    /// Open an existing graph database read-only.
    pub fn open(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Err(AppError::Graph(format!(
                "Graph database not found: {}",
                path.display()
            )));
        }

        let connections = (0..READ_POOL_SIZE)
            .map(|_| {
                Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|e| AppError::Graph(format!("Failed to open graph database: {}", e)))
            })
            .collect::<AppResult<Vec<_>>>()?;

        tracing::debug!(
            "Opened graph database at {:?} with {} connection(s)",
            path,
            connections.len()
        );
        Self::from_connections(connections)
    }

    /// Wrap an already-populated connection; further writes are refused.
    pub fn from_connection(conn: Connection) -> AppResult<Self> {
        Self::from_connections(vec![conn])
    }

    /// Wrap connections to the same populated database.
    pub fn from_connections(connections: Vec<Connection>) -> AppResult<Self> {
        if connections.is_empty() {
            return Err(AppError::Graph(
                "Graph store needs at least one connection".to_string(),
            ));
        }

        let mut slots = Vec::with_capacity(connections.len());
        for conn in connections {
            conn.pragma_update(None, "query_only", true)
                .map_err(|e| AppError::Graph(format!("Failed to set query_only: {}", e)))?;
            slots.push(Slot {
                interrupt: conn.get_interrupt_handle(),
                conn: Mutex::new(conn),
            });
        }

        Ok(Self {
            pool: Arc::new(ReadPool {
                slots,
                next: AtomicUsize::new(0),
            }),
        })
    }

    async fn run<T, F>(&self, what: &'static str, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> AppResult<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        let state = Arc::new(Mutex::new(CallState::Queued));
        let _abandon = AbandonGuard {
            pool: Arc::clone(&pool),
            state: Arc::clone(&state),
            what,
        };

        tokio::task::spawn_blocking(move || {
            let (slot, conn) = pool.acquire()?;
            {
                let mut state = state
                    .lock()
                    .map_err(|_| AppError::Graph("Graph call state poisoned".to_string()))?;
                if *state == CallState::Abandoned {
                    return Err(AppError::Graph(format!(
                        "Graph {} abandoned before it started",
                        what
                    )));
                }
                *state = CallState::Running(slot);
            }

            let result = f(&conn);
            // Marked while the connection is still held.
            if let Ok(mut state) = state.lock() {
                *state = CallState::Done;
            }
            result
        })
        .await
        .map_err(|e| AppError::Graph(format!("Graph task failed during {}: {}", what, e)))?
    }
}

fn node_columns(alias: &str) -> String {
    format!(
        "{a}.node_type, {a}.identifier, {a}.secondary_id, {a}.name, {a}.attributes, {a}.source",
        a = alias
    )
}

fn edge_columns(alias: &str) -> String {
    format!(
        "{a}.id, {a}.rel_type, {a}.from_type, {a}.from_id, {a}.to_type, {a}.to_id, \
         {a}.properties, {a}.weight",
        a = alias
    )
}

fn json_object(text: &str) -> Map<String, Value> {
    serde_json::from_str(text).unwrap_or_default()
}

fn node_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<GraphNode> {
    let attributes: String = row.get(offset + 4)?;
    Ok(GraphNode {
        node_type: row.get(offset)?,
        identifier: row.get(offset + 1)?,
        secondary_id: row.get(offset + 2)?,
        name: row.get(offset + 3)?,
        attributes: json_object(&attributes),
        source: row.get(offset + 5)?,
    })
}

fn edge_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<GraphEdge> {
    let properties: String = row.get(offset + 6)?;
    Ok(GraphEdge {
        rel_type: row.get(offset + 1)?,
        from: NodeRef {
            node_type: row.get(offset + 2)?,
            identifier: row.get(offset + 3)?,
        },
        to: NodeRef {
            node_type: row.get(offset + 4)?,
            identifier: row.get(offset + 5)?,
        },
        properties: json_object(&properties),
        weight: row.get(offset + 7)?,
    })
}

/// SQL for an undirected walk over `path`; returns the statement and its
/// positional parameters.
fn traversal_sql(path: &PathSpec, limit: usize) -> (String, Vec<SqlValue>) {
    let hops = path.hops();
    let mut columns = vec![node_columns("n0")];
    let mut joins = Vec::new();
    let mut conditions = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    for (i, node_type) in path.node_types.iter().enumerate() {
        values.push(SqlValue::Text(node_type.clone()));
        conditions.push(format!("n{}.node_type = ?{} COLLATE NOCASE", i, values.len()));
    }

    for hop in 0..hops {
        let (n, e, m) = (format!("n{}", hop), format!("e{}", hop), format!("n{}", hop + 1));
        columns.push(edge_columns(&e));
        columns.push(node_columns(&m));

        joins.push(format!(
            "JOIN edges {e} ON (({e}.from_type = {n}.node_type AND {e}.from_id = {n}.identifier) \
             OR ({e}.to_type = {n}.node_type AND {e}.to_id = {n}.identifier))",
            e = e,
            n = n
        ));
        joins.push(format!(
            "JOIN nodes {m} ON (({e}.from_type = {n}.node_type AND {e}.from_id = {n}.identifier \
             AND {e}.to_type = {m}.node_type AND {e}.to_id = {m}.identifier) \
             OR ({e}.to_type = {n}.node_type AND {e}.to_id = {n}.identifier \
             AND {e}.from_type = {m}.node_type AND {e}.from_id = {m}.identifier))",
            e = e,
            n = n,
            m = m
        ));

        if let Some(Some(rel_type)) = path.relations.get(hop) {
            values.push(SqlValue::Text(rel_type.clone()));
            conditions.push(format!("{}.rel_type = ?{} COLLATE NOCASE", e, values.len()));
        }
        if hop > 0 {
            conditions.push(format!("{}.id <> e{}.id", e, hop - 1));
        }
    }

    values.push(SqlValue::Integer(limit as i64));
    let sql = format!(
        "SELECT {} FROM nodes n0 {} WHERE {} LIMIT ?{}",
        columns.join(", "),
        joins.join(" "),
        conditions.join(" AND "),
        values.len()
    );

    (sql, values)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                    return parsed;
                }
            }
            Value::String(text.into_owned())
        }
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

fn run_query(conn: &Connection, query: &GraphQuery) -> AppResult<Vec<Row>> {
    let mut stmt = conn
        .prepare(&query.text)
        .map_err(|e| AppError::Graph(format!("Failed to prepare query: {}", e)))?;

    if !stmt.readonly() {
        return Err(AppError::Graph(
            "Refusing to run a statement that writes".to_string(),
        ));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    for (name, value) in &query.parameters {
        let key = if name.starts_with([':', '@', '$']) {
            name.clone()
        } else {
            format!(":{}", name)
        };
        let index = stmt
            .parameter_index(&key)
            .map_err(|e| AppError::Graph(format!("Invalid parameter {}: {}", key, e)))?;
        match index {
            Some(index) => stmt
                .raw_bind_parameter(index, json_to_sql(value))
                .map_err(|e| AppError::Graph(format!("Failed to bind {}: {}", key, e)))?,
            None => tracing::debug!("Query does not use parameter {}", key),
        }
    }

    let mut rows = stmt.raw_query();
    let mut results = Vec::new();
    while query.max_rows.map_or(true, |max| results.len() < max) {
        let Some(row) = rows
            .next()
            .map_err(|e| AppError::Graph(format!("Failed to read query row: {}", e)))?
        else {
            break;
        };
        let mut record = Row::new();
        for (i, column) in columns.iter().enumerate() {
            let value = row
                .get_ref(i)
                .map_err(|e| AppError::Graph(format!("Failed to read column {}: {}", column, e)))?;
            record.insert(column.clone(), sql_to_json(value));
        }
        results.push(record);
    }

    Ok(results)
}

#[async_trait::async_trait]
impl GraphStore for SqliteGraph {
    async fn lookup(
        &self,
        node_type: &str,
        field: NodeField,
        value: &str,
    ) -> AppResult<Option<GraphNode>> {
        let node_type = node_type.to_string();
        let value = value.to_string();
        self.run("lookup", move |conn| {
            let sql = format!(
                "SELECT {} FROM nodes n WHERE n.node_type = ?1 COLLATE NOCASE \
                 AND n.{} = ?2 COLLATE NOCASE LIMIT 1",
                node_columns("n"),
                field.column()
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| AppError::Graph(format!("Failed to prepare lookup: {}", e)))?;
            let mut rows = stmt
                .query_map(params![node_type, value], |row| node_at(row, 0))
                .map_err(|e| AppError::Graph(format!("Failed to look up node: {}", e)))?;

            rows.next()
                .transpose()
                .map_err(|e| AppError::Graph(format!("Failed to read node: {}", e)))
        })
        .await
    }

    async fn nodes_of_type(&self, node_type: &str, limit: usize) -> AppResult<Vec<GraphNode>> {
        let node_type = node_type.to_string();
        self.run("nodes_of_type", move |conn| {
            let sql = format!(
                "SELECT {} FROM nodes n WHERE n.node_type = ?1 COLLATE NOCASE \
                 ORDER BY n.identifier LIMIT ?2",
                node_columns("n")
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| AppError::Graph(format!("Failed to prepare node scan: {}", e)))?;
            let nodes = stmt
                .query_map(params![node_type, limit as i64], |row| node_at(row, 0))
                .map_err(|e| AppError::Graph(format!("Failed to scan nodes: {}", e)))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::Graph(format!("Failed to read node: {}", e)))?;
            Ok(nodes)
        })
        .await
    }

    async fn traverse(&self, path: &PathSpec, limit: usize) -> AppResult<Vec<PathMatch>> {
        if path.hops() == 0 {
            return Ok(Vec::new());
        }

        let hops = path.hops();
        let (sql, values) = traversal_sql(path, limit);
        tracing::trace!("Traversal SQL for {}: {}", path, sql);

        self.run("traverse", move |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| AppError::Graph(format!("Failed to prepare traversal: {}", e)))?;
            let stride = NODE_COLUMNS + EDGE_COLUMNS;
            let paths = stmt
                .query_map(rusqlite::params_from_iter(values), |row| {
                    let mut nodes = Vec::with_capacity(hops + 1);
                    let mut edges = Vec::with_capacity(hops);
                    for hop in 0..=hops {
                        nodes.push(node_at(row, hop * stride)?);
                        if hop < hops {
                            edges.push(edge_at(row, hop * stride + NODE_COLUMNS)?);
                        }
                    }
                    Ok(PathMatch { nodes, edges })
                })
                .map_err(|e| AppError::Graph(format!("Failed to traverse: {}", e)))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::Graph(format!("Failed to read path: {}", e)))?;
            Ok(paths)
        })
        .await
    }

    async fn query(&self, query: &GraphQuery) -> AppResult<Vec<Row>> {
        let query = query.clone();
        self.run("query", move |conn| run_query(conn, &query)).await
    }

    async fn ego_network(
        &self,
        node_type: &str,
        identifier: &str,
        limit: usize,
    ) -> AppResult<Vec<Triplet>> {
        let node_type = node_type.to_string();
        let identifier = identifier.to_string();
        self.run("ego_network", move |conn| {
            let sql = format!(
                "SELECT {}, {}, {} FROM edges e \
                 JOIN nodes a ON a.node_type = e.from_type AND a.identifier = e.from_id \
                 JOIN nodes b ON b.node_type = e.to_type AND b.identifier = e.to_id \
                 WHERE (e.from_type = ?1 AND e.from_id = ?2) OR (e.to_type = ?1 AND e.to_id = ?2) \
                 ORDER BY e.weight DESC, e.id LIMIT ?3",
                edge_columns("e"),
                node_columns("a"),
                node_columns("b")
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| AppError::Graph(format!("Failed to prepare ego network: {}", e)))?;
            let triplets = stmt
                .query_map(params![node_type, identifier, limit as i64], |row| {
                    Ok(Triplet {
                        edge: edge_at(row, 0)?,
                        source: node_at(row, EDGE_COLUMNS)?,
                        target: node_at(row, EDGE_COLUMNS + NODE_COLUMNS)?,
                    })
                })
                .map_err(|e| AppError::Graph(format!("Failed to read ego network: {}", e)))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::Graph(format!("Failed to read triplet: {}", e)))?;
            Ok(triplets)
        })
        .await
    }

    async fn stats(&self) -> AppResult<GraphStats> {
        self.run("stats", |conn| {
            let mut stats = GraphStats::default();
            for (sql, target) in [
                (
                    "SELECT node_type, COUNT(*) FROM nodes GROUP BY node_type",
                    &mut stats.nodes_by_type,
                ),
                (
                    "SELECT rel_type, COUNT(*) FROM edges GROUP BY rel_type",
                    &mut stats.edges_by_type,
                ),
            ] {
                let mut stmt = conn
                    .prepare(sql)
                    .map_err(|e| AppError::Graph(format!("Failed to prepare stats: {}", e)))?;
                let counts = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                    .map_err(|e| AppError::Graph(format!("Failed to count: {}", e)))?;
                for count in counts {
                    let (key, n) =
                        count.map_err(|e| AppError::Graph(format!("Failed to count: {}", e)))?;
                    target.insert(key, n as u64);
                }
            }
            Ok(stats)
        })
        .await
    }
}
