//! Read-only access to the typed property graph.
//!
//! Nodes are typed entities keyed by `(type, identifier)`; edges are typed,
//! directed relations carrying a property bag and a weight. The engine only
//! ever reads from the store.

pub mod fixture;
pub mod sandbox;
pub mod schema;
pub mod sqlite;

use kgqa_core::AppResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub use fixture::{import_file, GraphFixture};
pub use sandbox::{SandboxPolicy, SandboxViolation};
pub use schema::GraphSchema;
pub use sqlite::SqliteGraph;

/// A row returned by a declarative query, column name to value.
pub type Row = Map<String, Value>;

/// A typed entity in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(alias = "type")]
    pub node_type: String,
    /// Unique within `node_type` (SKU-like)
    #[serde(alias = "sku")]
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Source document the node was extracted from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl GraphNode {
    /// `Type:identifier`
    pub fn key(&self) -> String {
        format!("{}:{}", self.node_type, self.identifier)
    }

    pub fn description(&self) -> Option<&str> {
        self.attributes.get("description").and_then(Value::as_str)
    }
}

/// Endpoint of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    #[serde(rename = "type")]
    pub node_type: String,
    pub identifier: String,
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_type, self.identifier)
    }
}

/// A typed, directed relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub rel_type: String,
    pub from: NodeRef,
    pub to: NodeRef,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// 1.0 for explicit facts, lower for inferred ones
    pub weight: f64,
}

impl GraphEdge {
    pub fn key(&self) -> String {
        format!("{}-{}->{}", self.from, self.rel_type, self.to)
    }

    pub fn notes(&self) -> Option<&str> {
        self.properties.get("notes").and_then(Value::as_str)
    }
}

/// Field used for exact lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeField {
    Identifier,
    SecondaryId,
    Name,
}

impl NodeField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::SecondaryId => "secondary_id",
            Self::Name => "name",
        }
    }
}

/// An ordered node-type sequence with optional relationship constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSpec {
    pub node_types: Vec<String>,
    /// One slot per hop; `None` accepts any relationship type
    pub relations: Vec<Option<String>>,
}

impl PathSpec {
    /// Parse `Type->REL->Type->Type` notation. Tokens written in upper
    /// snake case are relationship types; everything else is a node type.
    pub fn parse(text: &str) -> Option<Self> {
        let tokens: Vec<&str> = text
            .split("->")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();

        let mut node_types: Vec<String> = Vec::new();
        let mut relations = Vec::new();
        let mut pending: Option<String> = None;

        for token in tokens {
            if is_relation_token(token) {
                if node_types.is_empty() || pending.is_some() {
                    return None;
                }
                pending = Some(token.to_string());
            } else {
                if !node_types.is_empty() {
                    relations.push(pending.take());
                }
                node_types.push(token.to_string());
            }
        }

        if node_types.len() < 2 || pending.is_some() {
            return None;
        }

        Some(Self {
            node_types,
            relations,
        })
    }

    pub fn hops(&self) -> usize {
        self.relations.len()
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (i, node_type) in self.node_types.iter().enumerate() {
            if !first {
                f.write_str("->")?;
            }
            first = false;
            if i > 0 {
                if let Some(Some(rel)) = self.relations.get(i - 1) {
                    write!(f, "{}->", rel)?;
                }
            }
            f.write_str(node_type)?;
        }
        Ok(())
    }
}

fn is_relation_token(token: &str) -> bool {
    token.len() > 1
        && token.chars().any(|c| c.is_ascii_uppercase())
        && token
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// A matched path: `nodes.len() == edges.len() + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMatch {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// One edge of an ego network with both endpoints, in edge direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triplet {
    pub source: GraphNode,
    pub edge: GraphEdge,
    pub target: GraphNode,
}

/// A declarative (SQL) query with named parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQuery {
    pub purpose: String,
    pub text: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Rows read before the store stops stepping the statement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
}

impl GraphQuery {
    pub fn new(purpose: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            text: text.into(),
            parameters: Map::new(),
            max_rows: None,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// Node and edge counts by type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub nodes_by_type: BTreeMap<String, u64>,
    pub edges_by_type: BTreeMap<String, u64>,
}

impl GraphStats {
    pub fn total_nodes(&self) -> u64 {
        self.nodes_by_type.values().sum()
    }

    pub fn total_edges(&self) -> u64 {
        self.edges_by_type.values().sum()
    }
}

/// Read-only graph access used by the retriever and linker.
///
/// Every call is a single request/response; implementations must refuse
/// writes.
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync {
    /// Exact match on one field within nodes of `node_type`
    /// (type and value compared case-insensitively).
    async fn lookup(
        &self,
        node_type: &str,
        field: NodeField,
        value: &str,
    ) -> AppResult<Option<GraphNode>>;

    /// Up to `limit` nodes of `node_type`, for fuzzy matching.
    async fn nodes_of_type(&self, node_type: &str, limit: usize) -> AppResult<Vec<GraphNode>>;

    /// Paths matching the type sequence, edges in either direction.
    async fn traverse(&self, path: &PathSpec, limit: usize) -> AppResult<Vec<PathMatch>>;

    /// Run an already-sandboxed read-only query.
    async fn query(&self, query: &GraphQuery) -> AppResult<Vec<Row>>;

    /// Edges touching the node together with both endpoints.
    async fn ego_network(
        &self,
        node_type: &str,
        identifier: &str,
        limit: usize,
    ) -> AppResult<Vec<Triplet>>;

    async fn stats(&self) -> AppResult<GraphStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path_with_relations() {
        let path = PathSpec::parse("Detector->REQUIRES_BASE->Base").unwrap();
        assert_eq!(path.node_types, vec!["Detector", "Base"]);
        assert_eq!(path.relations, vec![Some("REQUIRES_BASE".to_string())]);
        assert_eq!(path.to_string(), "Detector->REQUIRES_BASE->Base");
    }

    #[test]
    fn test_parse_path_without_relations() {
        let path = PathSpec::parse("Panel -> Module -> License").unwrap();
        assert_eq!(path.hops(), 2);
        assert_eq!(path.relations, vec![None, None]);
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        assert!(PathSpec::parse("Panel").is_none());
        assert!(PathSpec::parse("HAS_MODULE->Module").is_none());
        assert!(PathSpec::parse("Panel->HAS_MODULE").is_none());
        assert!(PathSpec::parse("Panel->HAS_MODULE->REQUIRES->Module").is_none());
    }
}
