//! Evidence, mentions and results exchanged between engine stages.

use crate::graph::{GraphNode, PathMatch, Row, Triplet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Where an entity mention came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Rule,
    Model,
}

/// A candidate entity extracted from the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    #[serde(rename = "type")]
    pub entity_type: String,
    /// SKU, model number or short description
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    /// Type-specific key, e.g. `base-for:smoke detector`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub provenance: Provenance,
}

impl EntityMention {
    pub fn new(
        entity_type: impl Into<String>,
        identifier: impl Into<String>,
        provenance: Provenance,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            identifier: identifier.into(),
            quantity: None,
            role: None,
            provenance,
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Key used when merging rule and model mentions.
    pub fn merge_key(&self) -> String {
        match &self.role {
            Some(role) if role.starts_with("base-for:") => role.to_lowercase(),
            _ => self.identifier.trim().to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
}

/// A mention resolved to a graph node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedEntity {
    pub mention: EntityMention,
    pub node: GraphNode,
    pub match_type: MatchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// One row returned by an analyzer query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRow {
    pub purpose: String,
    pub row: Row,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    EntityLink,
    Path,
    Query,
    Triplet,
}

impl RetrievalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntityLink => "entity_link",
            Self::Path => "path",
            Self::Query => "query",
            Self::Triplet => "triplet",
        }
    }
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieved evidence, one variant per strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", content = "payload", rename_all = "snake_case")]
pub enum Evidence {
    EntityLink(LinkedEntity),
    Path(PathMatch),
    Query(QueryRow),
    Triplet(Triplet),
}

fn is_identifier_column(column: &str) -> bool {
    column == "identifier" || column == "sku" || column.ends_with("_sku") || column.ends_with("_id")
}

fn node_label(node: &GraphNode) -> String {
    format!("{} {} ({})", node.node_type, node.identifier, node.name)
}

fn node_text(node: &GraphNode, out: &mut Vec<String>) {
    out.push(node.node_type.clone());
    out.push(node.identifier.clone());
    if let Some(secondary) = &node.secondary_id {
        out.push(secondary.clone());
    }
    out.push(node.name.clone());
    for (key, value) in &node.attributes {
        out.push(format!("{} {}", key, value_text(value)));
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl Evidence {
    pub fn method(&self) -> RetrievalMethod {
        match self {
            Self::EntityLink(_) => RetrievalMethod::EntityLink,
            Self::Path(_) => RetrievalMethod::Path,
            Self::Query(_) => RetrievalMethod::Query,
            Self::Triplet(_) => RetrievalMethod::Triplet,
        }
    }

    /// Canonical deduplication key.
    pub fn signature(&self) -> String {
        match self {
            Self::EntityLink(linked) => format!("entity_link:{}", linked.node.key()),
            Self::Path(path) => {
                let edges: Vec<String> = path.edges.iter().map(|e| e.key()).collect();
                format!("path:{}", edges.join("|"))
            }
            // serde_json maps are key-ordered, so this is canonical
            Self::Query(row) => format!("query:{}", Value::Object(row.row.clone())),
            Self::Triplet(triplet) => format!("triplet:{}", triplet.edge.key()),
        }
    }

    /// Nodes carried by the payload.
    pub fn nodes(&self) -> Vec<&GraphNode> {
        match self {
            Self::EntityLink(linked) => vec![&linked.node],
            Self::Path(path) => path.nodes.iter().collect(),
            Self::Query(_) => Vec::new(),
            Self::Triplet(triplet) => vec![&triplet.source, &triplet.target],
        }
    }

    /// Identifier-like values in the payload.
    pub fn identifiers(&self) -> Vec<String> {
        match self {
            Self::Query(row) => row
                .row
                .iter()
                .filter(|(column, _)| is_identifier_column(column))
                .filter_map(|(_, value)| value.as_str().map(str::to_string))
                .collect(),
            _ => self
                .nodes()
                .into_iter()
                .flat_map(|node| {
                    std::iter::once(node.identifier.clone()).chain(node.secondary_id.clone())
                })
                .collect(),
        }
    }

    /// Longest description in the payload.
    pub fn description(&self) -> Option<String> {
        let from_nodes = self
            .nodes()
            .into_iter()
            .filter_map(|node| node.description().map(str::to_string));
        let from_row = match self {
            Self::Query(row) => row
                .row
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        from_nodes.chain(from_row).max_by_key(|d| d.len())
    }

    /// Flattened text used for relevance scoring.
    pub fn text(&self) -> String {
        let mut parts = Vec::new();
        match self {
            Self::EntityLink(linked) => {
                parts.push(linked.mention.identifier.clone());
                node_text(&linked.node, &mut parts);
            }
            Self::Path(path) => {
                for node in &path.nodes {
                    node_text(node, &mut parts);
                }
                for edge in &path.edges {
                    parts.push(edge.rel_type.replace('_', " ").to_lowercase());
                    parts.extend(edge.notes().map(str::to_string));
                }
            }
            Self::Query(row) => {
                parts.push(row.purpose.clone());
                for (column, value) in &row.row {
                    parts.push(format!("{} {}", column, value_text(value)));
                }
            }
            Self::Triplet(triplet) => {
                node_text(&triplet.source, &mut parts);
                parts.push(triplet.edge.rel_type.replace('_', " ").to_lowercase());
                parts.extend(triplet.edge.notes().map(str::to_string));
                node_text(&triplet.target, &mut parts);
            }
        }
        parts.join(" ")
    }

    /// One-line rendering for prompts and summaries.
    pub fn render(&self) -> String {
        match self {
            Self::EntityLink(linked) => {
                let mut line = format!(
                    "{} matched '{}' ({:?}",
                    node_label(&linked.node),
                    linked.mention.identifier,
                    linked.match_type
                );
                if let Some(score) = linked.score {
                    line.push_str(&format!(" {:.2}", score));
                }
                line.push(')');
                if let Some(quantity) = linked.mention.quantity {
                    line.push_str(&format!(", quantity {}", quantity));
                }
                if let Some(description) = linked.node.description() {
                    line.push_str(&format!(": {}", description));
                }
                line
            }
            Self::Path(path) => {
                let mut line = path
                    .nodes
                    .first()
                    .map(node_label)
                    .unwrap_or_default();
                for (edge, node) in path.edges.iter().zip(path.nodes.iter().skip(1)) {
                    let forward = edge.to.identifier == node.identifier
                        && edge.to.node_type == node.node_type;
                    if forward {
                        line.push_str(&format!(" -{}-> ", edge.rel_type));
                    } else {
                        line.push_str(&format!(" <-{}- ", edge.rel_type));
                    }
                    line.push_str(&node_label(node));
                }
                line
            }
            Self::Query(row) => {
                let fields: Vec<String> = row
                    .row
                    .iter()
                    .map(|(column, value)| format!("{}={}", column, value_text(value)))
                    .collect();
                format!("{}: {}", row.purpose, fields.join(", "))
            }
            Self::Triplet(triplet) => {
                let mut line = format!(
                    "{} -{}-> {}",
                    node_label(&triplet.source),
                    triplet.edge.rel_type,
                    node_label(&triplet.target)
                );
                if let Some(notes) = triplet.edge.notes() {
                    line.push_str(&format!(" ({})", notes));
                }
                line
            }
        }
    }
}

/// Evidence that passed the filter, annotated for ranking.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceItem {
    #[serde(flatten)]
    pub evidence: Evidence,
    pub confidence: f64,
    pub relevance: f64,
    /// Round that discovered the item (0-based)
    pub iteration: usize,
    pub signature: String,
}

impl EvidenceItem {
    pub fn method(&self) -> RetrievalMethod {
        self.evidence.method()
    }

    /// Blend used to order evidence.
    pub fn rank(&self) -> f64 {
        0.6 * self.relevance + 0.4 * self.confidence
    }
}

/// Outcome of one retrieval strategy in one round.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MethodStatus {
    Ok { results: usize },
    Skipped,
    Failed { error: String },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodReport {
    pub method: RetrievalMethod,
    #[serde(flatten)]
    pub status: MethodStatus,
}

/// Per-round counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub entities: usize,
    pub paths: usize,
    pub queries: usize,
    pub linked: usize,
    pub methods: Vec<MethodReport>,
    pub retrieved: usize,
    pub new_facts: usize,
    pub total_context: usize,
    pub rejected_queries: usize,
    /// Whether the analyzer's completion call produced usable output
    pub model_ok: bool,
}

fn lenient_quantity<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let quantity = match &value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0).round() as u64)),
        Value::String(s) => s
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|digits| digits.parse().ok()),
        _ => None,
    };
    Ok(quantity.unwrap_or(1).min(u64::from(u32::MAX)) as u32)
}

fn default_quantity() -> u32 {
    1
}

/// One line of the itemized list (bill of quantities).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoqItem {
    #[serde(alias = "name")]
    pub item: String,
    #[serde(default, alias = "identifier")]
    pub sku: String,
    #[serde(default = "default_quantity", deserialize_with = "lenient_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    GraphGrounded,
    BaselineWithGraphItems,
    BaselineOnly,
}

/// How the final narrative was chosen.
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub method_used: SelectionMethod,
    pub baseline_score: f64,
    pub grounded_score: f64,
    pub improvement: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetadata {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    pub iterations: Vec<IterationRecord>,
    pub total_context_items: usize,
    pub unique_facts_discovered: usize,
    pub selection: Selection,
    pub low_confidence: bool,
    pub cancelled: bool,
    pub baseline_answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounded_answer: Option<String>,
}

/// Result of `process_query`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub items: Vec<BoqItem>,
    pub iterations_performed: usize,
    pub metadata: QueryMetadata,
    pub evidence: Vec<EvidenceItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphEdge, NodeRef};
    use serde_json::Map;

    fn node(node_type: &str, identifier: &str, name: &str) -> GraphNode {
        GraphNode {
            node_type: node_type.to_string(),
            identifier: identifier.to_string(),
            secondary_id: None,
            name: name.to_string(),
            attributes: Map::new(),
            source: None,
        }
    }

    #[test]
    fn test_boq_quantity_is_lenient() {
        let items: Vec<BoqItem> = serde_json::from_str(
            r#"[
                {"item": "Smoke detector", "sku": "4098-9714", "quantity": "10 pcs"},
                {"name": "Base", "identifier": "4098-9792", "quantity": 10.0},
                {"item": "Panel", "sku": "4007ES"}
            ]"#,
        )
        .unwrap();
        assert_eq!(items[0].quantity, 10);
        assert_eq!(items[1].sku, "4098-9792");
        assert_eq!(items[1].quantity, 10);
        assert_eq!(items[2].quantity, 1);
    }

    #[test]
    fn test_triplet_signature_ignores_endpoint_attributes() {
        let mut source = node("Detector", "4098-9714", "Smoke");
        let target = node("Base", "4098-9792", "Base");
        let edge = GraphEdge {
            rel_type: "REQUIRES_BASE".to_string(),
            from: NodeRef {
                node_type: "Detector".to_string(),
                identifier: "4098-9714".to_string(),
            },
            to: NodeRef {
                node_type: "Base".to_string(),
                identifier: "4098-9792".to_string(),
            },
            properties: Map::new(),
            weight: 1.0,
        };

        let a = Evidence::Triplet(Triplet {
            source: source.clone(),
            edge: edge.clone(),
            target: target.clone(),
        });
        source.name = "Renamed".to_string();
        let b = Evidence::Triplet(Triplet {
            source,
            edge,
            target,
        });

        assert_eq!(a.signature(), b.signature());
        assert_eq!(
            a.signature(),
            "triplet:Detector:4098-9714-REQUIRES_BASE->Base:4098-9792"
        );
        assert_eq!(a.render(), "Detector 4098-9714 (Smoke) -REQUIRES_BASE-> Base 4098-9792 (Base)");
    }

    #[test]
    fn test_merge_key_prefers_base_role() {
        let mention = EntityMention::new("Base", "detector base", Provenance::Rule)
            .with_role("base-for:Smoke Detector");
        assert_eq!(mention.merge_key(), "base-for:smoke detector");

        let plain = EntityMention::new("Panel", " 4007ES ", Provenance::Model);
        assert_eq!(plain.merge_key(), "4007es");
    }
}
