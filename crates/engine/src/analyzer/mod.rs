//! Query analysis: rule extraction merged with one completion call.
//!
//! The model answers a single JSON contract (entities, paths, queries,
//! draft answer). Its output is the base; rule findings the model missed
//! are appended with `rule` provenance. A failed or unparseable call
//! leaves the rule findings on their own.

pub mod rules;

use crate::config::{CallSettings, RulesConfig};
use crate::extract::parse_lenient;
use crate::graph::{GraphQuery, GraphSchema, PathSpec};
use crate::types::{EntityMention, Provenance};
use kgqa_llm::LlmClient;
use kgqa_prompt::library::ANALYZER_EXTRACT;
use kgqa_prompt::PromptLibrary;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use rules::{RuleExtractor, RuleFindings};

/// Structured request produced for one round.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerOutput {
    pub entities: Vec<EntityMention>,
    pub paths: Vec<PathSpec>,
    pub queries: Vec<GraphQuery>,
    pub draft_answer: String,
    pub findings: RuleFindings,
    /// The completion call returned parseable output
    pub model_ok: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelAnalysis {
    #[serde(default)]
    entities: Vec<Value>,
    #[serde(default)]
    paths: Vec<Value>,
    #[serde(default)]
    queries: Vec<Value>,
    #[serde(default)]
    draft_answer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelEntity {
    #[serde(default, rename = "type")]
    entity_type: Option<String>,
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    quantity: Option<Value>,
    #[serde(default)]
    required_for: Option<String>,
}

impl ModelEntity {
    fn into_mention(self) -> Option<EntityMention> {
        let entity_type = self.entity_type.filter(|t| !t.trim().is_empty())?;
        let identifier = self
            .identifier
            .or(self.sku)
            .or(self.name)
            .or(self.description)
            .filter(|i| !i.trim().is_empty())?;

        let mut mention = EntityMention::new(entity_type.trim(), identifier.trim(), Provenance::Model);
        if let Some(quantity) = self.quantity.as_ref().and_then(quantity_value) {
            mention = mention.with_quantity(quantity);
        }
        if let Some(required_for) = self.required_for.filter(|r| !r.trim().is_empty()) {
            mention = mention.with_role(format!(
                "base-for:{}",
                required_for.trim().replace('_', " ")
            ));
        }
        Some(mention)
    }
}

fn quantity_value(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().map(|q| q.min(u64::from(u32::MAX)) as u32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PathRepr {
    Text(String),
    Steps(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct ModelQuery {
    #[serde(default)]
    purpose: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    parameters: Map<String, Value>,
}

fn parse_path(value: Value) -> Option<PathSpec> {
    let text = match serde_json::from_value::<PathRepr>(value).ok()? {
        PathRepr::Text(text) => text,
        PathRepr::Steps(steps) => steps.join("->"),
    };
    let parsed = PathSpec::parse(&text);
    if parsed.is_none() {
        tracing::debug!("Ignoring unparseable path '{}'", text);
    }
    parsed
}

fn parse_query(value: Value) -> Option<GraphQuery> {
    let query: ModelQuery = serde_json::from_value(value).ok()?;
    let text = query.query.or(query.sql).filter(|t| !t.trim().is_empty())?;
    Some(GraphQuery {
        purpose: query.purpose.unwrap_or_else(|| "model query".to_string()),
        text,
        parameters: query.parameters,
        max_rows: None,
    })
}

/// Merge rule mentions into the model's list. Rule mentions whose identifier
/// or type-specific key is already present are dropped, but may fill in a
/// missing quantity.
pub fn merge_mentions(model: Vec<EntityMention>, rules: Vec<EntityMention>) -> Vec<EntityMention> {
    let mut merged = model;

    for rule in rules {
        let existing = merged.iter_mut().find(|m| {
            m.merge_key() == rule.merge_key() || m.identifier.eq_ignore_ascii_case(&rule.identifier)
        });
        match existing {
            Some(found) => {
                if found.quantity.is_none() {
                    found.quantity = rule.quantity;
                }
            }
            None => merged.push(rule),
        }
    }

    merged
}

/// Turns a query plus running context into entities, paths and queries.
pub struct QueryAnalyzer {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    schema: GraphSchema,
    rules: RuleExtractor,
    settings: CallSettings,
    model: String,
}

impl QueryAnalyzer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        rules: RulesConfig,
        settings: CallSettings,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            prompts,
            schema: GraphSchema::default(),
            rules: RuleExtractor::new(rules),
            settings,
            model: model.into(),
        }
    }

    pub fn with_schema(mut self, schema: GraphSchema) -> Self {
        self.schema = schema;
        self
    }

    async fn ask_model(
        &self,
        query: &str,
        context: Option<&str>,
        iteration: usize,
    ) -> Option<ModelAnalysis> {
        let mut variables = HashMap::new();
        variables.insert("query".to_string(), query.to_string());
        variables.insert("schema".to_string(), self.schema.describe());
        variables.insert("iteration".to_string(), (iteration + 1).to_string());
        if let Some(context) = context {
            variables.insert("context".to_string(), context.to_string());
        }

        let prompt = match self.prompts.build(ANALYZER_EXTRACT, variables) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!("Failed to build analyzer prompt: {}", e);
                return None;
            }
        };

        let request = self.settings.request(&prompt, &self.model);
        let response = match self.llm.complete(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Analyzer completion failed, using rules only: {}", e);
                return None;
            }
        };

        let (analysis, extraction) = parse_lenient::<ModelAnalysis>(&response.content);
        if !extraction.is_parsed() {
            tracing::warn!("Analyzer output was not valid JSON, using rules only");
            return None;
        }
        tracing::debug!("Analyzer output parsed via {:?}", extraction);
        Some(analysis)
    }

    /// Analyze `query` for round `iteration` (0-based).
    pub async fn analyze(
        &self,
        query: &str,
        context: Option<&str>,
        iteration: usize,
    ) -> AnalyzerOutput {
        let findings = self.rules.extract(query);
        let analysis = self.ask_model(query, context, iteration).await;
        let model_ok = analysis.is_some();
        let analysis = analysis.unwrap_or_default();

        let model_mentions: Vec<EntityMention> = analysis
            .entities
            .into_iter()
            .filter_map(|value| serde_json::from_value::<ModelEntity>(value).ok())
            .filter_map(ModelEntity::into_mention)
            .collect();
        let entities = merge_mentions(model_mentions, findings.mentions());

        let mut seen_paths = HashSet::new();
        let paths: Vec<PathSpec> = analysis
            .paths
            .into_iter()
            .filter_map(parse_path)
            .chain(findings.paths().iter().filter_map(|p| PathSpec::parse(p)))
            .filter(|path| seen_paths.insert(path.to_string()))
            .collect();

        let mut seen_queries = HashSet::new();
        let queries: Vec<GraphQuery> = analysis
            .queries
            .into_iter()
            .filter_map(parse_query)
            .chain(findings.queries())
            .filter(|query| seen_queries.insert(query.text.clone()))
            .collect();

        let draft_answer = analysis
            .draft_answer
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| findings.summary());

        tracing::info!(
            "Analyzer round {}: {} entities, {} paths, {} queries (model {})",
            iteration + 1,
            entities.len(),
            paths.len(),
            queries.len(),
            if model_ok { "ok" } else { "unavailable" }
        );

        AnalyzerOutput {
            entities,
            paths,
            queries,
            draft_answer,
            findings,
            model_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgqa_llm::ScriptedClient;

    fn analyzer(client: ScriptedClient) -> QueryAnalyzer {
        QueryAnalyzer::new(
            Arc::new(client),
            Arc::new(PromptLibrary::builtin().unwrap()),
            RulesConfig::default(),
            CallSettings {
                model: None,
                temperature: 0.1,
                max_tokens: 2000,
            },
            "test-model",
        )
    }

    #[tokio::test]
    async fn test_failed_model_degrades_to_rules() {
        let analyzer = analyzer(ScriptedClient::failing());
        let output = analyzer
            .analyze("I need 10 smoke detectors for a small office", None, 0)
            .await;

        assert!(!output.model_ok);
        assert_eq!(output.entities.len(), 3);
        assert!(output
            .entities
            .iter()
            .all(|e| e.provenance == Provenance::Rule));
        assert!(output
            .paths
            .iter()
            .any(|p| p.to_string() == "Detector->REQUIRES_BASE->Base"));
        assert!(!output.queries.is_empty());
        assert!(output.draft_answer.contains("4007ES"));
    }

    #[tokio::test]
    async fn test_model_entities_are_the_base() {
        let response = r#"Sure!
```json
{
  "entities": [
    {"type": "Detector", "sku": "4098-9714", "quantity": 10},
    {"type": "Base", "identifier": "4098-9792", "required_for": "smoke_detector"},
    {"identifier": "missing type"}
  ],
  "paths": ["Panel->HAS_MODULE->Module", ["Detector", "COMPATIBLE_WITH", "Panel"], "bogus"],
  "queries": [{"purpose": "panels", "sql": "SELECT identifier FROM nodes WHERE node_type = 'Panel'"}],
  "draft_answer": "Use a 4007ES with 10 detectors."
}
```"#;
        let analyzer = analyzer(ScriptedClient::new().with_fallback(response));
        let output = analyzer
            .analyze("I need 10 smoke detectors for a small office", None, 0)
            .await;

        assert!(output.model_ok);
        assert_eq!(output.entities[0].identifier, "4098-9714");
        assert_eq!(output.entities[0].provenance, Provenance::Model);

        // The base requirement is already covered by the model's base entity
        let bases: Vec<_> = output
            .entities
            .iter()
            .filter(|e| e.entity_type == "Base")
            .collect();
        assert_eq!(bases.len(), 1);
        assert_eq!(bases[0].quantity, Some(10));

        // Rule mentions the model missed are appended
        assert!(output
            .entities
            .iter()
            .any(|e| e.identifier == "4007ES" && e.provenance == Provenance::Rule));

        // Duplicate rule paths are not repeated
        let path_texts: Vec<String> = output.paths.iter().map(|p| p.to_string()).collect();
        assert_eq!(
            path_texts
                .iter()
                .filter(|p| p.as_str() == "Panel->HAS_MODULE->Module")
                .count(),
            1
        );
        assert_eq!(output.queries[0].purpose, "panels");
        assert_eq!(output.draft_answer, "Use a 4007ES with 10 detectors.");
    }

    #[test]
    fn test_merge_by_identifier_case_insensitive() {
        let model = vec![EntityMention::new("Panel", "4007es", Provenance::Model)];
        let rules = vec![EntityMention::new("Panel", "4007ES", Provenance::Rule).with_quantity(1)];
        let merged = merge_mentions(model, rules);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].quantity, Some(1));
        assert_eq!(merged[0].provenance, Provenance::Model);
    }
}
