//! Baseline and graph-grounded answer generation.

use crate::analyzer::RuleFindings;
use crate::config::CallSettings;
use crate::extract::{narrative_before_json, parse_lenient};
use crate::types::{BoqItem, EvidenceItem};
use kgqa_core::AppResult;
use kgqa_llm::LlmClient;
use kgqa_prompt::library::{ANSWER_BASELINE, ANSWER_GROUNDED};
use kgqa_prompt::PromptLibrary;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const BASELINE_FAILURE: &str = "Unable to generate baseline answer.";
pub const GROUNDED_FAILURE: &str = "Unable to generate a complete answer due to an error.";

const PRODUCT_LIMIT: usize = 10;

/// Itemized list as a bare array or wrapped in an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BoqPayload {
    List(Vec<BoqItem>),
    Wrapped {
        #[serde(alias = "bill_of_quantities", alias = "boq")]
        items: Vec<BoqItem>,
    },
}

impl Default for BoqPayload {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl BoqPayload {
    fn into_items(self) -> Vec<BoqItem> {
        match self {
            Self::List(items) | Self::Wrapped { items } => items,
        }
    }
}

/// Grounded narrative plus its itemized list.
#[derive(Debug, Clone, Default)]
pub struct GroundedAnswer {
    pub narrative: String,
    pub items: Vec<BoqItem>,
    /// Items removed because their SKU was not in the evidence
    pub dropped: usize,
}

/// Evidence digest handed to the grounded prompt.
pub fn summarize(evidence: &[EvidenceItem], high_confidence: f64, findings: &RuleFindings) -> String {
    let mut ranked: Vec<&EvidenceItem> = evidence.iter().collect();
    ranked.sort_by(|a, b| b.rank().total_cmp(&a.rank()));
    let (high, rest): (Vec<&EvidenceItem>, Vec<&EvidenceItem>) = ranked
        .into_iter()
        .partition(|item| item.confidence > high_confidence);

    let mut sections = Vec::new();
    if !high.is_empty() {
        let mut lines = vec!["=== HIGH CONFIDENCE FINDINGS ===".to_string()];
        lines.extend(high.iter().map(|item| {
            format!(
                "- [{}] {} (confidence {:.2})",
                item.method(),
                item.evidence.render(),
                item.confidence
            )
        }));
        sections.push(lines.join("\n"));
    }
    if !rest.is_empty() {
        let mut lines = vec!["=== SUPPORTING EVIDENCE ===".to_string()];
        lines.extend(
            rest.iter()
                .map(|item| format!("- [{}] {}", item.method(), item.evidence.render())),
        );
        sections.push(lines.join("\n"));
    }

    let mut seen = HashSet::new();
    let products: Vec<String> = evidence
        .iter()
        .flat_map(|item| item.evidence.nodes())
        .filter(|node| seen.insert(node.identifier.to_lowercase()))
        .take(PRODUCT_LIMIT)
        .map(|node| format!("- {} (SKU: {}, {})", node.name, node.identifier, node.node_type))
        .collect();
    if !products.is_empty() {
        sections.push(format!("=== AVAILABLE PRODUCTS ===\n{}", products.join("\n")));
    }

    let sizing = findings.summary();
    if !sizing.is_empty() {
        sections.push(format!("=== SIZING ===\n{}", sizing));
    }

    sections.join("\n\n")
}

/// Split a grounded completion into narrative and items. With `restrict`,
/// items whose SKU does not appear in the evidence are dropped.
pub fn parse_grounded(text: &str, evidence: &[EvidenceItem], restrict: bool) -> GroundedAnswer {
    let narrative = narrative_before_json(text);
    let (payload, _) = parse_lenient::<BoqPayload>(text);
    let items = payload.into_items();

    if !restrict {
        return GroundedAnswer {
            narrative,
            items,
            dropped: 0,
        };
    }

    let known: HashSet<String> = evidence
        .iter()
        .flat_map(|item| item.evidence.identifiers())
        .map(|id| id.to_lowercase())
        .collect();

    let total = items.len();
    let items: Vec<BoqItem> = items
        .into_iter()
        .filter(|item| {
            let grounded = known.contains(&item.sku.trim().to_lowercase());
            if !grounded {
                tracing::debug!("Dropping item '{}' with unknown SKU '{}'", item.item, item.sku);
            }
            grounded
        })
        .collect();

    GroundedAnswer {
        narrative,
        dropped: total - items.len(),
        items,
    }
}

/// Produces both candidate answers.
pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    baseline: CallSettings,
    grounded: CallSettings,
    model: String,
    high_confidence: f64,
    restrict_items: bool,
}

impl Synthesizer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        baseline: CallSettings,
        grounded: CallSettings,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            prompts,
            baseline,
            grounded,
            model: model.into(),
            high_confidence: 0.8,
            restrict_items: true,
        }
    }

    pub fn with_high_confidence(mut self, threshold: f64) -> Self {
        self.high_confidence = threshold;
        self
    }

    pub fn with_item_restriction(mut self, restrict: bool) -> Self {
        self.restrict_items = restrict;
        self
    }

    async fn complete(
        &self,
        id: &str,
        settings: &CallSettings,
        variables: HashMap<String, String>,
    ) -> AppResult<String> {
        let prompt = self.prompts.build(id, variables)?;
        let response = self.llm.complete(&settings.request(&prompt, &self.model)).await?;
        Ok(response.content)
    }

    /// Answer from the model alone.
    pub async fn baseline(&self, query: &str) -> String {
        let variables = HashMap::from([("query".to_string(), query.to_string())]);
        match self.complete(ANSWER_BASELINE, &self.baseline, variables).await {
            Ok(content) if !content.trim().is_empty() => content.trim().to_string(),
            Ok(_) => {
                tracing::warn!("Baseline completion was empty");
                BASELINE_FAILURE.to_string()
            }
            Err(e) => {
                tracing::warn!("Baseline completion failed: {}", e);
                BASELINE_FAILURE.to_string()
            }
        }
    }

    /// Answer from the accumulated evidence.
    pub async fn grounded(
        &self,
        query: &str,
        evidence: &[EvidenceItem],
        findings: &RuleFindings,
    ) -> GroundedAnswer {
        let digest = summarize(evidence, self.high_confidence, findings);
        let variables = HashMap::from([
            ("query".to_string(), query.to_string()),
            ("evidence".to_string(), digest),
        ]);

        let content = match self.complete(ANSWER_GROUNDED, &self.grounded, variables).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Grounded completion failed: {}", e);
                return GroundedAnswer {
                    narrative: GROUNDED_FAILURE.to_string(),
                    ..Default::default()
                };
            }
        };

        let mut answer = parse_grounded(&content, evidence, self.restrict_items);
        if answer.narrative.is_empty() {
            answer.narrative = findings.summary();
        }
        if answer.dropped > 0 {
            tracing::info!("Dropped {} item(s) not found in the graph", answer.dropped);
        }
        answer
    }
}
