//! Two-candidate answer selection.

use crate::config::CallSettings;
use crate::extract::parse_lenient;
use kgqa_llm::LlmClient;
use kgqa_prompt::library::ANSWER_JUDGE;
use kgqa_prompt::PromptLibrary;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

const NEUTRAL_SCORE: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Baseline,
    Grounded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub baseline_score: f64,
    pub grounded_score: f64,
    pub winner: Winner,
    pub reasoning: String,
    /// False when the verdict is the neutral fallback
    pub parsed: bool,
}

impl Verdict {
    /// Grounded answer preferred with equal scores.
    pub fn neutral(reasoning: impl Into<String>) -> Self {
        Self {
            baseline_score: NEUTRAL_SCORE,
            grounded_score: NEUTRAL_SCORE,
            winner: Winner::Grounded,
            reasoning: reasoning.into(),
            parsed: false,
        }
    }
}

/// Scores an ungrounded baseline against the graph-grounded answer.
#[async_trait::async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, query: &str, baseline: &str, grounded: &str) -> Verdict;
}

#[derive(Debug, Default, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    answer_a_score: Option<Value>,
    #[serde(default)]
    answer_b_score: Option<Value>,
    #[serde(default)]
    better_answer: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

fn score_value(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.split('/').next()?.trim().parse().ok(),
        _ => None,
    }
}

fn winner_label(label: &str) -> Option<Winner> {
    let label = label.trim().to_uppercase();
    let label = label.strip_prefix("ANSWER").unwrap_or(&label).trim();
    match label {
        "A" => Some(Winner::Baseline),
        "B" => Some(Winner::Grounded),
        _ => None,
    }
}

impl RawVerdict {
    /// Answer A is the baseline, answer B the grounded candidate.
    fn into_verdict(self) -> Option<Verdict> {
        let baseline = score_value(self.answer_a_score.as_ref());
        let grounded = score_value(self.answer_b_score.as_ref());
        let declared = self.better_answer.as_deref().and_then(winner_label);

        let winner = match (declared, baseline, grounded) {
            (Some(winner), _, _) => winner,
            (None, Some(a), Some(b)) if a > b => Winner::Baseline,
            (None, Some(_), Some(_)) => Winner::Grounded,
            _ => return None,
        };

        Some(Verdict {
            baseline_score: baseline.unwrap_or(NEUTRAL_SCORE),
            grounded_score: grounded.unwrap_or(NEUTRAL_SCORE),
            winner,
            reasoning: self.reasoning.unwrap_or_default(),
            parsed: true,
        })
    }
}

/// Judge backed by one completion call.
pub struct LlmJudge {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    settings: CallSettings,
    model: String,
}

impl LlmJudge {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        settings: CallSettings,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            prompts,
            settings,
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl Judge for LlmJudge {
    async fn judge(&self, query: &str, baseline: &str, grounded: &str) -> Verdict {
        let mut variables = HashMap::new();
        variables.insert("query".to_string(), query.to_string());
        variables.insert("baseline".to_string(), baseline.to_string());
        variables.insert("grounded".to_string(), grounded.to_string());

        let prompt = match self.prompts.build(ANSWER_JUDGE, variables) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!("Failed to build judge prompt: {}", e);
                return Verdict::neutral("Evaluation unavailable");
            }
        };

        let response = match self.llm.complete(&self.settings.request(&prompt, &self.model)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Judge completion failed: {}", e);
                return Verdict::neutral("Evaluation unavailable");
            }
        };

        let (raw, _) = parse_lenient::<RawVerdict>(&response.content);
        match raw.into_verdict() {
            Some(verdict) => verdict,
            None => {
                tracing::warn!("Judge verdict could not be parsed; preferring grounded answer");
                Verdict::neutral("Evaluation could not be parsed")
            }
        }
    }
}

static SKU_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{4}-\d{4}|\d{4}[A-Z]{2})\b").expect("sku pattern is valid")
});
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("number pattern is valid"));

/// Specificity score in [1, 10]: SKUs, figures and length.
pub fn specificity(text: &str) -> f64 {
    let skus = SKU_RE.find_iter(text).count().min(3) as f64;
    let numbers = NUMBER_RE.find_iter(text).count().min(4) as f64;
    let words = text.split_whitespace().count() as f64;
    (1.0 + 2.0 * skus + 0.5 * numbers + (words / 50.0).min(2.0)).min(10.0)
}

/// Deterministic judge preferring the more specific answer; ties go to
/// the grounded answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicJudge;

#[async_trait::async_trait]
impl Judge for HeuristicJudge {
    async fn judge(&self, _query: &str, baseline: &str, grounded: &str) -> Verdict {
        let baseline_score = specificity(baseline);
        let grounded_score = specificity(grounded);
        let winner = if baseline_score > grounded_score {
            Winner::Baseline
        } else {
            Winner::Grounded
        };

        Verdict {
            baseline_score,
            grounded_score,
            winner,
            reasoning: format!(
                "Specificity {:.1} (baseline) vs {:.1} (grounded)",
                baseline_score, grounded_score
            ),
            parsed: true,
        }
    }
}
