//! Iterative retrieval loop and final answer selection.
//!
//! A run moves through fixed phases: the baseline answer first, then up to
//! `max_iterations` rounds of analyze, retrieve and filter, then grounded
//! synthesis and the comparison that picks the returned narrative. Rounds
//! after the first stop early once they discover nothing new.

use crate::analyzer::{QueryAnalyzer, RuleFindings};
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::graph::{GraphSchema, GraphStore};
use crate::judge::{Judge, LlmJudge, Winner};
use crate::retriever::Retriever;
use crate::scoring::ScoringFilter;
use crate::session::Session;
use crate::synthesis::Synthesizer;
use crate::types::{
    BoqItem, Evidence, IterationRecord, QueryAnswer, QueryMetadata, Selection, SelectionMethod,
};
use chrono::Utc;
use kgqa_core::{AppError, AppResult};
use kgqa_llm::LlmClient;
use kgqa_prompt::PromptLibrary;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Baseline,
    Analyze,
    Retrieve,
    Filter,
    Synthesize,
    Compare,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Baseline => "baseline",
            Self::Analyze => "analyze",
            Self::Retrieve => "retrieve",
            Self::Filter => "filter",
            Self::Synthesize => "synthesize",
            Self::Compare => "compare",
        };
        f.write_str(name)
    }
}

/// Counters a round reports back to the loop.
struct RoundOutcome {
    new_facts: usize,
    findings: RuleFindings,
}

pub struct Orchestrator {
    analyzer: QueryAnalyzer,
    retriever: Retriever,
    filter: ScoringFilter,
    synthesizer: Synthesizer,
    judge: Arc<dyn Judge>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn GraphStore>,
        prompts: Arc<PromptLibrary>,
        config: EngineConfig,
    ) -> Self {
        let model = config.model.clone();
        Self {
            analyzer: QueryAnalyzer::new(
                Arc::clone(&llm),
                Arc::clone(&prompts),
                config.rules.clone(),
                config.calls.analyzer.clone(),
                model.clone(),
            ),
            retriever: Retriever::new(store, config.linking.clone(), config.limits.clone()),
            filter: ScoringFilter::new(config.min_relevance),
            synthesizer: Synthesizer::new(
                Arc::clone(&llm),
                Arc::clone(&prompts),
                config.calls.baseline.clone(),
                config.calls.grounded.clone(),
                model.clone(),
            )
            .with_high_confidence(config.high_confidence)
            .with_item_restriction(config.restrict_items_to_evidence),
            judge: Arc::new(LlmJudge::new(llm, prompts, config.calls.judge.clone(), model)),
            config,
        }
    }

    /// Replace the completion-backed judge.
    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_schema(mut self, schema: GraphSchema) -> Self {
        self.analyzer = self.analyzer.with_schema(schema);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Confidence of a fresh item: method base plus payload boosts, capped at 1.
    pub fn confidence(&self, evidence: &Evidence) -> f64 {
        let table = &self.config.confidence;
        let mut confidence = table.base(evidence.method());
        if !evidence.identifiers().is_empty() {
            confidence += table.identifier_boost;
        }
        if evidence
            .description()
            .is_some_and(|d| d.chars().count() > table.description_min_len)
        {
            confidence += table.description_boost;
        }
        confidence.min(1.0)
    }

    pub async fn process_query(&self, query: &str, max_iterations: usize) -> AppResult<QueryAnswer> {
        self.process_query_with_cancel(query, max_iterations, &CancellationToken::new())
            .await
    }

    /// Run the full pipeline. `max_iterations` of 0 means the configured
    /// default. Cancellation is honoured between rounds and yields the
    /// baseline answer.
    pub async fn process_query_with_cancel(
        &self,
        query: &str,
        max_iterations: usize,
        cancel: &CancellationToken,
    ) -> AppResult<QueryAnswer> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::Other("Query must not be empty".to_string()));
        }

        let max_iterations = if max_iterations == 0 {
            self.config.max_iterations
        } else {
            max_iterations
        };

        let session = Session::new();
        let span = tracing::info_span!("query", session = %session.id());
        self.run(query, max_iterations, session, cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        query: &str,
        max_iterations: usize,
        mut session: Session,
        cancel: &CancellationToken,
    ) -> AppResult<QueryAnswer> {
        tracing::info!("Processing query with up to {} round(s)", max_iterations);

        tracing::debug!("Phase {}", Phase::Baseline);
        let baseline = self.synthesizer.baseline(query).await;

        let mut findings = RuleFindings::default();
        let mut cancelled = false;
        for round in 0..max_iterations {
            if cancel.is_cancelled() {
                tracing::info!("Cancelled before round {}", round + 1);
                cancelled = true;
                break;
            }

            let span = tracing::info_span!("round", n = round + 1);
            let outcome = self
                .run_round(query, round, &mut session)
                .instrument(span)
                .await;
            findings = outcome.findings;

            if round >= 1 && outcome.new_facts == 0 {
                tracing::info!("No new facts in round {}, stopping early", round + 1);
                break;
            }
        }

        if cancelled {
            return Ok(self.baseline_answer(
                baseline,
                session,
                true,
                "Query was cancelled; returning the ungrounded answer.",
            ));
        }
        if session.evidence().is_empty() {
            tracing::warn!("No graph evidence found; returning the baseline answer");
            return Ok(self.baseline_answer(
                baseline,
                session,
                false,
                "No graph evidence was found; returning the ungrounded answer.",
            ));
        }

        tracing::debug!("Phase {}", Phase::Synthesize);
        let grounded = self
            .synthesizer
            .grounded(query, session.evidence(), &findings)
            .await;

        tracing::debug!("Phase {}", Phase::Compare);
        let verdict = self.judge.judge(query, &baseline, &grounded.narrative).await;
        let (answer, method_used) = match verdict.winner {
            Winner::Grounded => (grounded.narrative.clone(), SelectionMethod::GraphGrounded),
            Winner::Baseline => (baseline.clone(), SelectionMethod::BaselineWithGraphItems),
        };
        tracing::info!(
            "Selected {:?} (baseline {:.1}, grounded {:.1})",
            method_used,
            verdict.baseline_score,
            verdict.grounded_score
        );

        let selection = Selection {
            method_used,
            baseline_score: verdict.baseline_score,
            grounded_score: verdict.grounded_score,
            improvement: verdict.grounded_score - verdict.baseline_score,
            reasoning: verdict.reasoning,
        };

        Ok(Self::finish(
            answer,
            grounded.items,
            session,
            selection,
            baseline,
            Some(grounded.narrative),
            false,
            false,
        ))
    }

    async fn run_round(&self, query: &str, round: usize, session: &mut Session) -> RoundOutcome {
        let context = session.progressive_context(
            self.config.high_confidence,
            self.config.high_context_limit,
        );

        tracing::debug!("Phase {}", Phase::Analyze);
        let analysis = self.analyzer.analyze(query, context.as_deref(), round).await;

        tracing::debug!("Phase {}", Phase::Retrieve);
        let retrieval = self.retriever.retrieve(&analysis).await;
        let retrieved = retrieval.evidence.len();

        tracing::debug!("Phase {}", Phase::Filter);
        let candidates: Vec<(Evidence, f64)> = retrieval
            .evidence
            .into_iter()
            .map(|evidence| {
                let confidence = self.confidence(&evidence);
                (evidence, confidence)
            })
            .collect();
        let admitted = self.filter.filter(query, candidates, session, round);

        let record = IterationRecord {
            iteration: round,
            entities: analysis.entities.len(),
            paths: analysis.paths.len(),
            queries: analysis.queries.len(),
            linked: retrieval.linked,
            methods: retrieval.reports,
            retrieved,
            new_facts: admitted.len(),
            total_context: session.evidence().len(),
            rejected_queries: retrieval.rejected_queries,
            model_ok: analysis.model_ok,
        };
        tracing::info!(
            "Round {}: {} retrieved, {} new, {} in context",
            round + 1,
            record.retrieved,
            record.new_facts,
            record.total_context
        );
        session.push_record(record);

        RoundOutcome {
            new_facts: admitted.len(),
            findings: analysis.findings,
        }
    }

    fn baseline_answer(
        &self,
        baseline: String,
        session: Session,
        cancelled: bool,
        reasoning: &str,
    ) -> QueryAnswer {
        let selection = Selection {
            method_used: SelectionMethod::BaselineOnly,
            baseline_score: 0.0,
            grounded_score: 0.0,
            improvement: 0.0,
            reasoning: reasoning.to_string(),
        };
        let low_confidence = session.evidence().is_empty();
        Self::finish(
            baseline.clone(),
            Vec::new(),
            session,
            selection,
            baseline,
            None,
            low_confidence,
            cancelled,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        answer: String,
        items: Vec<BoqItem>,
        session: Session,
        selection: Selection,
        baseline_answer: String,
        grounded_answer: Option<String>,
        low_confidence: bool,
        cancelled: bool,
    ) -> QueryAnswer {
        let metadata = QueryMetadata {
            session_id: session.id(),
            started_at: session.started_at(),
            elapsed_ms: (Utc::now() - session.started_at()).num_milliseconds(),
            iterations: session.records().to_vec(),
            total_context_items: session.evidence().len(),
            unique_facts_discovered: session.unique_facts(),
            selection,
            low_confidence,
            cancelled,
            baseline_answer,
            grounded_answer,
        };

        QueryAnswer {
            answer,
            items,
            iterations_performed: metadata.iterations.len(),
            metadata,
            evidence: session.into_evidence(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Row;
    use crate::tests::fixture_graph;
    use crate::types::QueryRow;
    use kgqa_llm::ScriptedClient;
    use serde_json::Value;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(ScriptedClient::new()),
            Arc::new(fixture_graph()),
            Arc::new(PromptLibrary::builtin().unwrap()),
            EngineConfig::default(),
        )
    }

    fn row(pairs: &[(&str, &str)]) -> Evidence {
        let mut row = Row::new();
        for (k, v) in pairs {
            row.insert(k.to_string(), Value::from(*v));
        }
        Evidence::Query(QueryRow {
            purpose: "test".to_string(),
            row,
        })
    }

    #[test]
    fn test_confidence_boosts_and_cap() {
        let orchestrator = orchestrator();
        assert!((orchestrator.confidence(&row(&[("note", "x")])) - 0.8).abs() < 1e-9);
        assert!((orchestrator.confidence(&row(&[("sku", "4098-9714")])) - 0.9).abs() < 1e-9);

        let long = "A".repeat(60);
        let boosted = orchestrator.confidence(&row(&[
            ("sku", "4098-9714"),
            ("description", long.as_str()),
        ]));
        assert_eq!(boosted, 1.0);
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        assert!(orchestrator().process_query("   ", 2).await.is_err());
    }
}
