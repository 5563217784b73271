//! Multi-strategy retrieval against the graph store.
//!
//! Entity linking, path traversal and declarative queries run concurrently;
//! ego-network retrieval follows once linking has finished. Each strategy
//! runs under its own timeout and a failing strategy only costs its own
//! evidence.

use crate::analyzer::AnalyzerOutput;
use crate::config::{LinkingConfig, RetrievalLimits};
use crate::graph::{GraphNode, GraphQuery, GraphStore, PathSpec, SandboxPolicy};
use crate::linker::EntityLinker;
use crate::types::{Evidence, EntityMention, MethodReport, MethodStatus, QueryRow, RetrievalMethod};
use futures::future::join_all;
use kgqa_core::AppResult;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Evidence and per-method outcomes of one round.
#[derive(Debug, Default)]
pub struct RetrievalOutput {
    pub evidence: Vec<Evidence>,
    pub reports: Vec<MethodReport>,
    pub linked: usize,
    pub rejected_queries: usize,
}

async fn guarded<F>(
    method: RetrievalMethod,
    enabled: bool,
    timeout: Duration,
    work: F,
) -> (Vec<Evidence>, MethodReport)
where
    F: Future<Output = AppResult<Vec<Evidence>>>,
{
    if !enabled {
        return (
            Vec::new(),
            MethodReport {
                method,
                status: MethodStatus::Skipped,
            },
        );
    }

    let (evidence, status) = match tokio::time::timeout(timeout, work).await {
        Ok(Ok(evidence)) => {
            let results = evidence.len();
            (evidence, MethodStatus::Ok { results })
        }
        Ok(Err(e)) => {
            tracing::warn!("Retrieval method {} failed: {}", method, e);
            (
                Vec::new(),
                MethodStatus::Failed {
                    error: e.to_string(),
                },
            )
        }
        Err(_) => {
            tracing::warn!(
                "Retrieval method {} timed out after {}s",
                method,
                timeout.as_secs()
            );
            (Vec::new(), MethodStatus::TimedOut)
        }
    };

    (evidence, MethodReport { method, status })
}

pub struct Retriever {
    store: Arc<dyn GraphStore>,
    linker: EntityLinker,
    sandbox: SandboxPolicy,
    limits: RetrievalLimits,
}

impl Retriever {
    pub fn new(store: Arc<dyn GraphStore>, linking: LinkingConfig, limits: RetrievalLimits) -> Self {
        Self {
            linker: EntityLinker::new(Arc::clone(&store), linking),
            sandbox: SandboxPolicy {
                default_limit: limits.query_row_cap,
            },
            store,
            limits,
        }
    }

    async fn link(&self, mentions: &[EntityMention]) -> AppResult<Vec<Evidence>> {
        Ok(self
            .linker
            .link(mentions)
            .await
            .into_iter()
            .map(Evidence::EntityLink)
            .collect())
    }

    async fn paths(&self, paths: &[PathSpec]) -> AppResult<Vec<Evidence>> {
        let selected = &paths[..paths.len().min(self.limits.max_paths)];
        let results = join_all(
            selected
                .iter()
                .map(|path| self.store.traverse(path, self.limits.path_rows)),
        )
        .await;

        let mut evidence = Vec::new();
        for (path, result) in selected.iter().zip(results) {
            match result {
                Ok(matches) => {
                    tracing::debug!("Path {} matched {} time(s)", path, matches.len());
                    evidence.extend(matches.into_iter().map(Evidence::Path));
                }
                Err(e) => tracing::warn!("Path {} failed: {}", path, e),
            }
        }
        Ok(evidence)
    }

    async fn queries(&self, queries: &[GraphQuery]) -> AppResult<Vec<Evidence>> {
        let results = join_all(queries.iter().map(|query| self.store.query(query))).await;

        let mut evidence = Vec::new();
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(rows) => {
                    tracing::debug!("Query '{}' returned {} row(s)", query.purpose, rows.len());
                    evidence.extend(rows.into_iter().take(self.limits.query_row_cap).map(|row| {
                        Evidence::Query(QueryRow {
                            purpose: query.purpose.clone(),
                            row,
                        })
                    }));
                }
                Err(e) => tracing::warn!("Query '{}' failed: {}", query.purpose, e),
            }
        }
        Ok(evidence)
    }

    async fn triplets(&self, nodes: &[&GraphNode]) -> AppResult<Vec<Evidence>> {
        let results = join_all(nodes.iter().map(|node| {
            self.store.ego_network(
                &node.node_type,
                &node.identifier,
                self.limits.triplets_per_entity,
            )
        }))
        .await;

        let mut evidence = Vec::new();
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(triplets) => evidence.extend(triplets.into_iter().map(Evidence::Triplet)),
                Err(e) => tracing::warn!("Ego network of {} failed: {}", node.key(), e),
            }
        }
        Ok(evidence)
    }

    /// Screen analyzer queries through the sandbox. Rejected queries are
    /// never executed.
    fn sandboxed(&self, queries: &[GraphQuery]) -> (Vec<GraphQuery>, usize) {
        let mut accepted = Vec::new();
        let mut rejected = 0;
        for query in queries {
            match self.sandbox.prepare(&query.text) {
                Ok(text) => accepted.push(GraphQuery {
                    text,
                    max_rows: Some(self.limits.query_row_cap),
                    ..query.clone()
                }),
                Err(violation) => {
                    rejected += 1;
                    tracing::warn!(
                        "Policy violation, query '{}' not executed: {}",
                        query.purpose,
                        violation
                    );
                }
            }
        }
        (accepted, rejected)
    }

    /// Run every applicable strategy for one analyzer output.
    pub async fn retrieve(&self, analysis: &AnalyzerOutput) -> RetrievalOutput {
        let timeout = self.limits.method_timeout();
        let (queries, rejected_queries) = self.sandboxed(&analysis.queries);

        let (linking, paths, rows) = tokio::join!(
            guarded(
                RetrievalMethod::EntityLink,
                !analysis.entities.is_empty(),
                timeout,
                self.link(&analysis.entities),
            ),
            guarded(
                RetrievalMethod::Path,
                !analysis.paths.is_empty(),
                timeout,
                self.paths(&analysis.paths),
            ),
            guarded(
                RetrievalMethod::Query,
                !queries.is_empty(),
                timeout,
                self.queries(&queries),
            ),
        );

        let mut seen = HashSet::new();
        let anchors: Vec<&GraphNode> = linking
            .0
            .iter()
            .filter_map(|evidence| match evidence {
                Evidence::EntityLink(linked) => Some(&linked.node),
                _ => None,
            })
            .filter(|node| seen.insert(node.key()))
            .take(self.limits.max_triplet_entities)
            .collect();

        let triplets = guarded(
            RetrievalMethod::Triplet,
            !anchors.is_empty(),
            timeout,
            self.triplets(&anchors),
        )
        .await;

        let linked = linking.0.len();
        let mut output = RetrievalOutput {
            linked,
            rejected_queries,
            ..Default::default()
        };
        for (evidence, report) in [linking, paths, rows, triplets] {
            output.evidence.extend(evidence);
            output.reports.push(report);
        }

        tracing::info!(
            "Retrieved {} evidence item(s) ({} linked, {} query rejected)",
            output.evidence.len(),
            output.linked,
            output.rejected_queries
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::RuleFindings;
    use crate::graph::{GraphStats, NodeField, PathMatch, Row, Triplet};
    use crate::tests::{fixture_graph, RUNAWAY_QUERY};
    use crate::types::Provenance;
    use kgqa_core::AppError;

    fn retriever() -> Retriever {
        Retriever::new(
            Arc::new(fixture_graph()),
            LinkingConfig::default(),
            RetrievalLimits::default(),
        )
    }

    fn output_with(
        entities: Vec<EntityMention>,
        paths: &[&str],
        queries: Vec<GraphQuery>,
    ) -> AnalyzerOutput {
        AnalyzerOutput {
            entities,
            paths: paths.iter().filter_map(|p| PathSpec::parse(p)).collect(),
            queries,
            draft_answer: String::new(),
            findings: RuleFindings::default(),
            model_ok: true,
        }
    }

    #[tokio::test]
    async fn test_all_strategies_contribute() {
        let analysis = output_with(
            vec![EntityMention::new("Detector", "4098-9714", Provenance::Model)],
            &["Detector->REQUIRES_BASE->Base"],
            vec![GraphQuery::new(
                "panels",
                "SELECT identifier, name FROM nodes WHERE node_type = 'Panel'",
            )],
        );

        let output = retriever().retrieve(&analysis).await;
        assert_eq!(output.linked, 1);
        assert_eq!(output.reports.len(), 4);
        for method in [
            RetrievalMethod::EntityLink,
            RetrievalMethod::Path,
            RetrievalMethod::Query,
            RetrievalMethod::Triplet,
        ] {
            assert!(
                output.evidence.iter().any(|e| e.method() == method),
                "no evidence from {}",
                method
            );
        }
    }

    #[tokio::test]
    async fn test_mutating_query_is_not_executed() {
        let graph = fixture_graph();
        let before = graph.stats().await.unwrap();
        let retriever = Retriever::new(
            Arc::new(graph.clone()),
            LinkingConfig::default(),
            RetrievalLimits::default(),
        );

        let analysis = output_with(
            Vec::new(),
            &[],
            vec![GraphQuery::new("wipe", "delete FROM nodes WHERE 1 = 1")],
        );
        let output = retriever.retrieve(&analysis).await;

        assert!(output.evidence.is_empty());
        assert_eq!(output.rejected_queries, 1);
        assert_eq!(output.reports[2].status, MethodStatus::Skipped);
        assert_eq!(
            graph.stats().await.unwrap().total_nodes(),
            before.total_nodes()
        );
    }

    #[tokio::test]
    async fn test_empty_inputs_skip_every_method() {
        let output = retriever()
            .retrieve(&output_with(Vec::new(), &[], Vec::new()))
            .await;
        assert!(output.evidence.is_empty());
        assert!(output
            .reports
            .iter()
            .all(|r| r.status == MethodStatus::Skipped));
    }

    struct SlowStore;

    #[async_trait::async_trait]
    impl GraphStore for SlowStore {
        async fn lookup(&self, _: &str, _: NodeField, _: &str) -> AppResult<Option<GraphNode>> {
            Ok(None)
        }

        async fn nodes_of_type(&self, _: &str, _: usize) -> AppResult<Vec<GraphNode>> {
            Ok(Vec::new())
        }

        async fn traverse(&self, _: &PathSpec, _: usize) -> AppResult<Vec<PathMatch>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }

        async fn query(&self, _: &GraphQuery) -> AppResult<Vec<Row>> {
            Err(AppError::Graph("connection refused".to_string()))
        }

        async fn ego_network(&self, _: &str, _: &str, _: usize) -> AppResult<Vec<Triplet>> {
            Ok(Vec::new())
        }

        async fn stats(&self) -> AppResult<GraphStats> {
            Ok(GraphStats::default())
        }
    }

    #[tokio::test]
    async fn test_slow_method_times_out_without_failing_round() {
        let limits = RetrievalLimits {
            method_timeout_secs: 1,
            ..RetrievalLimits::default()
        };
        let retriever = Retriever::new(Arc::new(SlowStore), LinkingConfig::default(), limits);
        let analysis = output_with(
            vec![EntityMention::new("Panel", "4007ES", Provenance::Rule)],
            &["Panel->HAS_MODULE->Module"],
            vec![GraphQuery::new("panels", "SELECT 1")],
        );

        let output = retriever.retrieve(&analysis).await;
        assert_eq!(output.reports[0].status, MethodStatus::Ok { results: 0 });
        assert_eq!(output.reports[1].status, MethodStatus::TimedOut);
        // Per-query failures are logged and contribute nothing
        assert_eq!(output.reports[2].status, MethodStatus::Ok { results: 0 });
        assert_eq!(output.reports[3].status, MethodStatus::Skipped);
    }

    #[tokio::test]
    async fn test_timed_out_query_leaves_other_methods_and_later_calls_working() {
        let graph = fixture_graph();
        let limits = RetrievalLimits {
            method_timeout_secs: 1,
            ..RetrievalLimits::default()
        };
        let retriever = Retriever::new(Arc::new(graph.clone()), LinkingConfig::default(), limits);
        let analysis = output_with(
            vec![EntityMention::new("Panel", "4007ES", Provenance::Rule)],
            &[],
            vec![GraphQuery::new("runaway", RUNAWAY_QUERY)],
        );

        let output = retriever.retrieve(&analysis).await;
        assert_eq!(output.reports[2].status, MethodStatus::TimedOut);
        assert_eq!(output.reports[0].status, MethodStatus::Ok { results: 1 });
        assert!(matches!(
            output.reports[3].status,
            MethodStatus::Ok { results } if results > 0
        ));

        let node = tokio::time::timeout(
            Duration::from_secs(2),
            graph.lookup("Panel", NodeField::Identifier, "4010ES"),
        )
        .await
        .expect("lookup waited on the timed-out query")
        .unwrap();
        assert!(node.is_some());
    }
}
