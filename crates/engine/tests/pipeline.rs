//! End-to-end runs over the bundled catalog with a scripted model.

use kgqa_engine::graph::GraphFixture;
use kgqa_engine::synthesis::{BASELINE_FAILURE, GROUNDED_FAILURE};
use kgqa_engine::{
    CancellationToken, EngineConfig, GraphStore, HeuristicJudge, Orchestrator, SelectionMethod,
    SqliteGraph,
};
use kgqa_llm::ScriptedClient;
use kgqa_prompt::PromptLibrary;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

const QUERY: &str = "I need 10 smoke detectors for a small office";

const BASELINE: &str = "Install ten smoke detectors and a suitable control panel.";

const ANALYSIS: &str = r#"{
  "entities": [{"type": "Detector", "sku": "4098-9714", "quantity": 10}],
  "paths": ["Detector->REQUIRES_BASE->Base"],
  "queries": [],
  "draft_answer": "Ten photoelectric heads on a small panel."
}"#;

const GROUNDED: &str = r#"Use ten TrueAlarm 4098-9714 photoelectric heads on 4098-9792 standard bases, connected to a 4007ES panel.

```json
[
  {"item": "TrueAlarm Photoelectric Smoke Detector", "sku": "4098-9714", "quantity": 10, "description": "Detector head"},
  {"item": "Standard Sensor Base", "sku": "4098-9792", "quantity": 10, "description": "One base per head"},
  {"item": "Simplex 4007ES Fire Alarm Control Panel", "sku": "4007ES", "quantity": 1, "description": "Control panel"},
  {"item": "Generic beacon", "sku": "XX-1", "quantity": 2, "description": "Not in the catalog"}
]
```"#;

const VERDICT: &str = r#"{"answer_a_score": 4, "answer_b_score": 9, "better_answer": "B", "reasoning": "B cites catalog SKUs"}"#;

fn catalog() -> SqliteGraph {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/catalog.json");
    GraphFixture::from_file(&path).unwrap().in_memory().unwrap()
}

/// Rules are matched in order, so the prompts that embed other answers
/// come first.
fn scripted(analysis: &str) -> ScriptedClient {
    ScriptedClient::new()
        .with_rule("Compare these two answers", VERDICT)
        .with_rule("TECHNICAL ANALYSIS FROM KNOWLEDGE GRAPH", GROUNDED)
        .with_rule("Graph schema:", analysis)
        .with_rule("Fire alarm question:", BASELINE)
}

fn orchestrator(client: ScriptedClient, graph: SqliteGraph) -> Orchestrator {
    Orchestrator::new(
        Arc::new(client),
        Arc::new(graph),
        Arc::new(PromptLibrary::builtin().unwrap()),
        EngineConfig::default(),
    )
}

#[tokio::test]
async fn test_small_office_query_is_grounded() {
    let answer = orchestrator(scripted(ANALYSIS), catalog())
        .process_query(QUERY, 2)
        .await
        .unwrap();

    let rendered: Vec<String> = answer.evidence.iter().map(|e| e.evidence.render()).collect();
    assert!(
        rendered.iter().any(|r| r.starts_with("Panel 4007ES")),
        "no panel evidence in {:?}",
        rendered
    );
    assert!(rendered.iter().any(|r| r.contains("-REQUIRES_BASE->")));

    assert_eq!(answer.metadata.selection.method_used, SelectionMethod::GraphGrounded);
    assert!(answer.answer.starts_with("Use ten TrueAlarm"));
    assert_eq!(answer.metadata.selection.improvement, 5.0);
    assert_eq!(answer.metadata.baseline_answer, BASELINE);

    let detector = answer.items.iter().find(|i| i.sku == "4098-9714").unwrap();
    let base = answer.items.iter().find(|i| i.sku == "4098-9792").unwrap();
    assert_eq!(detector.quantity, 10);
    assert_eq!(base.quantity, 10);
    assert!(answer.items.iter().all(|i| i.sku != "XX-1"));
    assert!(!answer.metadata.low_confidence);
}

#[tokio::test]
async fn test_second_round_without_new_facts_stops_early() {
    let answer = orchestrator(scripted(ANALYSIS), catalog())
        .process_query(QUERY, 3)
        .await
        .unwrap();

    assert_eq!(answer.iterations_performed, 2);
    assert_eq!(answer.metadata.iterations[1].new_facts, 0);
    assert!(answer.metadata.iterations[0].new_facts > 0);
}

#[tokio::test]
async fn test_evidence_is_unique_per_session() {
    let answer = orchestrator(scripted(ANALYSIS), catalog())
        .process_query(QUERY, 2)
        .await
        .unwrap();

    let signatures: HashSet<&str> = answer.evidence.iter().map(|e| e.signature.as_str()).collect();
    assert_eq!(signatures.len(), answer.evidence.len());
    assert_eq!(answer.metadata.unique_facts_discovered, answer.evidence.len());
    assert_eq!(answer.metadata.total_context_items, answer.evidence.len());
}

#[tokio::test]
async fn test_mutating_query_is_rejected_and_graph_unchanged() {
    let analysis = r#"{"entities": [], "paths": [], "queries": [
        {"purpose": "cleanup", "query": "DELETE FROM nodes WHERE node_type = 'Panel'"}
    ]}"#;
    let graph = catalog();
    let before = graph.stats().await.unwrap();

    let answer = orchestrator(scripted(analysis), graph.clone())
        .process_query(QUERY, 1)
        .await
        .unwrap();

    assert_eq!(answer.metadata.iterations[0].rejected_queries, 1);
    assert_eq!(
        graph.stats().await.unwrap().total_nodes(),
        before.total_nodes()
    );
}

#[tokio::test]
async fn test_unavailable_model_still_answers() {
    let client = Arc::new(ScriptedClient::failing());
    let orchestrator = Orchestrator::new(
        client.clone(),
        Arc::new(catalog()),
        Arc::new(PromptLibrary::builtin().unwrap()),
        EngineConfig::default(),
    );

    let answer = orchestrator.process_query(QUERY, 2).await.unwrap();

    assert_eq!(answer.metadata.baseline_answer, BASELINE_FAILURE);
    assert!(answer.metadata.iterations.iter().all(|r| !r.model_ok));
    // Rule findings alone still reach the graph
    assert!(!answer.evidence.is_empty());
    assert_eq!(answer.answer, GROUNDED_FAILURE);
    assert!(answer.items.is_empty());
    assert!(client.calls() > 0);
}

#[tokio::test]
async fn test_no_evidence_returns_baseline() {
    let answer = orchestrator(scripted("{}"), catalog())
        .process_query("What is the weather like today?", 2)
        .await
        .unwrap();

    assert!(answer.evidence.is_empty());
    assert!(answer.metadata.low_confidence);
    assert_eq!(answer.metadata.selection.method_used, SelectionMethod::BaselineOnly);
    assert_eq!(answer.answer, BASELINE);
    assert!(answer.items.is_empty());
}

#[tokio::test]
async fn test_cancelled_query_returns_baseline() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let answer = orchestrator(scripted(ANALYSIS), catalog())
        .process_query_with_cancel(QUERY, 2, &cancel)
        .await
        .unwrap();

    assert!(answer.metadata.cancelled);
    assert_eq!(answer.iterations_performed, 0);
    assert_eq!(answer.answer, BASELINE);
}

#[tokio::test]
async fn test_heuristic_judge_can_replace_model_judge() {
    let answer = orchestrator(scripted(ANALYSIS), catalog())
        .with_judge(Arc::new(HeuristicJudge))
        .process_query(QUERY, 1)
        .await
        .unwrap();

    assert_eq!(answer.metadata.selection.method_used, SelectionMethod::GraphGrounded);
    assert!(answer.metadata.selection.grounded_score > answer.metadata.selection.baseline_score);
}
