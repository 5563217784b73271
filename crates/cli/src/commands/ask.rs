//! Ask command handler.
//!
//! Runs the iterative graph-grounded pipeline for one question.

use clap::Args;
use kgqa_core::{config::AppConfig, AppError, AppResult};
use kgqa_engine::{
    CancellationToken, EngineConfig, HeuristicJudge, Orchestrator, QueryAnswer, SqliteGraph,
};
use kgqa_llm::client_from_config;
use kgqa_prompt::PromptLibrary;
use std::path::PathBuf;
use std::sync::Arc;

/// Answer a question using the knowledge graph
#[derive(Args, Debug)]
pub struct AskCommand {
    /// The question to ask
    pub query: Option<String>,

    /// Read the question from a file
    #[arg(short, long, conflicts_with = "query")]
    pub file: Option<PathBuf>,

    /// Maximum retrieval rounds (default: engine.maxIterations)
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Compare answers with the deterministic judge instead of the model
    #[arg(long)]
    pub heuristic_judge: bool,

    /// Include the evidence list in the output
    #[arg(long)]
    pub show_evidence: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl AskCommand {
    /// Execute the ask command.
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing ask command");
        tracing::debug!("Ask command options: {:?}", self);

        let query = self.get_query()?;
        config.validate()?;

        let engine = EngineConfig::for_app(config)?;
        let max_iterations = self.max_iterations.unwrap_or(engine.max_iterations);

        let store = SqliteGraph::open(&config.graph_file()).map_err(|e| {
            AppError::Graph(format!(
                "{}. Run 'kgqa graph import <fixture>' to create it.",
                e
            ))
        })?;
        let llm = client_from_config(config)?;
        let prompts = PromptLibrary::for_workspace(&config.workspace)?;

        let mut orchestrator = Orchestrator::new(llm, Arc::new(store), Arc::new(prompts), engine);
        if self.heuristic_judge {
            orchestrator = orchestrator.with_judge(Arc::new(HeuristicJudge));
        }

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted; stopping after the current round");
                on_interrupt.cancel();
            }
        });

        let answer = orchestrator
            .process_query_with_cancel(&query, max_iterations, &cancel)
            .await?;

        if self.json {
            self.print_json(&answer)
        } else {
            self.print_text(&answer);
            Ok(())
        }
    }

    fn get_query(&self) -> AppResult<String> {
        let query = match (&self.query, &self.file) {
            (Some(query), _) => query.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                AppError::Config(format!("Failed to read question from {:?}: {}", path, e))
            })?,
            (None, None) => return Err(AppError::Config("No question provided".to_string())),
        };

        if query.trim().is_empty() {
            return Err(AppError::Config("Question is empty".to_string()));
        }
        Ok(query)
    }

    fn print_json(&self, answer: &QueryAnswer) -> AppResult<()> {
        let mut output = serde_json::to_value(answer)?;
        if !self.show_evidence {
            if let Some(object) = output.as_object_mut() {
                object.remove("evidence");
            }
        }
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }

    fn print_text(&self, answer: &QueryAnswer) {
        println!("{}", answer.answer);

        if !answer.items.is_empty() {
            println!();
            println!("Bill of quantities:");
            println!("{:>5}  {:<12}  {}", "QTY", "SKU", "ITEM");
            for item in &answer.items {
                println!("{:>5}  {:<12}  {}", item.quantity, item.sku, item.item);
            }
        }

        if self.show_evidence && !answer.evidence.is_empty() {
            println!();
            println!("Evidence:");
            for item in &answer.evidence {
                println!(
                    "  [{} {:.2}/{:.2}] {}",
                    item.method(),
                    item.confidence,
                    item.relevance,
                    item.evidence.render()
                );
            }
        }

        let metadata = &answer.metadata;
        if metadata.low_confidence {
            eprintln!("Note: no supporting graph evidence was found; this answer is ungrounded.");
        }
        if metadata.cancelled {
            eprintln!("Note: the query was interrupted; this answer is ungrounded.");
        }
        tracing::info!(
            "Answered via {:?} after {} round(s), {} fact(s)",
            metadata.selection.method_used,
            answer.iterations_performed,
            metadata.unique_facts_discovered
        );
    }
}
