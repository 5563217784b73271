//! Graph command handler.
//!
//! Shows graph statistics and imports JSON fixtures into a graph database.

use clap::{Args, Subcommand};
use kgqa_core::{config::AppConfig, AppError, AppResult};
use kgqa_engine::graph::import_file;
use kgqa_engine::{GraphStore, SqliteGraph};
use std::path::PathBuf;

/// Graph database inspection and fixture import
#[derive(Args, Debug)]
pub struct GraphCommand {
    #[command(subcommand)]
    pub action: GraphAction,
}

#[derive(Subcommand, Debug)]
pub enum GraphAction {
    /// Show node and edge counts by type
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load a JSON fixture ({nodes, edges}) into the graph database
    Import {
        /// Fixture file
        fixture: PathBuf,

        /// Replace an existing database instead of adding to it
        #[arg(long)]
        replace: bool,
    },
}

impl GraphCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing graph command");
        let db_path = config.graph_file();

        match &self.action {
            GraphAction::Stats { json } => {
                let graph = SqliteGraph::open(&db_path)?;
                let stats = graph.stats().await?;

                if *json {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                } else {
                    println!("Graph: {}", db_path.display());
                    println!("Nodes: {}", stats.total_nodes());
                    for (node_type, count) in &stats.nodes_by_type {
                        println!("  {:<16} {}", node_type, count);
                    }
                    println!("Edges: {}", stats.total_edges());
                    for (rel_type, count) in &stats.edges_by_type {
                        println!("  {:<16} {}", rel_type, count);
                    }
                }
            }
            GraphAction::Import { fixture, replace } => {
                if *replace && db_path.exists() {
                    std::fs::remove_file(&db_path).map_err(|e| {
                        AppError::Graph(format!("Failed to remove {:?}: {}", db_path, e))
                    })?;
                    tracing::info!("Removed existing graph at {:?}", db_path);
                }

                let (nodes, edges) = import_file(fixture, &db_path)?;
                println!(
                    "Imported {} nodes and {} edges into {}",
                    nodes,
                    edges,
                    db_path.display()
                );
            }
        }

        Ok(())
    }
}
