//! KGQA CLI
//!
//! Main entry point for the kgqa command-line tool.
//! Answers fire alarm system questions grounded in a product knowledge graph.

mod commands;

use clap::{Parser, Subcommand};
use commands::{AskCommand, CacheCommand, GraphCommand, PromptsCommand};
use kgqa_core::logging::{self, LogFormat};
use kgqa_core::{config::AppConfig, AppError, AppResult};
use std::path::PathBuf;

/// KGQA - graph-grounded question answering for fire alarm systems
#[derive(Parser, Debug)]
#[command(name = "kgqa")]
#[command(about = "Graph-grounded question answering for fire alarm systems", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to workspace directory (default: current directory)
    #[arg(short, long, global = true, env = "KGQA_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Path to config file
    #[arg(short, long, global = true, env = "KGQA_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the graph database
    #[arg(short, long, global = true, env = "KGQA_GRAPH")]
    graph: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true, env = "KGQA_LOG_FORMAT")]
    log_format: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    no_color: bool,

    /// LLM provider (ollama, openai)
    #[arg(short, long, global = true, env = "KGQA_PROVIDER")]
    provider: Option<String>,

    /// Model identifier
    #[arg(short, long, global = true, env = "KGQA_MODEL")]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer a question using the knowledge graph
    Ask(AskCommand),

    /// Response cache maintenance
    Cache(CacheCommand),

    /// Graph database inspection and fixture import
    Graph(GraphCommand),

    /// Prompt library listing
    Prompts(PromptsCommand),
}

#[tokio::main]
async fn main() -> AppResult<()> {
    // Parse command-line arguments first (needed for logging config)
    let cli = Cli::parse();

    // Load base configuration from defaults, config file and environment
    let config = AppConfig::load()?;

    // Apply CLI overrides
    let mut config = config.with_overrides(
        cli.workspace,
        cli.config,
        cli.provider,
        cli.model,
        cli.graph,
        cli.log_level,
        cli.verbose,
        cli.no_color,
    );
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }

    let log_format = LogFormat::parse(&config.log_format).ok_or_else(|| {
        AppError::Config(format!("Unknown log format: {}", config.log_format))
    })?;
    logging::init_logging(config.log_level.as_deref(), config.no_color, log_format)?;

    tracing::info!("KGQA CLI starting");
    tracing::debug!("Workspace: {:?}", config.workspace);
    tracing::debug!("Provider: {}", config.provider);
    tracing::debug!("Model: {}", config.model);
    tracing::debug!("Graph: {:?}", config.graph_file());

    config.ensure_state_dir()?;

    let command_name = match &cli.command {
        Commands::Ask(_) => "ask",
        Commands::Cache(_) => "cache",
        Commands::Graph(_) => "graph",
        Commands::Prompts(_) => "prompts",
    };
    let _span = tracing::info_span!("command", name = command_name).entered();

    let result = match cli.command {
        Commands::Ask(cmd) => cmd.execute(&config).await,
        Commands::Cache(cmd) => cmd.execute(&config),
        Commands::Graph(cmd) => cmd.execute(&config).await,
        Commands::Prompts(cmd) => cmd.execute(&config),
    };

    match &result {
        Ok(_) => tracing::info!("Command completed successfully"),
        Err(e) => tracing::error!("Command failed: {}", e),
    }

    result
}
