//! ctxvault CLI: the main entry point.
//!
//! Commands:
//! - `save` / `update` / `search` / `recent` / `get` / `forget` / `sweep`:
//!   the project's memory store
//! - `concept`: the global concept graph and project allowlists
//! - `preview`: assemble context for a task
//! - `rules`: show or adjust ranking rules
//! - `config`: show configuration
//!
//! Every command prints pretty JSON on stdout; logs go to stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "ctxvault",
    about = "ctxvault: local per-project knowledge retrieval",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project id the memory commands operate on
    #[arg(short, long, global = true, env = "CTXVAULT_PROJECT")]
    project: Option<String>,

    /// Config file (defaults to ~/.ctxvault/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a memory (updates the existing one with the same fingerprint)
    Save(commands::memory::SaveArgs),

    /// Update fields of an existing memory
    Update(commands::memory::UpdateArgs),

    /// Search memories through the fallback cascade
    Search(commands::memory::SearchArgs),

    /// Most recent memories
    Recent(commands::memory::RecentArgs),

    /// Fetch memories by id
    Get {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Delete a memory
    Forget { id: String },

    /// Purge expired memories now
    Sweep,

    /// Concept graph commands
    Concept {
        #[command(subcommand)]
        command: commands::concept::ConceptCommand,
    },

    /// Assemble context for a task
    Preview(commands::preview::PreviewArgs),

    /// Show ranking rules, or apply changes for this invocation
    Rules(commands::rules::RulesArgs),

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: commands::config_cmd::ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    if let Commands::Config { command } = cli.command {
        return commands::config_cmd::run(command, &config, cli.config.as_deref());
    }

    let engine = ctxvault_context::Engine::open(config).await?;
    let project = cli.project.as_deref();
    tracing::debug!(project = ?project, "Dispatching command");

    let result = match cli.command {
        Commands::Save(args) => commands::memory::save(&engine, project, args).await,
        Commands::Update(args) => commands::memory::update(&engine, project, args).await,
        Commands::Search(args) => commands::memory::search(&engine, project, args).await,
        Commands::Recent(args) => commands::memory::recent(&engine, project, args).await,
        Commands::Get { ids } => commands::memory::get(&engine, project, ids).await,
        Commands::Forget { id } => commands::memory::forget(&engine, project, &id).await,
        Commands::Sweep => commands::memory::sweep(&engine, project).await,
        Commands::Concept { command } => commands::concept::run(&engine, project, command).await,
        Commands::Preview(args) => commands::preview::run(&engine, project, args).await,
        Commands::Rules(args) => commands::rules::run(&engine, args),
        Commands::Config { .. } => Ok(()),
    };

    engine.shutdown().await;
    result
}
