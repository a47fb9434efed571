//! Tidemark CLI: operate the data-lake control plane from a terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Tidemark: incremental, lineage-tracked partition rebuilds
#[derive(Parser, Debug)]
#[command(name = "tidemark", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Extra configuration file, merged above the workspace config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Scan the landing zone, register new file versions and route them
    Discover {
        /// Landing root (defaults to `discovery.root`)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Manage route rules
    Routes {
        #[command(subcommand)]
        action: RoutesAction,
    },
    /// List dirty-partition bookkeeping
    Dirty {
        /// Only rows with this status (dirty, rebuilding, clean)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show the build plan for one partition
    Plan { entity: String, partition: String },
    /// Rebuild every dirty partition from its JSON inputs
    Rebuild,
    /// Publish rows for one partition directly
    Publish {
        /// Entity name in `publish.contracts_dir`, or a contract file path
        contract: String,
        partition: String,
        /// JSON Lines file with the rows to publish
        #[arg(long)]
        rows: PathBuf,
        /// Run id (a fresh one is generated when omitted)
        #[arg(long)]
        run_id: Option<String>,
    },
    /// List commit records
    Commits {
        #[arg(long)]
        entity: Option<String>,
        #[arg(long)]
        partition: Option<String>,
        /// Earliest finish time (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,
        /// Latest finish time (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        until: Option<String>,
    },
    /// Show lineage events for one partition
    Lineage { entity: String, partition: String },
    /// Write an atomic JSON snapshot of commits and outstanding work
    Export { path: PathBuf },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum RoutesAction {
    /// Load rules from a YAML file (defaults to `routing.rules_path`)
    Load { path: Option<PathBuf> },
    /// List the stored rules
    List,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "tidemark", "tidemark")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tidemark.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = tidemark_core::config::load_config_with(
        Some(&workspace),
        cli.config.as_deref(),
        None,
    )
    .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?
    .resolve_paths(&workspace);

    if !tidemark_core::config_exists(Some(&workspace)) && cli.config.is_none() {
        tracing::debug!(workspace = %workspace.display(), "No config file found, using defaults");
    }

    commands::handle_command(cli.command, &config).await
}
