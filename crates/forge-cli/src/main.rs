//! CLI entry point for the Forge GPU notebook environment.
//!
//! Not part of the execution core: a
//! single binary that starts the Notebook Server against an optional
//! notebook path, with a `new` subcommand that fabricates a timestamped
//! filename instead of opening an existing one.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "forge", version, about = "GPU notebook environment", long_about = None)]
struct Cli {
    /// Notebook file to open. Defaults to `notebook.json` in the current
    /// directory if omitted and no subcommand is given.
    notebook: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Host to bind the notebook server to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the notebook server to.
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Verbose (debug-level) logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new notebook with a fabricated, timestamped filename and
    /// open it.
    New,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let notebook_path = match cli.command {
        Some(Commands::New) => new_notebook_path(),
        None => cli.notebook.unwrap_or_else(|| PathBuf::from("notebook.json")),
    };

    let config = forge_server::ServerConfig {
        host: cli.host,
        port: cli.port,
        open_browser: false,
    };

    forge_server::serve(&notebook_path, config)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(())
}

/// Fabricates `notebook-<unix-seconds>.json`. The timestamp is read here at
/// the CLI boundary rather than inside `forge-core`/`forge-server`, which
/// stay deterministic.
fn new_notebook_path() -> PathBuf {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    PathBuf::from(format!("notebook-{seconds}.json"))
}
