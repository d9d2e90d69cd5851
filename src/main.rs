use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use engram::{cli, config::EngramConfig};

#[derive(Parser)]
#[command(name = "engram", version, about = "Embedded memory store for AI agent runtimes")]
struct Cli {
    /// Path to a TOML config file (defaults to ~/.engram/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and bring the schema up to date
    Init,
    /// Print pool, cache, and vector-index statistics
    Stats,
    /// Check database health
    Health,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => EngramConfig::load_from(path)?,
        None => EngramConfig::load()?,
    };

    // Log to stderr so stdout stays clean for JSON output.
    let filter = EnvFilter::try_new(&config.logging.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Init => cli::init(&config),
        Command::Stats => cli::stats(&config),
        Command::Health => cli::health(&config),
    }
}
