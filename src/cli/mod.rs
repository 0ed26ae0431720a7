// ABOUTME: CLI argument parsing and command routing for dockpool
//
// Provides command-line interface for:
// - Exercising the broker against the local daemon (stats)
// - Explaining timeout selection for a container name (timeouts)
// - Checking daemon reachability through the pool (ping)

pub mod ping;
pub mod stats;
pub mod timeouts;

use clap::{Parser, Subcommand, ValueEnum};

use crate::broker::OperationKind;

/// Pooled Docker daemon broker - inspect and exercise the connection pool
#[derive(Parser)]
#[command(name = "dockpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run concurrent container listings through the broker and print its statistics
    Stats(StatsArgs),

    /// Show which timeouts apply to a container name
    Timeouts(TimeoutsArgs),

    /// Acquire one pooled connection and report daemon reachability
    Ping,
}

/// Arguments for the stats command
#[derive(clap::Args)]
pub struct StatsArgs {
    /// Number of concurrent listing calls to issue
    #[arg(long, short, default_value = "10")]
    pub concurrency: usize,
}

/// Arguments for the timeouts command
#[derive(clap::Args)]
pub struct TimeoutsArgs {
    /// Container name to classify
    pub name: String,

    /// Only show the timeout for this operation (list, info, stats, action)
    #[arg(long, short)]
    pub operation: Option<OperationKind>,
}
