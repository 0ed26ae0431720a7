// ABOUTME: Main entry point for the dockpool operational CLI
//
// Binary: dockpool
// Usage: dockpool <COMMAND>
// - stats: run concurrent listings through the broker, print statistics
// - timeouts: show the timeouts a container name resolves to
// - ping: check daemon reachability through a pooled connection

#![allow(missing_docs)]

use anyhow::Result;
use clap::Parser;

use dockpool::cli;

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    setup_panic_handler();

    let args = cli::Cli::parse();

    match args.command {
        cli::Commands::Stats(stats_args) => cli::stats::execute(stats_args, args.format).await,
        cli::Commands::Timeouts(timeouts_args) => {
            cli::timeouts::execute(timeouts_args, args.format).await
        }
        cli::Commands::Ping => cli::ping::execute(args.format).await,
    }
}

fn setup_logging() {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use tracing_subscriber::prelude::*;

    // Create log directory if it doesn't exist
    let log_dir = dirs::home_dir()
        .map(|home| home.join(".dockpool").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".dockpool/logs"));

    let _ = std::fs::create_dir_all(&log_dir);

    // Create JSONL log file with timestamp
    let log_file = log_dir.join(format!(
        "dockpool-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dockpool=info".into());

    match OpenOptions::new().create(true).append(true).open(&log_file) {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json() // Output in JSON Lines format
                        .with_target(true) // Include target module in JSON
                        .with_writer(file)
                        .with_ansi(false),
                )
                .with(filter)
                .init();
        }
        Err(e) => {
            // Logging must not stop the tool; fall back to stderr
            eprintln!("Could not open log file {}: {e}", log_file.display());
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
        eprintln!("Please check the logs for more details.");
    }));
}
