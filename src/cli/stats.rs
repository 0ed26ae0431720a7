// ABOUTME: CLI stats command: drives concurrent listings through the broker
//
// Starts a broker against the local daemon, issues N concurrent container
// listings so the pool saturates and the queue engages, then prints the
// broker's statistics snapshot (text/JSON output).

use anyhow::{Context, Result};
use futures_util::future::join_all;
use serde::Serialize;
use std::time::Instant;

use super::{OutputFormat, StatsArgs};
use crate::broker::{BrokerStats, DaemonBroker, OperationKind};
use crate::config::AppConfig;

/// JSON output structure for the stats command
#[derive(Debug, Serialize)]
pub struct StatsOutput {
    pub requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
    pub broker: BrokerStats,
}

/// Execute the stats command
pub async fn execute(args: StatsArgs, format: OutputFormat) -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    let broker = DaemonBroker::from_app_config(&config);
    broker.start().await.context("Failed to start broker")?;

    let started = Instant::now();
    let calls = (0..args.concurrency).map(|_| {
        broker.run(OperationKind::List, None, |docker| async move {
            docker.list_containers::<String>(None).await
        })
    });
    let results = join_all(calls).await;
    let elapsed = started.elapsed();

    let mut failed = 0;
    for result in &results {
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                failed += 1;
                tracing::warn!(error = %e, "Container listing failed");
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(error = %e, "Broker rejected listing");
            }
        }
    }

    let output = StatsOutput {
        requests: results.len(),
        succeeded: results.len() - failed,
        failed,
        elapsed_ms: elapsed.as_millis(),
        broker: broker.get_stats(),
    };
    broker.shutdown().await.context("Failed to shut down broker")?;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("Failed to serialize stats")?
            );
        }
        OutputFormat::Text => {
            println!("Broker statistics");
            println!("{}", "━".repeat(44));
            println!(
                "Listings:         {} ok, {} failed in {}ms",
                output.succeeded, output.failed, output.elapsed_ms
            );
            println!("{}", output.broker);
        }
    }

    Ok(())
}
