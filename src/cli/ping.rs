// ABOUTME: CLI ping command: checks daemon reachability through a pooled connection

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Instant;

use super::OutputFormat;
use crate::broker::{DaemonBroker, OperationKind};
use crate::config::AppConfig;

/// JSON output structure for the ping command
#[derive(Debug, Serialize)]
pub struct PingOutput {
    pub reachable: bool,
    pub connection: Option<String>,
    pub elapsed_ms: u128,
    pub error: Option<String>,
}

/// Execute the ping command
pub async fn execute(format: OutputFormat) -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    let broker = DaemonBroker::from_app_config(&config);
    broker.start().await.context("Failed to start broker")?;

    let started = Instant::now();
    let acquired = broker.acquire_for(OperationKind::Info, None).await;
    let elapsed_ms = started.elapsed().as_millis();

    let output = match &acquired {
        Ok((conn, _)) => PingOutput {
            reachable: true,
            connection: Some(conn.id().to_string()),
            elapsed_ms,
            error: None,
        },
        Err(e) => PingOutput {
            reachable: false,
            connection: None,
            elapsed_ms,
            error: Some(e.to_string()),
        },
    };
    drop(acquired);
    broker.shutdown().await.context("Failed to shut down broker")?;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("Failed to serialize ping result")?
            );
        }
        OutputFormat::Text => {
            if output.reachable {
                println!(
                    "\x1b[32m●\x1b[0m Docker daemon reachable ({}, {}ms)",
                    output.connection.as_deref().unwrap_or("-"),
                    output.elapsed_ms
                );
            } else {
                println!(
                    "\x1b[31m●\x1b[0m Docker daemon unreachable: {}",
                    output.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    if output.reachable {
        Ok(())
    } else {
        anyhow::bail!("Docker daemon is not reachable")
    }
}
