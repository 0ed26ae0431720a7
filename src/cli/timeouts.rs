// ABOUTME: CLI timeouts command: explains timeout selection for a container name

use anyhow::{Context, Result};
use serde::Serialize;

use super::{OutputFormat, TimeoutsArgs};
use crate::broker::{OperationKind, TimeoutPolicyEngine};
use crate::config::AppConfig;

const ALL_OPERATIONS: [OperationKind; 4] = [
    OperationKind::List,
    OperationKind::Info,
    OperationKind::Stats,
    OperationKind::Action,
];

/// JSON output structure for the timeouts command
#[derive(Debug, Serialize)]
pub struct TimeoutsOutput {
    pub name: String,
    pub source: String,
    pub override_file: Option<String>,
    pub timeouts: Vec<OperationEntry>,
}

#[derive(Debug, Serialize)]
pub struct OperationEntry {
    pub operation: OperationKind,
    pub seconds: f64,
}

/// Resolve `name` against `engine` for the requested operations
pub fn describe(engine: &TimeoutPolicyEngine, name: &str, operation: Option<OperationKind>) -> TimeoutsOutput {
    let profile = engine.resolve(Some(name));
    let operations = operation.map_or_else(|| ALL_OPERATIONS.to_vec(), |op| vec![op]);

    TimeoutsOutput {
        name: name.to_string(),
        source: profile.source.to_string(),
        override_file: engine.override_path().map(|p| p.display().to_string()),
        timeouts: operations
            .into_iter()
            .map(|operation| OperationEntry {
                operation,
                seconds: engine.timeout_for(operation, Some(name)).as_secs_f64(),
            })
            .collect(),
    }
}

/// Execute the timeouts command
#[allow(clippy::unused_async)]
pub async fn execute(args: TimeoutsArgs, format: OutputFormat) -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    let engine = TimeoutPolicyEngine::new(config.timeouts);
    let output = describe(&engine, &args.name, args.operation);

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("Failed to serialize timeouts")?
            );
        }
        OutputFormat::Text => {
            println!("Container:    {}", output.name);
            println!("Matched by:   {}", output.source);
            if let Some(path) = &output.override_file {
                println!("Overrides:    {path}");
            }
            println!();
            for entry in &output.timeouts {
                println!("  {:<8} {:>6.1}s", entry.operation.to_string(), entry.seconds);
            }
        }
    }

    Ok(())
}
