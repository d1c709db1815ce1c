//! Tributary CLI - offline checks for source and pipeline definitions

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process;
use tracing::error;
use tributary_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use tributary_engine::models::{CreateDataSource, CreatePipeline, TargetSchema};
use tributary_engine::pipeline::execution_waves;
use tributary_engine::scheduler::next_run_after;
use tributary_engine::{EngineConfig, IntegrationService};

#[derive(Parser)]
#[command(name = "tributary", version, about = "Tributary data integration engine")]
struct Cli {
    /// Log debug output to the console
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a data source definition against canonical schemas
    CheckSource {
        /// JSON file holding the data source registration
        file: PathBuf,

        /// JSON files holding target schemas
        #[arg(short, long = "schema", required = true)]
        schemas: Vec<PathBuf>,
    },

    /// Print the upcoming scheduled runs of a data source definition
    NextRuns {
        file: PathBuf,

        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },

    /// Validate a pipeline definition and print its execution order
    PlanPipeline { file: PathBuf },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn check_source(file: &Path, schemas: &[PathBuf]) -> Result<()> {
    let service = IntegrationService::builder(EngineConfig::default()).build();
    for path in schemas {
        let schema: TargetSchema = read_json(path)?;
        service
            .register_schema(schema)
            .await
            .with_context(|| format!("Schema in {} is invalid", path.display()))?;
    }

    let request: CreateDataSource = read_json(file)?;
    let source = service
        .create_data_source(request)
        .await
        .context("Data source definition is invalid")?;

    println!("{}", serde_json::to_string_pretty(&source.redacted())?);
    Ok(())
}

fn next_runs(file: &Path, count: usize) -> Result<()> {
    let request: CreateDataSource = read_json(file)?;
    let mut after = Utc::now();
    for _ in 0..count {
        match next_run_after(&request.sync_settings, after)? {
            Some(next) => {
                println!("{}", next.to_rfc3339());
                after = next;
            }
            None => {
                println!("not scheduled");
                break;
            }
        }
    }
    Ok(())
}

fn plan_pipeline(file: &Path) -> Result<()> {
    let request: CreatePipeline = read_json(file)?;
    let waves = execution_waves(&request.stages)?;
    for (i, wave) in waves.iter().enumerate() {
        println!("wave {}: {}", i + 1, wave.join(", "));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Warn };
    let log_config = LogConfig::builder()
        .level(level)
        .output(LogOutput::Console)
        .log_file_prefix("tributary")
        .build();
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = init_logging(&log_config);

    let result = match &cli.command {
        Commands::CheckSource { file, schemas } => check_source(file, schemas).await,
        Commands::NextRuns { file, count } => next_runs(file, *count),
        Commands::PlanPipeline { file } => plan_pipeline(file),
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
