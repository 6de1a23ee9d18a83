use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadrelay_sync::{Pipeline, PipelineConfig, Secrets};
use leadrelay_web::AppState;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadrelay")]
#[command(about = "Relays lead exports to the CRM ingestion API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP trigger on $PORT.
    Serve,
    /// Run one pipeline invocation and print its outcome as JSON.
    RunOnce,
}

fn init_logging(config: &PipelineConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match &config.log_file_prefix {
        Some(prefix) => {
            let path = format!("{prefix}leadrelay.log");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {path}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;
    init_logging(&config)?;

    let pipeline = Pipeline::from_config(&config, &Secrets::from_env()?)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!("starting lead relay");
            leadrelay_web::serve(AppState::new(pipeline), leadrelay_web::port_from_env()).await?;
        }
        Commands::RunOnce => {
            let outcome = pipeline.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}
