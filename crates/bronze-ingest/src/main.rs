//! Bronze Ingest - ingestion job runner

use anyhow::{Context, Result};
use bronze_common::logging::{init_logging, LogConfig, LogLevel};
use bronze_ingest::config::{BatchArgs, BatchJobConfig, StreamArgs, StreamingJobConfig};
use bronze_ingest::storage::{StorageConfig, StorageResolver};
use bronze_ingest::{batch, streaming};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "bronze-ingest")]
#[command(author, version, about = "Bronze layer ingestion jobs")]
struct Cli {
    #[command(subcommand)]
    job: Job,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Job {
    /// Stream a Kafka topic into partitioned Parquet
    Stream(StreamArgs),

    /// Convert files under a prefix to Parquet
    Convert(BatchArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("bronze-ingest")
        .filter_directives("bronze_ingest=debug,rdkafka=info,aws_config=warn,aws_smithy_runtime=warn")
        .build();

    // Environment variables take precedence
    let log_config =
        LogConfig::from_env_with(log_config).context("invalid logging configuration")?;
    let _guard = init_logging(&log_config)?;

    let result = run(cli.job).await;
    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "Job failed");
    }
    result
}

async fn run(job: Job) -> Result<()> {
    let resolver = StorageResolver::new(StorageConfig::from_env()?);

    match job {
        Job::Stream(args) => {
            let config = StreamingJobConfig::try_from(args)?;
            let job_name = config.job_name.clone();
            info!(job = %job_name, "Job initialized");

            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_shutdown(cancel.clone()));

            let progress = streaming::run_job(config, &resolver, cancel).await?;
            for query in &progress {
                info!(
                    query = %query.name,
                    batches = query.batches,
                    records = query.records,
                    "Flow finished"
                );
            }
            info!(job = %job_name, "Job committed");
        },
        Job::Convert(args) => {
            let config = BatchJobConfig::try_from(args)?;
            let job_name = config.job_name.clone();
            info!(job = %job_name, format = %config.file_format, "Job initialized");

            let report = batch::run_job(config, &resolver).await?;
            info!(
                job = %job_name,
                files = report.files.len(),
                rows = report.rows(),
                run_timestamp = %report.run_timestamp,
                "Job committed"
            );
        },
    }
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn cancel_on_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping flows");
        },
        _ = terminate => {
            info!("Received terminate signal, stopping flows");
        },
    }
    token.cancel();
}
