use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ifa_sync::{Pipeline, PipelineConfig, RunOutput, StageSummary, DEFAULT_CONFIG_PATH};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ifa-cli")]
#[command(about = "Integration funnel analytics pipeline")]
struct Cli {
    /// Pipeline configuration file; a missing file means defaults.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Normalize, deduplicate and classify the input file.
    Prepare {
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Fetch metadata and transcripts for prepared records.
    Fetch {
        #[arg(long)]
        refetch: bool,
    },
    /// Run LLM enrichment over fetched transcripts.
    Enrich {
        #[arg(long)]
        refetch: bool,
    },
    /// Join everything into a new run directory.
    Merge,
    /// All stages in order.
    Run {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        refetch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = PipelineConfig::load(&cli.config)?;
    let credentials = config.credentials();
    info!(config = %cli.config.display(), ?credentials, "configuration loaded");

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight items and checkpointing");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let pipeline = Pipeline::new(config, credentials, shutdown);
    match cli.command.unwrap_or(Commands::Run {
        input: None,
        refetch: false,
    }) {
        Commands::Prepare { input } => {
            let prepared = pipeline.prepare(input.as_deref()).await?;
            println!(
                "prepare complete: rows={} records={} skipped={} ambiguities={}",
                prepared.diagnostics.rows_read,
                prepared.records.len(),
                prepared.diagnostics.skipped_rows().count(),
                prepared.diagnostics.ambiguities.len()
            );
        }
        Commands::Fetch { refetch } => {
            let prepared = pipeline.load_prepared().await?;
            print_stage(&pipeline.fetch_content(&prepared.records, refetch).await?);
        }
        Commands::Enrich { refetch } => {
            let prepared = pipeline.load_prepared().await?;
            print_stage(&pipeline.enrich(&prepared.records, refetch).await?);
        }
        Commands::Merge => print_run(&pipeline.merge_persisted().await?),
        Commands::Run { input, refetch } => print_run(&pipeline.run_all(input.as_deref(), refetch).await?),
    }

    Ok(())
}

fn print_stage(summary: &StageSummary) {
    println!(
        "{} complete: items={} attempted={} skipped={} succeeded={} failed={} pending={}{}",
        summary.stage,
        summary.total_items,
        summary.attempted,
        summary.skipped,
        summary.succeeded,
        summary.failed_permanent,
        summary.pending,
        if summary.interrupted { " (interrupted; re-run to resume)" } else { "" }
    );
}

fn print_run(out: &RunOutput) {
    println!(
        "merge complete: run_id={} records={} content_ok={} enrichment_ok={} dir={}",
        out.run_id,
        out.merged.len(),
        out.report.content_status.succeeded,
        out.report.enrichment_status.succeeded,
        out.run_dir.display()
    );
    if out.report.is_incomplete() {
        println!("some items are still pending; re-run to resume");
    }
}
