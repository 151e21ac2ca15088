use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use convsift::config::ConcurrencyPreset;
use convsift::logging::{init_logging, LogFormat, LogLevel};
use convsift::scheduler::RunEvent;
use convsift::utils::{format_bytes, format_duration};
use convsift::{
    export_insight, ExportFormat, HttpAnalyzer, Pipeline, PipelineConfig, RunMode, RunState,
    SamplingStrategy,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[clap(name = "convsift")]
#[clap(about = "Chunk, sample and analyze very large conversation dumps")]
#[clap(version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// Configuration file path (JSON)
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding chunks, checkpoints and results
    #[clap(short, long, global = true, env = "CONVSIFT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[clap(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Base URL of the analysis service
    #[clap(long, global = true, env = "CONVSIFT_ANALYZER_URL")]
    analyzer_url: Option<String>,

    /// Bearer token for the analysis and consolidation services
    #[clap(long, global = true, env = "CONVSIFT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Base URL of the consolidation service
    #[clap(long, global = true, env = "CONVSIFT_CONSOLIDATOR_URL")]
    consolidator_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Split one large JSON array into size-bounded chunk files
    Chunk {
        /// Input JSON file
        input: PathBuf,

        /// Target chunk size in megabytes
        #[clap(long)]
        target_mb: Option<u64>,
    },

    /// Build the key to chunk index
    Index {
        /// Discard the persisted index and rebuild it
        #[clap(long)]
        rebuild: bool,
    },

    /// Find the chunk holding a work item and print the item
    Lookup {
        key: String,

        /// Print the full message list
        #[clap(long)]
        messages: bool,
    },

    /// Select the work items to analyze
    Sample {
        #[clap(long, value_enum)]
        strategy: Option<SamplingStrategy>,

        /// Seed for reproducible random selection
        #[clap(long)]
        seed: Option<u64>,
    },

    /// Analyze the selected work items, resuming from the last checkpoint
    Run {
        #[clap(long, value_enum)]
        preset: Option<ConcurrencyPreset>,

        /// Remove a lock left behind by a killed run
        #[clap(long)]
        force_unlock: bool,
    },

    /// Analyze only the items that failed in the last run
    RetryFailed {
        #[clap(long, value_enum)]
        preset: Option<ConcurrencyPreset>,

        #[clap(long)]
        force_unlock: bool,
    },

    /// Show progress of the current or last interrupted run
    Status,

    /// Consolidate stored results into one insight
    Aggregate {
        /// Also export the insight to this file
        #[clap(short, long)]
        output: Option<PathBuf>,

        #[clap(long, value_enum, default_value = "json")]
        format: ExportFormat,
    },

    /// Estimate wall-clock time and cost of a run
    Estimate {
        #[clap(long, value_enum)]
        preset: Option<ConcurrencyPreset>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .await
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    apply_overrides(&mut config, &cli);

    init_logging(&config.logging)?;

    match cli.command {
        Commands::Chunk { input, target_mb } => {
            if let Some(megabytes) = target_mb {
                config.chunking = config.chunking.with_target_mb(megabytes);
            }
            let pipeline = Pipeline::new(config)?;
            let manifest = pipeline
                .chunk(&input)
                .await
                .with_context(|| format!("failed to chunk {}", input.display()))?;
            info!(
                "Wrote {} items into {} chunks ({} skipped) under {}",
                manifest.total_items,
                manifest.total_chunks,
                manifest.skipped_records,
                pipeline.config().chunks_dir().display()
            );
            info!(
                "Average {:.1} items / {} per chunk",
                manifest.stats.average_items_per_chunk,
                format_bytes(manifest.stats.average_chunk_bytes as u64)
            );
        }

        Commands::Index { rebuild } => {
            let pipeline = Pipeline::new(config)?;
            if rebuild {
                let (index, report) = pipeline.rebuild_index().await?;
                info!(
                    "Indexed {} keys from {} records in {} chunks ({} keys span several chunks)",
                    index.len(),
                    report.records_scanned,
                    report.chunks_scanned,
                    report.spanning_keys
                );
            } else {
                let index = pipeline.index().await?;
                info!("Index holds {} keys", index.len());
            }
        }

        Commands::Lookup { key, messages } => {
            let pipeline = Pipeline::new(config)?;
            match pipeline.lookup(&key).await? {
                Some((file_name, item)) => {
                    let mut summary = serde_json::json!({
                        "id": item.id,
                        "chunk": file_name,
                        "message_count": item.len(),
                        "first_timestamp": item.first_timestamp(),
                        "last_timestamp": item.last_timestamp(),
                    });
                    if messages {
                        summary["messages"] = serde_json::to_value(&item.messages)?;
                    }
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                None => anyhow::bail!("no work item with key '{}'", key),
            }
        }

        Commands::Sample { strategy, seed } => {
            if let Some(strategy) = strategy {
                config.sampling.strategy = strategy;
            }
            if seed.is_some() {
                config.sampling.seed = seed;
            }
            let pipeline = Pipeline::new(config)?;
            let sample = pipeline.sample().await?;
            println!("{}", serde_json::to_string_pretty(&sample.report)?);
        }

        Commands::Run {
            preset,
            force_unlock,
        } => {
            if let Some(preset) = preset {
                config.scheduler = config.scheduler.with_preset(preset);
            }
            run(config, RunMode::Resume, force_unlock).await?;
        }

        Commands::RetryFailed {
            preset,
            force_unlock,
        } => {
            if let Some(preset) = preset {
                config.scheduler = config.scheduler.with_preset(preset);
            }
            run(config, RunMode::RetryFailed, force_unlock).await?;
        }

        Commands::Status => {
            let pipeline = Pipeline::new(config)?;
            match pipeline.status().await? {
                Some(checkpoint) => {
                    println!("Run {}", checkpoint.run_id);
                    println!("  {}", checkpoint.totals);
                    println!("  units completed: {}", checkpoint.units_completed);
                    println!("  last updated: {}", checkpoint.last_updated.to_rfc3339());
                    for failed in &checkpoint.failed {
                        println!(
                            "  failed {} after {} attempts: {}",
                            failed.id, failed.attempts, failed.error
                        );
                    }
                }
                None => println!("No run in progress"),
            }
        }

        Commands::Aggregate { output, format } => {
            let pipeline = Pipeline::new(config)?;
            let insight = pipeline.aggregate().await?;
            info!(
                "Insight over {} results written to {}",
                insight.total_results,
                pipeline.config().insight_path().display()
            );
            println!("{}", insight.summary);
            if let Some(path) = output {
                let bytes = export_insight(&insight, format)?;
                tokio::fs::write(&path, bytes)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!("Exported insight to {}", path.display());
            }
        }

        Commands::Estimate { preset } => {
            if let Some(preset) = preset {
                config.scheduler = config.scheduler.with_preset(preset);
            }
            let pipeline = Pipeline::new(config)?;
            let estimate = pipeline.estimate().await?;
            println!(
                "{} items in {} batches ({} checkpoint units): about {}",
                estimate.items,
                estimate.batches,
                estimate.units,
                format_duration(estimate.duration())
            );
            if let Some(cost) = estimate.estimated_cost {
                println!("Estimated cost: {:.2}", cost);
            }
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut PipelineConfig, cli: &Cli) {
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if cli.verbose {
        config.logging.level = LogLevel::Debug;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(url) = &cli.analyzer_url {
        config.analyzer.base_url = Some(url.clone());
    }
    if let Some(key) = &cli.api_key {
        config.analyzer.api_key = Some(key.clone());
    }
    if let Some(url) = &cli.consolidator_url {
        config.aggregation.consolidator_url = Some(url.clone());
    }
}

async fn run(config: PipelineConfig, mode: RunMode, force_unlock: bool) -> Result<()> {
    let analyzer = Arc::new(HttpAnalyzer::new(&config.analyzer)?);
    let pipeline = Pipeline::new(config)?;
    let prepared = pipeline
        .prepare_run(analyzer, mode, force_unlock)
        .await
        .context("failed to prepare run")?;

    let stop = prepared.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current checkpoint unit");
            stop.request_stop().await;
        }
    });

    let mut events = prepared.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RunEvent::RunStarted {
                    total_items,
                    to_process,
                    units,
                    ..
                }) => info!(
                    "Processing {} of {} items in {} units",
                    to_process, total_items, units
                ),
                Ok(RunEvent::UnitCompleted { unit, of, totals }) => {
                    info!("[{}/{}] {}", unit + 1, of, totals)
                }
                Ok(RunEvent::Completed { .. }) | Ok(RunEvent::Stopped { .. }) => break,
                Ok(RunEvent::UnitAborted { .. }) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Progress reporter skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let outcome = prepared.execute().await;
    reporter.abort();
    let outcome = outcome.context("run aborted; progress was checkpointed")?;

    match outcome.state {
        RunState::Stopped { .. } => {
            println!("Stopped: {}. Run again to resume.", outcome.totals)
        }
        _ if outcome.totals.failed > 0 => println!(
            "Completed: {}. Use retry-failed to retry the failed items.",
            outcome.totals
        ),
        _ => println!("Completed: {}", outcome.totals),
    }
    Ok(())
}
