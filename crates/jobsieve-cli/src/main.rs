use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jobsieve_adapters::SourceKind;
use jobsieve_storage::StateStores;
use jobsieve_sync::{report_daily_markdown, run_scheduled, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobsieve")]
#[command(about = "Incremental job posting sieve")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Flags that take precedence over the `JOBSIEVE_*` environment.
#[derive(Debug, Args)]
struct Overrides {
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    source: Option<PathBuf>,
    /// `json` or `html`
    #[arg(long, global = true)]
    source_kind: Option<String>,
    #[arg(long, global = true)]
    chunk_size: Option<usize>,
    #[arg(long, global = true)]
    policy: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut SyncConfig) -> Result<()> {
        if let Some(dir) = self.state_dir {
            config.state_dir = dir;
        }
        if let Some(path) = self.source {
            config.source_path = path;
        }
        if let Some(kind) = self.source_kind {
            config.source_kind = kind.parse::<SourceKind>()?;
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if let Some(path) = self.policy {
            config.policy_path = Some(path);
        }
        Ok(())
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Run,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Print the daily ledger as markdown.
    Report {
        #[arg(long, default_value_t = 7)]
        days: usize,
    },
    /// Print the last run record and store sizes.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobsieve_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;
    cli.overrides.apply(&mut config)?;

    let command = cli.command.unwrap_or(if config.scheduler_enabled {
        Commands::Schedule
    } else {
        Commands::Run
    });

    info!(?command, state_dir = %config.state_dir.display(), "jobsieve starting");
    match command {
        Commands::Run => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} scraped={} new={} classified={} failed_chunks={}",
                summary.run_id,
                summary.scraped,
                summary.new_postings,
                summary.new_classified,
                summary.failed_chunks
            );
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            run_scheduled(config).await?;
        }
        Commands::Report { days } => {
            let stores = StateStores::json_files(&config.state_dir);
            println!("{}", report_daily_markdown(&stores, days).await);
        }
        Commands::Status => {
            let stores = StateStores::json_files(&config.state_dir);
            let seen = stores.seen.load().await;
            let classified = stores.classified.load().await;
            match stores.last_run.load().await {
                Some(run) => println!(
                    "{}",
                    serde_json::to_string_pretty(&run).context("rendering last run")?
                ),
                None => println!("no runs recorded in {}", config.state_dir.display()),
            }
            println!(
                "stored postings: {}, classified: {}",
                seen.len(),
                classified.len()
            );
        }
    }

    Ok(())
}
