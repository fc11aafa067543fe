//! Sync pipeline orchestration: source -> normalize -> dedupe -> classify -> persist -> report.
//!
//! Stores are whole-file snapshots without locking, so two pipelines must never run against the
//! same state directory at once. Within a process the pipeline serializes itself through a run
//! lock, and the scheduler skips a tick while the previous run is still going.

pub mod notify;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobsieve_adapters::{
    normalize_batch, source_for, AdapterError, RecordSource, SourceContext, SourceKind,
};
use jobsieve_classify::{
    ClassificationEngine, Classifier, EligibilityPolicy, GeminiClassifier, HttpClientConfig,
    OpenAiClassifier, RequestPacer, DEFAULT_CHUNK_SIZE, DEFAULT_GEMINI_MODEL, DEFAULT_OPENAI_MODEL,
};
use jobsieve_core::{dedupe_by_id, RunInfo};
use jobsieve_storage::{StateStores, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use notify::{
    FailureReport, FanoutNotifier, LogNotifier, Notifier, ReportDirNotifier, RunReport,
};

pub const CRATE_NAME: &str = "jobsieve-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClassifierKind {
    Gemini,
    OpenAi,
}

impl FromStr for ClassifierKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(ClassifierKind::Gemini),
            "openai" | "open_ai" => Ok(ClassifierKind::OpenAi),
            other => anyhow::bail!("unknown classifier `{other}` (expected gemini or openai)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub source_kind: SourceKind,
    pub source_path: PathBuf,
    pub chunk_size: usize,
    pub policy_path: Option<PathBuf>,
    pub classifier: ClassifierKind,
    pub model: Option<String>,
    pub http_timeout_secs: u64,
    pub requests_per_minute: Option<u32>,
    pub scheduler_enabled: bool,
    pub cron: String,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// `1`, `true`, `yes` or `on`, in any case.
fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    ["1", "true", "yes", "on"]
        .iter()
        .any(|accepted| value.eq_ignore_ascii_case(accepted))
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            state_dir: PathBuf::from(env_or("JOBSIEVE_STATE_DIR", "job_data")),
            reports_dir: PathBuf::from(env_or("JOBSIEVE_REPORTS_DIR", "reports")),
            source_kind: env_or("JOBSIEVE_SOURCE_KIND", "json")
                .parse()
                .context("parsing JOBSIEVE_SOURCE_KIND")?,
            source_path: PathBuf::from(env_or("JOBSIEVE_SOURCE_PATH", "scraped_jobs.json")),
            chunk_size: env_parsed("JOBSIEVE_CHUNK_SIZE").unwrap_or(DEFAULT_CHUNK_SIZE),
            policy_path: std::env::var("JOBSIEVE_POLICY_PATH").ok().map(PathBuf::from),
            classifier: env_or("JOBSIEVE_CLASSIFIER", "gemini")
                .parse()
                .context("parsing JOBSIEVE_CLASSIFIER")?,
            model: std::env::var("JOBSIEVE_MODEL").ok(),
            http_timeout_secs: env_parsed("JOBSIEVE_HTTP_TIMEOUT_SECS").unwrap_or(60),
            requests_per_minute: env_parsed("JOBSIEVE_REQUESTS_PER_MINUTE"),
            scheduler_enabled: std::env::var("JOBSIEVE_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            cron: env_or("JOBSIEVE_CRON", "0 0 */6 * * *"),
        })
    }
}

/// Failures that end a run. Per-record and per-chunk problems never get here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("record source failed: {0}")]
    Source(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scraped: usize,
    pub malformed: usize,
    pub source_errors: usize,
    pub new_postings: usize,
    pub accepted: usize,
    pub new_classified: usize,
    pub failed_chunks: usize,
    pub total_postings: usize,
    pub total_classified: usize,
}

/// What a run had accomplished when it stopped; drives the failure path.
#[derive(Debug, Default)]
struct RunProgress {
    new_postings: usize,
    new_classified: usize,
    total_postings: usize,
    total_classified: usize,
    ledger_recorded: bool,
}

pub struct SyncPipeline {
    stores: StateStores,
    source: Box<dyn RecordSource>,
    engine: ClassificationEngine,
    notifier: Box<dyn Notifier>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        stores: StateStores,
        source: Box<dyn RecordSource>,
        engine: ClassificationEngine,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            stores,
            source,
            engine,
            notifier,
            run_lock: Mutex::new(()),
        }
    }

    /// Wire the production pipeline. Credentials are read from the environment here.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let policy = match &config.policy_path {
            Some(path) => EligibilityPolicy::from_yaml_file(path).await?,
            None => EligibilityPolicy::default(),
        };

        let http = HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        };
        let classifier: Arc<dyn Classifier> = match config.classifier {
            ClassifierKind::Gemini => Arc::new(GeminiClassifier::from_env(
                config.model.as_deref().unwrap_or(DEFAULT_GEMINI_MODEL),
                &http,
            )?),
            ClassifierKind::OpenAi => Arc::new(OpenAiClassifier::from_env(
                config.model.as_deref().unwrap_or(DEFAULT_OPENAI_MODEL),
                &http,
            )?),
        };

        let mut engine = ClassificationEngine::new(classifier, policy, config.chunk_size);
        if let Some(rpm) = config.requests_per_minute {
            engine = engine.with_pacer(Arc::new(RequestPacer::per_minute(rpm)));
        }

        let notifier = FanoutNotifier::new(vec![
            Box::new(LogNotifier),
            Box::new(ReportDirNotifier::new(config.reports_dir.clone())),
        ]);

        info!(
            state_dir = %config.state_dir.display(),
            source = %config.source_path.display(),
            chunk_size = engine.chunk_size(),
            classifier = ?config.classifier,
            "pipeline configured"
        );

        Ok(Self::new(
            StateStores::json_files(&config.state_dir),
            source_for(config.source_kind, config.source_path.clone()),
            engine,
            Box::new(notifier),
        ))
    }

    pub fn stores(&self) -> &StateStores {
        &self.stores
    }

    /// Run once, waiting for any in-flight run in this process to finish first.
    pub async fn run_once(&self) -> Result<SyncRunSummary, PipelineError> {
        let _guard = self.run_lock.lock().await;
        self.run_locked().await
    }

    /// Run once unless a run is already in progress, in which case nothing happens.
    pub async fn run_if_idle(&self) -> Result<Option<SyncRunSummary>, PipelineError> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("previous run still in progress; skipping this tick");
            return Ok(None);
        };
        self.run_locked().await.map(Some)
    }

    async fn run_locked(&self) -> Result<SyncRunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id);

        async {
            info!("starting run");
            let mut progress = RunProgress::default();
            match self.execute(run_id, started_at, &mut progress).await {
                Ok(summary) => {
                    info!(
                        new_postings = summary.new_postings,
                        new_classified = summary.new_classified,
                        "run completed"
                    );
                    Ok(summary)
                }
                Err(err) => {
                    error!(error = %err, "run failed");
                    self.handle_failure(run_id, &err, &progress).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        progress: &mut RunProgress,
    ) -> Result<SyncRunSummary, PipelineError> {
        let mut seen = self.stores.seen.load().await;
        let mut classified = self.stores.classified.load().await;
        progress.total_postings = seen.len();
        progress.total_classified = classified.len();
        info!(seen = seen.len(), classified = classified.len(), "loaded history");

        let ctx = SourceContext { run_id, started_at };
        let batch = self.source.fetch(&ctx).await?;
        for issue in &batch.errors {
            warn!(source = self.source.source_id(), position = ?issue.position, error = %issue.message, "source reported an error");
        }
        let source_errors = batch.errors.len();

        let normalized = normalize_batch(batch.records, started_at);
        let scraped = normalized.postings.len();
        let candidates = dedupe_by_id(normalized.postings);

        let new_postings = seen.filter_new(&candidates);
        progress.new_postings = new_postings.len();
        info!(scraped, new = new_postings.len(), "deduplicated against history");

        let outcome = if new_postings.is_empty() {
            info!("no new postings; skipping classification");
            Default::default()
        } else {
            self.engine.classify(&new_postings).await
        };

        let truly_new = classified.filter_new(&outcome.accepted);
        progress.new_classified = truly_new.len();
        if truly_new.len() < outcome.accepted.len() {
            info!(
                already_stored = outcome.accepted.len() - truly_new.len(),
                "classified postings already in the result store"
            );
        }

        seen.append_new(&new_postings);
        classified.append_new(&truly_new);
        progress.total_postings = seen.len();
        progress.total_classified = classified.len();

        // Results before history: a posting must never be marked seen without its verdict stored.
        self.stores.classified.persist(&classified).await?;
        self.stores.seen.persist(&seen).await?;

        let finished_at = Utc::now();
        self.stores
            .last_run
            .record_last_run(&RunInfo {
                run_id: Some(run_id),
                timestamp: finished_at,
                new_postings: new_postings.len(),
                new_classified: truly_new.len(),
                total_postings: seen.len(),
                total_classified: classified.len(),
                success: true,
                error: None,
            })
            .await?;

        let today = self
            .stores
            .ledger
            .record_run(finished_at, new_postings.len() as u64, truly_new.len() as u64)
            .await?;
        progress.ledger_recorded = true;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            scraped,
            malformed: normalized.malformed,
            source_errors,
            new_postings: new_postings.len(),
            accepted: outcome.accepted.len(),
            new_classified: truly_new.len(),
            failed_chunks: outcome.failed_chunks.len(),
            total_postings: seen.len(),
            total_classified: classified.len(),
        };

        let report = RunReport {
            run_id,
            finished_at,
            new_postings: new_postings.len(),
            new_classified: truly_new,
            failed_chunks: outcome.failed_chunks.len(),
            total_postings: seen.len(),
            total_classified: classified.len(),
            today,
        };
        if let Err(err) = self.notifier.notify_run(&report).await {
            error!(error = %format!("{err:#}"), "run notification failed");
        }

        Ok(summary)
    }

    /// Best effort: mark the last run failed, count the run in the ledger if that had not
    /// happened yet, and send the failure notification.
    async fn handle_failure(&self, run_id: Uuid, err: &PipelineError, progress: &RunProgress) {
        let failed_at = Utc::now();
        let info = RunInfo {
            run_id: Some(run_id),
            timestamp: failed_at,
            new_postings: progress.new_postings,
            new_classified: progress.new_classified,
            total_postings: progress.total_postings,
            total_classified: progress.total_classified,
            success: false,
            error: Some(err.to_string()),
        };
        if let Err(write_err) = self.stores.last_run.record_last_run(&info).await {
            error!(error = %write_err, "could not record failed run");
        }

        if !progress.ledger_recorded {
            if let Err(write_err) = self.stores.ledger.record_run(failed_at, 0, 0).await {
                error!(error = %write_err, "could not update daily ledger for failed run");
            }
        }

        let report = FailureReport {
            run_id,
            failed_at,
            error: err.to_string(),
        };
        if let Err(notify_err) = self.notifier.notify_failure(&report).await {
            error!(error = %format!("{notify_err:#}"), "failure notification failed");
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(&config).await?;
    Ok(pipeline.run_once().await?)
}

/// Cron scheduler that triggers [`SyncPipeline::run_if_idle`]; `None` when disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(config.cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_if_idle().await {
                Ok(Some(summary)) => info!(run_id = %summary.run_id, "scheduled run finished"),
                Ok(None) => {}
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Run on the configured cron schedule until Ctrl-C.
pub async fn run_scheduled(config: SyncConfig) -> Result<()> {
    let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
    let Some(mut sched) = maybe_build_scheduler(&config, pipeline).await? else {
        anyhow::bail!("scheduler is disabled (set JOBSIEVE_SCHEDULER_ENABLED=true)");
    };

    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.cron, "scheduler started");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

/// Markdown summary of the last `days` ledger entries and the most recent run.
pub async fn report_daily_markdown(stores: &StateStores, days: usize) -> String {
    let stats = stores.ledger.load().await;
    let last_run = stores.last_run.load().await;

    let mut lines = vec!["# Job Sieve Daily Report".to_string(), String::new()];
    match last_run {
        Some(run) => {
            lines.push(format!(
                "Last run: {} ({})",
                run.timestamp.format("%Y-%m-%d %H:%M UTC"),
                if run.success { "ok" } else { "FAILED" }
            ));
            lines.push(format!(
                "- new postings: {}, new classified: {}",
                run.new_postings, run.new_classified
            ));
            lines.push(format!(
                "- store totals: {} postings, {} classified",
                run.total_postings, run.total_classified
            ));
            if let Some(err) = run.error {
                lines.push(format!("- error: {err}"));
            }
        }
        None => lines.push("No runs recorded yet.".to_string()),
    }
    lines.push(String::new());

    for stat in stats.iter().rev().take(days.max(1)) {
        lines.push(format!("## {}", stat.date));
        lines.push(format!("- runs: {}", stat.run_count));
        lines.push(format!("- scraped: {}", stat.cumulative_scraped));
        lines.push(format!("- classified: {}", stat.cumulative_classified));
        for detail in &stat.run_detail {
            lines.push(format!(
                "  - {} scraped={} classified={}",
                detail.time, detail.scraped, detail.classified
            ));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}
