//! Run notifications: the notifier contract plus log and report-directory implementations.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsieve_core::{DailyStat, Posting};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info};
use uuid::Uuid;

/// How many newly classified postings a report lists inline.
pub const PREVIEW_LIMIT: usize = 3;

/// Per-run delta handed to notifiers after a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub finished_at: DateTime<Utc>,
    pub new_postings: usize,
    pub new_classified: Vec<Posting>,
    pub failed_chunks: usize,
    pub total_postings: usize,
    pub total_classified: usize,
    pub today: DailyStat,
}

impl RunReport {
    pub fn new_classified_count(&self) -> usize {
        self.new_classified.len()
    }

    pub fn preview(&self) -> &[Posting] {
        &self.new_classified[..self.new_classified.len().min(PREVIEW_LIMIT)]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub run_id: Uuid,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

/// Delivery channel for run outcomes. Exactly one of the two methods is called per run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_run(&self, report: &RunReport) -> Result<()>;

    async fn notify_failure(&self, report: &FailureReport) -> Result<()>;
}

fn or_na(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("N/A")
}

pub fn render_run_report(report: &RunReport) -> String {
    let mut out = format!(
        "# Job Sieve Run Report\n\n\
         - Run ID: `{}`\n\
         - Finished: {} UTC\n\n\
         ## This Run\n\
         - New postings: {}\n\
         - New classified postings: {}\n",
        report.run_id,
        report.finished_at.format("%Y-%m-%d %H:%M:%S"),
        report.new_postings,
        report.new_classified_count(),
    );
    if report.failed_chunks > 0 {
        out.push_str(&format!("- Classification chunks skipped: {}\n", report.failed_chunks));
    }
    out.push_str(&format!(
        "\n## Today ({})\n\
         - Runs: {}\n\
         - Postings scraped: {}\n\
         - Postings classified: {}\n\n\
         ## Store Totals\n\
         - All postings: {}\n\
         - Classified postings: {}\n",
        report.today.date,
        report.today.run_count,
        report.today.cumulative_scraped,
        report.today.cumulative_classified,
        report.total_postings,
        report.total_classified,
    ));

    if report.new_classified.is_empty() {
        out.push_str("\nNo new classified postings in this run.\n");
        return out;
    }

    out.push_str("\n## New Classified Postings\n");
    for (i, posting) in report.preview().iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {}\n   - Organization: {}\n   - Location: {}\n   - Link: {}\n   - Posted: {}\n",
            i + 1,
            or_na(&posting.title),
            or_na(&posting.organization),
            or_na(&posting.location),
            or_na(&posting.link),
            or_na(&posting.posted_at),
        ));
    }
    let rest = report.new_classified_count().saturating_sub(PREVIEW_LIMIT);
    if rest > 0 {
        out.push_str(&format!("\n... and {rest} more (see new_postings.json)\n"));
    }
    out
}

pub fn render_failure_report(report: &FailureReport) -> String {
    format!(
        "# Job Sieve Run FAILED\n\n\
         - Run ID: `{}`\n\
         - Time: {} UTC\n\
         - Error: {}\n\n\
         Check the run logs, the classifier credentials and the source output.\n",
        report.run_id,
        report.failed_at.format("%Y-%m-%d %H:%M:%S"),
        report.error,
    )
}

/// Emits reports as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_run(&self, report: &RunReport) -> Result<()> {
        if report.new_classified.is_empty() {
            info!(run_id = %report.run_id, new_postings = report.new_postings, "no new classified postings");
        }
        for posting in report.preview() {
            info!(
                run_id = %report.run_id,
                id = %posting.id,
                title = or_na(&posting.title),
                organization = or_na(&posting.organization),
                link = or_na(&posting.link),
                "new classified posting"
            );
        }
        info!(
            run_id = %report.run_id,
            new_postings = report.new_postings,
            new_classified = report.new_classified_count(),
            runs_today = report.today.run_count,
            "run report"
        );
        Ok(())
    }

    async fn notify_failure(&self, report: &FailureReport) -> Result<()> {
        error!(run_id = %report.run_id, error = %report.error, "run failed");
        Ok(())
    }
}

/// Writes `<root>/<run_id>/run_report.md` plus the full `new_postings.json` attachment, or
/// `failure.md` for a failed run.
#[derive(Debug, Clone)]
pub struct ReportDirNotifier {
    root: PathBuf,
}

impl ReportDirNotifier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn run_dir(&self, run_id: Uuid) -> Result<PathBuf> {
        let dir = self.root.join(run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(dir)
    }
}

#[async_trait]
impl Notifier for ReportDirNotifier {
    async fn notify_run(&self, report: &RunReport) -> Result<()> {
        let dir = self.run_dir(report.run_id).await?;
        fs::write(dir.join("run_report.md"), render_run_report(report))
            .await
            .context("writing run_report.md")?;

        if !report.new_classified.is_empty() {
            let attachment = serde_json::to_vec_pretty(&report.new_classified)
                .context("serializing new postings")?;
            fs::write(dir.join("new_postings.json"), attachment)
                .await
                .context("writing new_postings.json")?;
        }
        info!(dir = %dir.display(), "run report written");
        Ok(())
    }

    async fn notify_failure(&self, report: &FailureReport) -> Result<()> {
        let dir = self.run_dir(report.run_id).await?;
        fs::write(dir.join("failure.md"), render_failure_report(report))
            .await
            .context("writing failure.md")?;
        Ok(())
    }
}

/// Delivers to every inner notifier; one failing channel does not stop the others.
pub struct FanoutNotifier {
    inner: Vec<Box<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(inner: Vec<Box<dyn Notifier>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify_run(&self, report: &RunReport) -> Result<()> {
        let mut first_err = None;
        for notifier in &self.inner {
            if let Err(err) = notifier.notify_run(report).await {
                error!(error = %format!("{err:#}"), "notifier failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn notify_failure(&self, report: &FailureReport) -> Result<()> {
        let mut first_err = None;
        for notifier in &self.inner {
            if let Err(err) = notifier.notify_failure(report).await {
                error!(error = %format!("{err:#}"), "notifier failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use tempfile::tempdir;

    fn report(classified: usize) -> RunReport {
        let new_classified = (0..classified)
            .map(|i| Posting {
                title: Some(format!("Data Engineer {i}")),
                organization: Some("Acme".into()),
                ..Posting::with_id(format!("id-{i}"))
            })
            .collect();
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        RunReport {
            run_id: Uuid::new_v4(),
            finished_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().expect("ts"),
            new_postings: 10,
            new_classified,
            failed_chunks: 0,
            total_postings: 40,
            total_classified: 7,
            today: DailyStat {
                run_count: 2,
                ..DailyStat::empty(date)
            },
        }
    }

    #[test]
    fn report_previews_first_three_postings() {
        let text = render_run_report(&report(5));
        assert!(text.contains("1. Data Engineer 0"));
        assert!(text.contains("3. Data Engineer 2"));
        assert!(!text.contains("Data Engineer 3"));
        assert!(text.contains("... and 2 more"));
        assert!(text.contains("- Runs: 2"));
    }

    #[test]
    fn empty_report_says_so() {
        let text = render_run_report(&report(0));
        assert!(text.contains("No new classified postings"));
        assert!(!text.contains("## New Classified Postings"));
    }

    #[tokio::test]
    async fn report_dir_writes_markdown_and_attachment() {
        let dir = tempdir().expect("tempdir");
        let notifier = ReportDirNotifier::new(dir.path());
        let report = report(4);
        notifier.notify_run(&report).await.expect("notify");

        let run_dir = dir.path().join(report.run_id.to_string());
        assert!(run_dir.join("run_report.md").exists());
        let attached: Vec<Posting> = serde_json::from_slice(
            &std::fs::read(run_dir.join("new_postings.json")).expect("attachment"),
        )
        .expect("json");
        assert_eq!(attached.len(), 4);
    }

    #[tokio::test]
    async fn report_dir_writes_failure_file() {
        let dir = tempdir().expect("tempdir");
        let notifier = ReportDirNotifier::new(dir.path());
        let failure = FailureReport {
            run_id: Uuid::new_v4(),
            failed_at: Utc::now(),
            error: "writing snapshot job_data/all_jobs_history.json: disk full".into(),
        };
        notifier.notify_failure(&failure).await.expect("notify");
        let text = std::fs::read_to_string(
            dir.path().join(failure.run_id.to_string()).join("failure.md"),
        )
        .expect("failure.md");
        assert!(text.contains("disk full"));
    }
}
