use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use jobsieve_adapters::{
    AdapterError, JsonRecordsSource, RecordSource, SourceBatch, SourceContext, SourceIssue,
};
use jobsieve_classify::{
    ClassificationEngine, ClassificationRequest, Classifier, ClassifyError, EligibilityPolicy,
};
use jobsieve_core::{Posting, RawId, RawRecord};
use jobsieve_storage::{MemoryStore, PostingCollection, PostingStore, StateStores};
use jobsieve_sync::{
    FailureReport, Notifier, PipelineError, ReportDirNotifier, RunReport, SyncPipeline,
};
use tempfile::tempdir;

fn records(ids: impl IntoIterator<Item = String>) -> Vec<RawRecord> {
    ids.into_iter()
        .map(|id| RawRecord {
            title: Some(format!("Data Engineer {id}")),
            id: Some(RawId::Text(id)),
            ..Default::default()
        })
        .collect()
}

fn ids(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("job-{i}")).collect()
}

struct FakeSource {
    result: Mutex<Option<Result<SourceBatch, AdapterError>>>,
    batch: SourceBatch,
}

impl FakeSource {
    fn new(records: Vec<RawRecord>) -> Self {
        Self {
            result: Mutex::new(None),
            batch: SourceBatch::from_records(records),
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            result: Mutex::new(Some(Err(AdapterError::Message(message.to_string())))),
            batch: SourceBatch::default(),
        }
    }
}

#[async_trait]
impl RecordSource for FakeSource {
    fn source_id(&self) -> &str {
        "fake"
    }

    async fn fetch(&self, _ctx: &SourceContext) -> Result<SourceBatch, AdapterError> {
        match self.result.lock().expect("lock").take() {
            Some(result) => result,
            None => Ok(self.batch.clone()),
        }
    }
}

/// Accepts the ids in `accept` that it is shown; chunks containing `poison` get invalid JSON.
#[derive(Clone, Default)]
struct ScriptedClassifier {
    accept: Vec<String>,
    poison: Option<String>,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedClassifier {
    fn accepting(accept: &[&str]) -> Self {
        Self {
            accept: accept.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<String, ClassifyError> {
        let shown: Vec<String> = serde_json::from_str::<Vec<serde_json::Value>>(&request.payload)
            .expect("payload array")
            .into_iter()
            .map(|v| v["id"].as_str().expect("id").to_string())
            .collect();
        self.calls.lock().expect("lock").push(shown.clone());

        if let Some(poison) = &self.poison {
            if shown.contains(poison) {
                return Ok("Sure! Here are the matching jobs:".to_string());
            }
        }
        let accepted: Vec<serde_json::Value> = shown
            .iter()
            .filter(|id| self.accept.contains(id))
            .map(|id| serde_json::json!({ "id": id }))
            .collect();
        Ok(serde_json::to_string(&accepted).expect("json"))
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    runs: Arc<Mutex<Vec<RunReport>>>,
    failures: Arc<Mutex<Vec<FailureReport>>>,
}

impl RecordingNotifier {
    fn runs(&self) -> Vec<RunReport> {
        self.runs.lock().expect("lock").clone()
    }

    fn failures(&self) -> Vec<FailureReport> {
        self.failures.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_run(&self, report: &RunReport) -> Result<()> {
        self.runs.lock().expect("lock").push(report.clone());
        Ok(())
    }

    async fn notify_failure(&self, report: &FailureReport) -> Result<()> {
        self.failures.lock().expect("lock").push(report.clone());
        Ok(())
    }
}

fn pipeline(
    stores: StateStores,
    source: FakeSource,
    classifier: ScriptedClassifier,
    chunk_size: usize,
    notifier: RecordingNotifier,
) -> SyncPipeline {
    let engine =
        ClassificationEngine::new(Arc::new(classifier), EligibilityPolicy::default(), chunk_size);
    SyncPipeline::new(stores, Box::new(source), engine, Box::new(notifier))
}

async fn preload(store: &PostingStore, ids: &[String]) {
    let items = ids.iter().map(|id| Posting::with_id(id.clone())).collect();
    store
        .persist(&PostingCollection::new(items))
        .await
        .expect("preload");
}

#[tokio::test]
async fn empty_source_still_counts_the_run_and_notifies_once() {
    let stores = StateStores::in_memory();
    let classifier = ScriptedClassifier::default();
    let notifier = RecordingNotifier::default();
    let pipeline = pipeline(
        stores.clone(),
        FakeSource::new(Vec::new()),
        classifier.clone(),
        8,
        notifier.clone(),
    );

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.new_postings, 0);
    assert_eq!(summary.new_classified, 0);
    assert!(classifier.calls().is_empty());

    let ledger = stores.ledger.load().await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].run_count, 1);
    assert_eq!(ledger[0].cumulative_scraped, 0);

    assert_eq!(notifier.runs().len(), 1);
    assert!(notifier.failures().is_empty());
    assert!(stores.last_run.load().await.expect("last run").success);
}

#[tokio::test]
async fn only_unseen_postings_reach_the_classifier() {
    let stores = StateStores::in_memory();
    preload(&stores.seen, &ids(0..5)).await;

    let classifier = ScriptedClassifier::accepting(&["job-7", "job-12"]);
    let notifier = RecordingNotifier::default();
    let pipeline = pipeline(
        stores.clone(),
        FakeSource::new(records(ids(0..15))),
        classifier.clone(),
        10,
        notifier.clone(),
    );

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.scraped, 15);
    assert_eq!(summary.new_postings, 10);
    assert_eq!(summary.new_classified, 2);
    assert_eq!(summary.total_postings, 15);

    let calls = classifier.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], ids(5..15));

    let classified = stores.classified.load().await;
    assert!(classified.contains("job-7"));
    assert!(classified.contains("job-12"));
    assert_eq!(classified.len(), 2);

    let runs = notifier.runs();
    assert_eq!(runs[0].new_postings, 10);
    assert_eq!(runs[0].new_classified_count(), 2);
    assert_eq!(runs[0].today.cumulative_classified, 2);
}

#[tokio::test]
async fn unparseable_chunk_does_not_fail_the_run() {
    let stores = StateStores::in_memory();
    let classifier = ScriptedClassifier {
        accept: vec!["job-1".into(), "job-9".into()],
        poison: Some("job-9".into()),
        ..Default::default()
    };
    let notifier = RecordingNotifier::default();
    let pipeline = pipeline(
        stores.clone(),
        FakeSource::new(records(ids(0..12))),
        classifier.clone(),
        8,
        notifier.clone(),
    );

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(classifier.calls().len(), 2);
    assert_eq!(summary.failed_chunks, 1);
    assert_eq!(summary.new_classified, 1);
    // every posting counts as seen even though its chunk failed
    assert_eq!(stores.seen.load().await.len(), 12);
    assert_eq!(notifier.runs()[0].failed_chunks, 1);
}

#[tokio::test]
async fn already_classified_postings_are_not_stored_twice() {
    let stores = StateStores::in_memory();
    preload(&stores.classified, &["job-2".to_string()]).await;

    let classifier = ScriptedClassifier::accepting(&["job-2", "job-3"]);
    let notifier = RecordingNotifier::default();
    let pipeline = pipeline(
        stores.clone(),
        FakeSource::new(records(ids(0..4))),
        classifier,
        8,
        notifier.clone(),
    );

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.new_classified, 1);
    assert_eq!(stores.classified.load().await.len(), 2);
    let reported: Vec<String> = notifier.runs()[0]
        .new_classified
        .iter()
        .map(|p| p.id.clone())
        .collect();
    assert_eq!(reported, vec!["job-3".to_string()]);
}

#[tokio::test]
async fn persistence_failure_takes_the_failure_path() {
    let mut stores = StateStores::in_memory();
    stores.seen = PostingStore::new(
        "all",
        Arc::new(MemoryStore::new("all_jobs_history.json").rejecting_writes()),
    );
    let notifier = RecordingNotifier::default();
    let pipeline = pipeline(
        stores.clone(),
        FakeSource::new(records(ids(0..3))),
        ScriptedClassifier::accepting(&["job-0"]),
        8,
        notifier.clone(),
    );

    let err = pipeline.run_once().await.expect_err("store rejects writes");
    assert!(matches!(err, PipelineError::Store(_)));

    assert!(notifier.runs().is_empty());
    let failures = notifier.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.contains("all_jobs_history.json"));

    let ledger = stores.ledger.load().await;
    assert_eq!(ledger[0].run_count, 1);
    assert_eq!(ledger[0].cumulative_scraped, 0);
    assert_eq!(ledger[0].cumulative_classified, 0);

    let last = stores.last_run.load().await.expect("last run");
    assert!(!last.success);
    assert!(last.error.is_some());
}

#[tokio::test]
async fn failed_result_write_leaves_postings_for_the_next_run() {
    let healthy = StateStores::in_memory();
    let mut broken = healthy.clone();
    broken.classified = PostingStore::new(
        "classified",
        Arc::new(MemoryStore::new("filtered_jobs_history.json").rejecting_writes()),
    );

    let first = pipeline(
        broken,
        FakeSource::new(records(ids(0..3))),
        ScriptedClassifier::accepting(&["job-0"]),
        8,
        RecordingNotifier::default(),
    );
    first.run_once().await.expect_err("result store rejects writes");
    assert!(healthy.seen.load().await.is_empty());

    let second = pipeline(
        healthy.clone(),
        FakeSource::new(records(ids(0..3))),
        ScriptedClassifier::accepting(&["job-0"]),
        8,
        RecordingNotifier::default(),
    );
    let summary = second.run_once().await.expect("second run");
    assert_eq!(summary.new_postings, 3);
    assert_eq!(summary.new_classified, 1);
    assert!(healthy.classified.load().await.contains("job-0"));
    assert_eq!(healthy.seen.load().await.len(), 3);
}

#[tokio::test]
async fn source_failure_takes_the_failure_path() {
    let stores = StateStores::in_memory();
    let classifier = ScriptedClassifier::default();
    let notifier = RecordingNotifier::default();
    let pipeline = pipeline(
        stores.clone(),
        FakeSource::failing("scraper exited with status 1"),
        classifier.clone(),
        8,
        notifier.clone(),
    );

    let err = pipeline.run_once().await.expect_err("source fails");
    assert!(matches!(err, PipelineError::Source(_)));
    assert!(classifier.calls().is_empty());
    assert_eq!(notifier.failures().len(), 1);
    assert_eq!(stores.ledger.load().await[0].run_count, 1);
    assert!(stores.seen.load().await.is_empty());
}

#[tokio::test]
async fn repeating_a_run_finds_nothing_new() {
    let stores = StateStores::in_memory();
    let classifier = ScriptedClassifier::accepting(&["job-1"]);
    let notifier = RecordingNotifier::default();
    let pipeline = pipeline(
        stores.clone(),
        FakeSource::new(records(ids(0..6))),
        classifier.clone(),
        8,
        notifier.clone(),
    );

    pipeline.run_once().await.expect("first run");
    let second = pipeline.run_once().await.expect("second run");

    assert_eq!(second.new_postings, 0);
    assert_eq!(second.new_classified, 0);
    assert_eq!(classifier.calls().len(), 1);
    assert_eq!(stores.seen.load().await.len(), 6);

    let ledger = stores.ledger.load().await;
    assert_eq!(ledger[0].run_count, 2);
    assert_eq!(ledger[0].cumulative_scraped, 6);
    assert_eq!(ledger[0].run_detail.len(), 2);
}

#[tokio::test]
async fn duplicate_ids_within_a_batch_are_classified_once() {
    let stores = StateStores::in_memory();
    let classifier = ScriptedClassifier::accepting(&["job-1"]);
    let mut batch = records(ids(0..3));
    batch.extend(records(vec!["job-1".to_string()]));
    let pipeline = pipeline(
        stores.clone(),
        FakeSource::new(batch),
        classifier.clone(),
        8,
        RecordingNotifier::default(),
    );

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.scraped, 4);
    assert_eq!(summary.new_postings, 3);
    assert_eq!(classifier.calls()[0], ids(0..3));
    assert_eq!(stores.classified.load().await.len(), 1);
}

#[tokio::test]
async fn corrupt_history_is_treated_as_empty() {
    let mut stores = StateStores::in_memory();
    stores.seen = PostingStore::new(
        "all",
        Arc::new(MemoryStore::new("all_jobs_history.json").with_bytes("[{\"id\": ")),
    );
    let pipeline = pipeline(
        stores.clone(),
        FakeSource::new(records(ids(0..2))),
        ScriptedClassifier::default(),
        8,
        RecordingNotifier::default(),
    );

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.new_postings, 2);
    assert_eq!(stores.seen.load().await.len(), 2);
}

#[tokio::test]
async fn source_issues_do_not_stop_the_run() {
    let stores = StateStores::in_memory();
    let source = FakeSource {
        result: Mutex::new(Some(Ok(SourceBatch {
            records: records(ids(0..2)),
            errors: vec![SourceIssue {
                position: Some(2),
                message: "card without an id".into(),
            }],
        }))),
        batch: SourceBatch::default(),
    };
    let pipeline = pipeline(
        stores,
        source,
        ScriptedClassifier::default(),
        8,
        RecordingNotifier::default(),
    );

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.source_errors, 1);
    assert_eq!(summary.new_postings, 2);
}

#[tokio::test]
async fn fixture_run_writes_state_and_reports_to_disk() {
    let state = tempdir().expect("state dir");
    let reports = tempdir().expect("reports dir");
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/sample-listing/records.json");

    let classifier = ScriptedClassifier::accepting(&["4100000001", "4100000003"]);
    let engine = ClassificationEngine::new(
        Arc::new(classifier.clone()),
        EligibilityPolicy::default(),
        8,
    );
    let pipeline = SyncPipeline::new(
        StateStores::json_files(state.path()),
        Box::new(JsonRecordsSource::new(fixture)),
        engine,
        Box::new(ReportDirNotifier::new(reports.path())),
    );

    let summary = pipeline.run_once().await.expect("fixture run");
    assert_eq!(summary.scraped, 5);
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.new_classified, 2);

    for file in [
        "all_jobs_history.json",
        "filtered_jobs_history.json",
        "last_run.json",
        "daily_stats.json",
    ] {
        assert!(state.path().join(file).exists(), "{file} missing");
    }

    let run_dir = reports.path().join(summary.run_id.to_string());
    let report = std::fs::read_to_string(run_dir.join("run_report.md")).expect("report");
    assert!(report.contains("Data Engineer"));
    assert!(run_dir.join("new_postings.json").exists());

    let stored: Vec<Posting> = serde_json::from_slice(
        &std::fs::read(state.path().join("filtered_jobs_history.json")).expect("classified"),
    )
    .expect("json");
    let stored_ids: Vec<&str> = stored.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(stored_ids, vec!["4100000001", "4100000003"]);
}
