//! Snapshot persistence for jobsieve: posting stores, the run ledger and the last-run record.
//!
//! Every artifact is a self-contained snapshot rewritten whole on save. Writes go to a temp
//! file in the destination directory and are renamed into place, so a reader sees either the
//! previous snapshot or the new one, never a partial file.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsieve_core::{DailyStat, Posting, RunDetail, RunInfo, LEDGER_RETENTION_DAYS};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsieve-storage";

pub const ALL_POSTINGS_FILE: &str = "all_jobs_history.json";
pub const CLASSIFIED_POSTINGS_FILE: &str = "filtered_jobs_history.json";
pub const LAST_RUN_FILE: &str = "last_run.json";
pub const DAILY_STATS_FILE: &str = "daily_stats.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading snapshot {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing snapshot {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing snapshot {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Read-side failures are recoverable: the caller treats the snapshot as empty history.
    pub fn is_read_error(&self) -> bool {
        matches!(self, StoreError::Read { .. } | StoreError::Corrupt { .. })
    }
}

/// Outcome of a completed snapshot write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotWrite {
    pub location: String,
    pub byte_size: usize,
    pub content_hash: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<SnapshotWrite, StoreError> {
    let location = path.display().to_string();
    let write_err = |source: std::io::Error| StoreError::Write {
        path: location.clone(),
        source,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(write_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(write_err(err));
    }

    Ok(SnapshotWrite {
        location,
        byte_size: bytes.len(),
        content_hash: sha256_hex(bytes),
    })
}

/// Storage backend for one self-contained document.
///
/// `load` returns `Ok(None)` when nothing has been saved yet.
#[async_trait]
pub trait DocumentStore<T>: Send + Sync
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn location(&self) -> String;

    async fn load(&self) -> Result<Option<T>, StoreError>;

    async fn save(&self, document: &T) -> Result<SnapshotWrite, StoreError>;
}

/// Pretty-printed JSON file backend.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }
}

#[async_trait]
impl<T> DocumentStore<T> for JsonFileStore
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn location(&self) -> String {
        self.display_path()
    }

    async fn load(&self) -> Result<Option<T>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.display_path(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: self.display_path(),
                source,
            })
    }

    async fn save(&self, document: &T) -> Result<SnapshotWrite, StoreError> {
        let mut bytes =
            serde_json::to_vec_pretty(document).map_err(|source| StoreError::Serialize {
                path: self.display_path(),
                source,
            })?;
        bytes.push(b'\n');
        write_atomic(&self.path, &bytes).await
    }
}

/// In-process backend holding the serialized document; used where no filesystem is wanted.
pub struct MemoryStore<T> {
    label: String,
    bytes: Mutex<Option<Vec<u8>>>,
    reject_writes: bool,
    _doc: PhantomData<fn() -> T>,
}

impl<T> MemoryStore<T> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            bytes: Mutex::new(None),
            reject_writes: false,
            _doc: PhantomData,
        }
    }

    /// Preload raw bytes, e.g. a corrupt snapshot.
    pub fn with_bytes(self, bytes: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut guard) = self.bytes.lock() {
            *guard = Some(bytes.into());
        }
        self
    }

    /// Every `save` fails with [`StoreError::Write`].
    pub fn rejecting_writes(mut self) -> Self {
        self.reject_writes = true;
        self
    }

    pub fn raw(&self) -> Option<Vec<u8>> {
        self.bytes.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl<T> DocumentStore<T> for MemoryStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn location(&self) -> String {
        format!("memory:{}", self.label)
    }

    async fn load(&self) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.raw() else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: DocumentStore::<T>::location(self),
                source,
            })
    }

    async fn save(&self, document: &T) -> Result<SnapshotWrite, StoreError> {
        let location = DocumentStore::<T>::location(self);
        if self.reject_writes {
            return Err(StoreError::Write {
                path: location,
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "store is read-only"),
            });
        }
        let bytes = serde_json::to_vec(document).map_err(|source| StoreError::Serialize {
            path: location.clone(),
            source,
        })?;
        let snapshot = SnapshotWrite {
            location,
            byte_size: bytes.len(),
            content_hash: sha256_hex(&bytes),
        };
        if let Ok(mut guard) = self.bytes.lock() {
            *guard = Some(bytes);
        }
        Ok(snapshot)
    }
}

/// Postings loaded into memory together with their id index.
#[derive(Debug, Clone, Default)]
pub struct PostingCollection {
    items: Vec<Posting>,
    ids: HashSet<String>,
}

impl PostingCollection {
    pub fn new(items: Vec<Posting>) -> Self {
        let ids = jobsieve_core::existing_ids(&items);
        Self { items, ids }
    }

    pub fn items(&self) -> &[Posting] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Posting> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn existing_ids(&self) -> &HashSet<String> {
        &self.ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn filter_new(&self, candidates: &[Posting]) -> Vec<Posting> {
        jobsieve_core::filter_new(candidates, &self.ids)
    }

    /// Admit the candidates not yet present and return them, in candidate order.
    ///
    /// Repeated ids inside `candidates` are admitted once (first occurrence).
    pub fn append_new(&mut self, candidates: &[Posting]) -> Vec<Posting> {
        let mut admitted = Vec::new();
        for posting in self.filter_new(candidates) {
            let Some(id) = posting.identity().map(str::to_string) else {
                continue;
            };
            if self.ids.insert(id) {
                self.items.push(posting.clone());
                admitted.push(posting);
            }
        }
        admitted
    }
}

/// Append-only posting collection persisted as one snapshot.
#[derive(Clone)]
pub struct PostingStore {
    name: &'static str,
    backend: Arc<dyn DocumentStore<Vec<Posting>>>,
}

impl PostingStore {
    pub fn new(name: &'static str, backend: Arc<dyn DocumentStore<Vec<Posting>>>) -> Self {
        Self { name, backend }
    }

    pub fn json_file(name: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::new(name, Arc::new(JsonFileStore::new(path)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Full snapshot, or an empty collection when absent or unreadable.
    pub async fn load(&self) -> PostingCollection {
        match self.backend.load().await {
            Ok(Some(items)) => {
                debug!(store = self.name, count = items.len(), "loaded posting snapshot");
                PostingCollection::new(items)
            }
            Ok(None) => {
                info!(store = self.name, location = %self.location(), "no snapshot yet; starting empty");
                PostingCollection::default()
            }
            Err(err) => {
                warn!(store = self.name, error = %err, "unreadable snapshot; treating as empty history");
                PostingCollection::default()
            }
        }
    }

    pub async fn persist(&self, collection: &PostingCollection) -> Result<SnapshotWrite, StoreError> {
        let written = self.backend.save(&collection.items).await?;
        info!(
            store = self.name,
            count = collection.len(),
            bytes = written.byte_size,
            sha256 = %written.content_hash,
            "persisted posting snapshot"
        );
        Ok(written)
    }
}

/// Fold one run into the ledger and enforce retention; returns the updated day.
pub fn apply_run(
    stats: &mut Vec<DailyStat>,
    at: DateTime<Utc>,
    scraped: u64,
    classified: u64,
) -> DailyStat {
    let today = at.date_naive();
    let idx = match stats.iter().position(|s| s.date == today) {
        Some(idx) => idx,
        None => {
            stats.push(DailyStat::empty(today));
            stats.len() - 1
        }
    };

    let entry = &mut stats[idx];
    entry.run_count += 1;
    entry.cumulative_scraped += scraped;
    entry.cumulative_classified += classified;
    entry.run_detail.push(RunDetail {
        time: at.format("%H:%M").to_string(),
        scraped,
        classified,
    });
    let updated = entry.clone();

    stats.sort_by_key(|s| s.date);
    if stats.len() > LEDGER_RETENTION_DAYS {
        let excess = stats.len() - LEDGER_RETENTION_DAYS;
        stats.drain(..excess);
    }
    updated
}

/// Rolling per-day statistics (UTC days).
#[derive(Clone)]
pub struct RunLedger {
    backend: Arc<dyn DocumentStore<Vec<DailyStat>>>,
}

impl RunLedger {
    pub fn new(backend: Arc<dyn DocumentStore<Vec<DailyStat>>>) -> Self {
        Self { backend }
    }

    pub fn json_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonFileStore::new(path)))
    }

    pub async fn load(&self) -> Vec<DailyStat> {
        match self.backend.load().await {
            Ok(stats) => stats.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "unreadable daily ledger; starting a fresh one");
                Vec::new()
            }
        }
    }

    /// The entry for the UTC day containing `at`, if any run was recorded that day.
    pub async fn day_of(&self, at: DateTime<Utc>) -> Option<DailyStat> {
        let day = at.date_naive();
        self.load().await.into_iter().find(|s| s.date == day)
    }

    pub async fn today(&self) -> Option<DailyStat> {
        self.day_of(Utc::now()).await
    }

    /// Not idempotent: each call counts one more run.
    pub async fn record_run(
        &self,
        at: DateTime<Utc>,
        scraped: u64,
        classified: u64,
    ) -> Result<DailyStat, StoreError> {
        let mut stats = self.load().await;
        let today = apply_run(&mut stats, at, scraped, classified);
        self.backend.save(&stats).await?;
        info!(
            date = %today.date,
            runs = today.run_count,
            scraped = today.cumulative_scraped,
            classified = today.cumulative_classified,
            "daily ledger updated"
        );
        Ok(today)
    }
}

/// The single most-recent run summary.
#[derive(Clone)]
pub struct LastRunStore {
    backend: Arc<dyn DocumentStore<RunInfo>>,
}

impl LastRunStore {
    pub fn new(backend: Arc<dyn DocumentStore<RunInfo>>) -> Self {
        Self { backend }
    }

    pub fn json_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonFileStore::new(path)))
    }

    pub async fn load(&self) -> Option<RunInfo> {
        match self.backend.load().await {
            Ok(info) => info,
            Err(err) => {
                warn!(error = %err, "unreadable last-run record");
                None
            }
        }
    }

    pub async fn record_last_run(&self, info: &RunInfo) -> Result<SnapshotWrite, StoreError> {
        self.backend.save(info).await
    }
}

/// The four persisted artifacts of a state directory.
#[derive(Clone)]
pub struct StateStores {
    pub seen: PostingStore,
    pub classified: PostingStore,
    pub ledger: RunLedger,
    pub last_run: LastRunStore,
}

impl StateStores {
    pub fn json_files(state_dir: impl AsRef<Path>) -> Self {
        let dir = state_dir.as_ref();
        Self {
            seen: PostingStore::json_file("all", dir.join(ALL_POSTINGS_FILE)),
            classified: PostingStore::json_file("classified", dir.join(CLASSIFIED_POSTINGS_FILE)),
            ledger: RunLedger::json_file(dir.join(DAILY_STATS_FILE)),
            last_run: LastRunStore::json_file(dir.join(LAST_RUN_FILE)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            seen: PostingStore::new("all", Arc::new(MemoryStore::new(ALL_POSTINGS_FILE))),
            classified: PostingStore::new(
                "classified",
                Arc::new(MemoryStore::new(CLASSIFIED_POSTINGS_FILE)),
            ),
            ledger: RunLedger::new(Arc::new(MemoryStore::new(DAILY_STATS_FILE))),
            last_run: LastRunStore::new(Arc::new(MemoryStore::new(LAST_RUN_FILE))),
        }
    }
}
