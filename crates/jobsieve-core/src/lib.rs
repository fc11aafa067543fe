//! Core domain model for jobsieve: postings, raw source records and run statistics.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsieve-core";

/// Number of calendar days the run ledger keeps.
pub const LEDGER_RETENTION_DAYS: usize = 30;

/// Canonical job posting as persisted in both the dedup store and the result store.
///
/// Deserialization is lenient so that snapshots written by older tooling load without loss:
/// legacy field names are accepted as aliases, a missing `id` loads as an empty string (which
/// [`existing_ids`] ignores) and unknown keys are carried through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    #[serde(default, alias = "job_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, alias = "company", skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, alias = "place", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, alias = "job_link", skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, alias = "date", skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<String>,
    #[serde(
        default,
        alias = "scraped_at",
        deserialize_with = "lenient_utc_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, JsonValue>,
}

impl Posting {
    /// A posting with only its identity set.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            organization: None,
            location: None,
            link: None,
            description: None,
            posted_at: None,
            observed_at: None,
            extra: Map::new(),
        }
    }

    /// The posting id, or `None` when blank (such entries are never persistable keys).
    pub fn identity(&self) -> Option<&str> {
        let id = self.id.trim();
        (!id.is_empty()).then_some(id)
    }
}

/// Accepts RFC 3339 as well as naive `YYYY-MM-DDTHH:MM:SS[.f]` (read as UTC); anything else
/// degrades to `None` rather than failing the whole snapshot.
fn lenient_utc_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    let Some(JsonValue::String(text)) = raw else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&text) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    Ok(NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc()))
}

/// Identifier as supplied by a source: some emit strings, some bare numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    pub fn into_text(self) -> String {
        match self {
            RawId::Text(text) => text,
            RawId::Number(n) => n.to_string(),
        }
    }
}

/// Posting date as supplied by a source, before normalization into a single string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPostedAt {
    Timestamp(DateTime<FixedOffset>),
    Date(NaiveDate),
    EpochSeconds(i64),
    Text(String),
}

/// One record as produced by a source, prior to normalization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, alias = "job_id")]
    pub id: Option<RawId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "company")]
    pub organization: Option<String>,
    #[serde(default, alias = "place")]
    pub location: Option<String>,
    #[serde(default, alias = "job_link")]
    pub link: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "date", alias = "date_posted")]
    pub posted_at: Option<RawPostedAt>,
}

/// One pipeline run's contribution to a day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDetail {
    /// `HH:MM`, UTC.
    pub time: String,
    pub scraped: u64,
    #[serde(alias = "filtered")]
    pub classified: u64,
}

/// Aggregate counters for one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: NaiveDate,
    #[serde(default, alias = "runs")]
    pub run_count: u32,
    #[serde(default, alias = "total_scraped")]
    pub cumulative_scraped: u64,
    #[serde(default, alias = "total_filtered")]
    pub cumulative_classified: u64,
    #[serde(default, alias = "runs_detail")]
    pub run_detail: Vec<RunDetail>,
}

impl DailyStat {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            run_count: 0,
            cumulative_scraped: 0,
            cumulative_classified: 0,
            run_detail: Vec::new(),
        }
    }
}

/// Summary of the most recent run. Overwritten on every invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(deserialize_with = "required_utc_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "new_jobs")]
    pub new_postings: usize,
    #[serde(alias = "new_filtered")]
    pub new_classified: usize,
    #[serde(alias = "total_jobs")]
    pub total_postings: usize,
    #[serde(alias = "total_filtered")]
    pub total_classified: usize,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_success() -> bool {
    true
}

fn required_utc_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_utc_timestamp(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("timestamp is not an ISO-8601 datetime"))
}

/// Set of persistable ids in a collection; entries without an id are ignored.
pub fn existing_ids<'a>(collection: impl IntoIterator<Item = &'a Posting>) -> HashSet<String> {
    collection
        .into_iter()
        .filter_map(|posting| posting.identity().map(str::to_string))
        .collect()
}

/// Subsequence of `candidates` whose id is not in `existing`, in candidate order.
///
/// Candidates without an id are never admitted. Duplicates *within* `candidates` are not
/// collapsed here; run [`dedupe_by_id`] first when the input may repeat ids.
pub fn filter_new(candidates: &[Posting], existing: &HashSet<String>) -> Vec<Posting> {
    candidates
        .iter()
        .filter(|posting| {
            posting
                .identity()
                .is_some_and(|id| !existing.contains(id))
        })
        .cloned()
        .collect()
}

/// Collapses repeated ids: each id keeps the position of its first occurrence and the value of
/// its last. Entries without an id are dropped.
pub fn dedupe_by_id(items: Vec<Posting>) -> Vec<Posting> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Posting> = Vec::with_capacity(items.len());
    for item in items {
        let Some(id) = item.identity().map(str::to_string) else {
            continue;
        };
        match slots.get(&id) {
            Some(&slot) => out[slot] = item,
            None => {
                slots.insert(id, out.len());
                out.push(item);
            }
        }
    }
    out
}
