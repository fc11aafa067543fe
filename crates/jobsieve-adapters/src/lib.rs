//! Record source contracts, file-backed sources and the record normalizer.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsieve_core::{Posting, RawId, RawPostedAt, RawRecord};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsieve-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// Non-fatal problem reported by a source alongside its records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIssue {
    pub position: Option<usize>,
    pub message: String,
}

/// Everything one source invocation produced: the records it could read and the errors it hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceBatch {
    pub records: Vec<RawRecord>,
    pub errors: Vec<SourceIssue>,
}

impl SourceBatch {
    pub fn from_records(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("reading source {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("malformed record: missing id")]
    MalformedRecord,
}

/// Producer of raw posting records. Holds no memory of earlier invocations.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, ctx: &SourceContext) -> Result<SourceBatch, AdapterError>;
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Collapse any source-supplied date representation into one string.
pub fn normalize_posted_at(raw: RawPostedAt) -> Option<String> {
    match raw {
        RawPostedAt::Timestamp(ts) => Some(ts.with_timezone(&Utc).to_rfc3339()),
        RawPostedAt::Date(date) => Some(date.format("%Y-%m-%d").to_string()),
        RawPostedAt::EpochSeconds(secs) => Some(
            DateTime::<Utc>::from_timestamp(secs, 0)
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| secs.to_string()),
        ),
        RawPostedAt::Text(text) => text_or_none(&text),
    }
}

/// Map one raw record into a [`Posting`], stamping `observed_at`.
pub fn normalize_record(raw: RawRecord, observed_at: DateTime<Utc>) -> Result<Posting, NormalizeError> {
    let id = raw
        .id
        .map(RawId::into_text)
        .and_then(|id| text_or_none(&id))
        .ok_or(NormalizeError::MalformedRecord)?;

    Ok(Posting {
        id,
        title: raw.title.as_deref().and_then(text_or_none),
        organization: raw.organization.as_deref().and_then(text_or_none),
        location: raw.location.as_deref().and_then(text_or_none),
        link: raw.link.as_deref().and_then(text_or_none),
        description: raw.description.as_deref().and_then(text_or_none),
        posted_at: raw.posted_at.and_then(normalize_posted_at),
        observed_at: Some(observed_at),
        extra: Default::default(),
    })
}

/// Normalized postings of a batch plus how many records were dropped as malformed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub postings: Vec<Posting>,
    pub malformed: usize,
}

pub fn normalize_batch(records: Vec<RawRecord>, observed_at: DateTime<Utc>) -> NormalizedBatch {
    let mut out = NormalizedBatch::default();
    for (position, raw) in records.into_iter().enumerate() {
        match normalize_record(raw, observed_at) {
            Ok(posting) => out.postings.push(posting),
            Err(err) => {
                warn!(position, error = %err, "dropping source record");
                out.malformed += 1;
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// JSON array of raw records, as written by an external scraper.
    JsonRecords,
    /// Saved job-search result page.
    HtmlListing,
}

impl FromStr for SourceKind {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "json_records" => Ok(SourceKind::JsonRecords),
            "html" | "html_listing" => Ok(SourceKind::HtmlListing),
            other => Err(AdapterError::Message(format!("unknown source kind `{other}`"))),
        }
    }
}

pub fn source_for(kind: SourceKind, path: impl Into<PathBuf>) -> Box<dyn RecordSource> {
    match kind {
        SourceKind::JsonRecords => Box::new(JsonRecordsSource::new(path)),
        SourceKind::HtmlListing => Box::new(HtmlListingSource::new(path)),
    }
}

async fn read_source_text(path: &Path) -> Result<String, AdapterError> {
    fs::read_to_string(path).await.map_err(|source| AdapterError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Reads a JSON array of raw records; each element is parsed on its own so one bad element
/// only costs that element.
#[derive(Debug, Clone)]
pub struct JsonRecordsSource {
    path: PathBuf,
}

impl JsonRecordsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub fn parse_json_records(text: &str) -> Result<SourceBatch, AdapterError> {
    let values: Vec<JsonValue> = serde_json::from_str(text)
        .map_err(|e| AdapterError::Message(format!("source is not a JSON array: {e}")))?;

    let mut batch = SourceBatch::default();
    for (position, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<RawRecord>(value) {
            Ok(record) => batch.records.push(record),
            Err(err) => batch.errors.push(SourceIssue {
                position: Some(position),
                message: err.to_string(),
            }),
        }
    }
    Ok(batch)
}

#[async_trait]
impl RecordSource for JsonRecordsSource {
    fn source_id(&self) -> &str {
        "json-records"
    }

    async fn fetch(&self, ctx: &SourceContext) -> Result<SourceBatch, AdapterError> {
        let text = read_source_text(&self.path).await?;
        let batch = parse_json_records(&text)?;
        debug!(
            run_id = %ctx.run_id,
            path = %self.path.display(),
            records = batch.records.len(),
            errors = batch.errors.len(),
            "read json records"
        );
        Ok(batch)
    }
}

/// Parses a saved job-search result page into one raw record per result card.
#[derive(Debug, Clone)]
pub struct HtmlListingSource {
    path: PathBuf,
}

impl HtmlListingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn first_text(card: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    card.select(sel)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>()))
}

fn first_attr(card: &ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    card.select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none)
}

/// `urn:li:jobPosting:4051` -> `4051`; falls back to `data-job-id`.
fn card_id(card: &ElementRef<'_>) -> Option<String> {
    card.value()
        .attr("data-entity-urn")
        .and_then(|urn| urn.rsplit(':').next())
        .and_then(text_or_none)
        .or_else(|| card.value().attr("data-job-id").and_then(text_or_none))
}

pub fn parse_listing_html(html: &str) -> Result<SourceBatch, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = selector("[data-entity-urn], [data-job-id]")?;
    let title_sel = selector(".base-search-card__title, h3")?;
    let org_sel = selector(".base-search-card__subtitle, h4")?;
    let location_sel = selector(".job-search-card__location")?;
    let link_sel = selector("a.base-card__full-link, a[href]")?;
    let time_sel = selector("time")?;
    let snippet_sel = selector(".base-search-card__snippet")?;

    let mut batch = SourceBatch::default();
    for (position, card) in document.select(&card_sel).enumerate() {
        let id = card_id(&card);
        if id.is_none() {
            batch.errors.push(SourceIssue {
                position: Some(position),
                message: "result card without a posting id".to_string(),
            });
        }
        let posted_at = first_attr(&card, &time_sel, "datetime")
            .or_else(|| first_text(&card, &time_sel))
            .map(|text| {
                serde_json::from_value::<RawPostedAt>(JsonValue::String(text.clone()))
                    .unwrap_or(RawPostedAt::Text(text))
            });

        batch.records.push(RawRecord {
            id: id.map(RawId::Text),
            title: first_text(&card, &title_sel),
            organization: first_text(&card, &org_sel),
            location: first_text(&card, &location_sel),
            link: first_attr(&card, &link_sel, "href"),
            description: first_text(&card, &snippet_sel),
            posted_at,
        });
    }
    Ok(batch)
}

#[async_trait]
impl RecordSource for HtmlListingSource {
    fn source_id(&self) -> &str {
        "html-listing"
    }

    async fn fetch(&self, ctx: &SourceContext) -> Result<SourceBatch, AdapterError> {
        let html = read_source_text(&self.path).await?;
        let batch = parse_listing_html(&html)?;
        debug!(
            run_id = %ctx.run_id,
            path = %self.path.display(),
            cards = batch.records.len(),
            "parsed listing page"
        );
        Ok(batch)
    }
}
