//! Chunked eligibility classification through an external semantic classifier.
//!
//! The eligibility policy is never evaluated locally. It is rendered as natural-language
//! instructions and sent, together with a bounded chunk of postings and a response schema, to
//! a classifier backend that answers with the subset of ids it judges eligible.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobsieve_core::{dedupe_by_id, Posting, RawId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "jobsieve-classify";

/// Postings per classification request.
pub const DEFAULT_CHUNK_SIZE: usize = 8;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("classifier returned no content")]
    EmptyResponse,
}

/// Natural-language eligibility rules sent to the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityPolicy {
    pub role_titles: Vec<String>,
    /// When false the title list is a hint; skills and experience carry the decision.
    pub strict_titles: bool,
    pub skills: Vec<String>,
    pub min_skill_matches: u32,
    pub max_experience_years: u32,
    pub experience_phrases: Vec<String>,
    pub extra_guidance: Option<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            role_titles: strings(&[
                "Data Engineer",
                "Software Engineer",
                "Backend Developer",
                "Full Stack Developer",
            ]),
            strict_titles: false,
            skills: strings(&[
                "Python", "ReactJS", "VueJS", "Postgres", "SQL", "AWS", "Azure", "DevOps",
                "Docker", "Kubernetes", "PySpark", "ETL", "ELT", "Node.js", "FastAPI", "Django",
                "Flask",
            ]),
            min_skill_matches: 2,
            max_experience_years: 2,
            experience_phrases: strings(&[
                "entry level",
                "freshers",
                "0-2 years",
                "1 year",
                "up to 2 years",
            ]),
            extra_guidance: None,
        }
    }
}

impl EligibilityPolicy {
    pub async fn from_yaml_file(path: &Path) -> Result<Self, ClassifyError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ClassifyError::Config(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&text)
            .map_err(|e| ClassifyError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn render_instructions(&self) -> String {
        let titles = self
            .role_titles
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let title_note = if self.strict_titles {
            "The title must match one of these roles."
        } else {
            "Titles vary, so treat similar software development roles as matching and weigh skills and experience more heavily."
        };

        let mut text = format!(
            "You receive a JSON array of job postings. Each posting has an `id` and may include \
             title, organization, location, posted_at, link and description.\n\
             Return only the postings that meet ALL of the following criteria:\n\n\
             1. Role title: contains {titles}, or a similar role. {title_note}\n\n\
             2. Skills: mentions at least {min} of these skills (case-insensitive): {skills}\n\n\
             3. Experience: specifies or implies 0-{years} years of experience ({phrases}, etc.)\n",
            min = self.min_skill_matches,
            skills = self.skills.join(", "),
            years = self.max_experience_years,
            phrases = self
                .experience_phrases
                .iter()
                .map(|p| format!("\"{p}\""))
                .collect::<Vec<_>>()
                .join(", "),
        );
        if let Some(extra) = self.extra_guidance.as_deref().filter(|s| !s.trim().is_empty()) {
            text.push_str(&format!("\nAdditional guidance: {}\n", extra.trim()));
        }
        text.push_str(
            "\nRespond with a JSON array of the matching postings, each object carrying at least its `id`. \
             Return an empty array when nothing matches. No text outside the JSON.",
        );
        text
    }
}

/// Output contract: an array of objects, each requiring a string `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseSchema;

impl ResponseSchema {
    /// OpenAPI-subset schema as accepted by Gemini `responseSchema`.
    pub fn gemini(&self) -> JsonValue {
        json!({
            "type": "ARRAY",
            "items": {
                "type": "OBJECT",
                "properties": { "id": { "type": "STRING" } },
                "required": ["id"]
            }
        })
    }

    /// Strict JSON Schema. Strict mode requires an object root, so the array sits under `items`.
    pub fn json_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "id": { "type": "string" } },
                        "required": ["id"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["items"],
            "additionalProperties": false
        })
    }
}

/// One chunk's request: policy text, serialized postings and the output constraint.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub chunk_index: usize,
    pub instructions: String,
    pub payload: String,
    pub schema: ResponseSchema,
}

impl ClassificationRequest {
    /// Instructions followed by the serialized chunk, as one text.
    pub fn prompt(&self) -> String {
        format!("{}\n\nPostings JSON:\n{}", self.instructions, self.payload)
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// Raw response text, expected to be a JSON array of objects with an `id`.
    async fn classify(&self, request: &ClassificationRequest) -> Result<String, ClassifyError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("jobsieve/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

fn build_http_client(config: &HttpClientConfig) -> Result<reqwest::Client, ClassifyError> {
    let mut builder = reqwest::Client::builder().timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder
        .build()
        .map_err(|e| ClassifyError::Config(format!("building http client: {e}")))
}

fn api_key_from_env(var: &str) -> Result<String, ClassifyError> {
    std::env::var(var)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| ClassifyError::Config(format!("{var} not set")))
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ClassifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = %status, error = %body, "classifier api error");
    Err(ClassifyError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Google Gemini `generateContent` with a JSON response schema.
#[derive(Clone)]
pub struct GeminiClassifier {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClassifier {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        http: &HttpClientConfig,
    ) -> Result<Self, ClassifyError> {
        Ok(Self {
            http: build_http_client(http)?,
            api_key: api_key.into(),
            model: model.into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        })
    }

    /// Reads `GEMINI_API_KEY`.
    pub fn from_env(model: impl Into<String>, http: &HttpClientConfig) -> Result<Self, ClassifyError> {
        Self::new(api_key_from_env("GEMINI_API_KEY")?, model, http)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[async_trait]
impl Classifier for GeminiClassifier {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<String, ClassifyError> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt() }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": request.schema.gemini(),
            }
        });

        let response = self
            .http
            .post(format!("{}/models/{}:generateContent", self.base_url, self.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClassifyError::Network(e.to_string()))?;
        let response = error_for_status(response).await?;

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ClassifyError::Parse(e.to_string()))?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ClassifyError::EmptyResponse);
        }
        Ok(text)
    }
}

/// OpenAI-compatible chat completions with a strict `json_schema` response format.
#[derive(Clone)]
pub struct OpenAiClassifier {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiClassifier {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        http: &HttpClientConfig,
    ) -> Result<Self, ClassifyError> {
        Ok(Self {
            http: build_http_client(http)?,
            api_key: api_key.into(),
            model: model.into(),
            base_url: "https://api.openai.com/v1".to_string(),
        })
    }

    /// Reads `OPENAI_API_KEY`.
    pub fn from_env(model: impl Into<String>, http: &HttpClientConfig) -> Result<Self, ClassifyError> {
        Self::new(api_key_from_env("OPENAI_API_KEY")?, model, http)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// `{"items": [...]}` -> `[...]`.
fn unwrap_items_envelope(content: &str) -> Result<String, ClassifyError> {
    let value: JsonValue =
        serde_json::from_str(content).map_err(|e| ClassifyError::Parse(e.to_string()))?;
    match value {
        JsonValue::Object(mut map) => map
            .remove("items")
            .map(|items| items.to_string())
            .ok_or_else(|| ClassifyError::Parse("response object has no `items`".to_string())),
        array @ JsonValue::Array(_) => Ok(array.to_string()),
        other => Err(ClassifyError::Parse(format!("unexpected response shape: {other}"))),
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    fn name(&self) -> &str {
        "openai"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<String, ClassifyError> {
        let body = json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                { "role": "system", "content": request.instructions },
                { "role": "user", "content": format!("Postings JSON:\n{}", request.payload) }
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "eligible_postings",
                    "strict": true,
                    "schema": request.schema.json_schema(),
                }
            }
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClassifyError::Network(e.to_string()))?;
        let response = error_for_status(response).await?;

        let parsed: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| ClassifyError::Parse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ClassifyError::EmptyResponse)?;
        unwrap_items_envelope(&content)
    }
}

/// Token bucket spacing classification calls to the service's rate limit.
#[derive(Debug)]
pub struct RequestPacer {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<PacerState>,
}

#[derive(Debug, Clone, Copy)]
struct PacerState {
    tokens: u32,
    last_refill: Instant,
}

impl RequestPacer {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(PacerState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// One request at a time, evenly spaced.
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self::new(1, Duration::from_secs(60) / requests)
    }

    /// Wait for a request slot. A zero refill interval never waits.
    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
            if refills > 0 {
                let room = u128::from(self.capacity - state.tokens);
                if refills >= room {
                    state.tokens = self.capacity;
                    state.last_refill = now;
                } else {
                    // room < capacity, so this fits in u32
                    let refills = refills as u32;
                    state.tokens += refills;
                    state.last_refill += self.refill_every * refills;
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = (state.last_refill + self.refill_every).saturating_duration_since(now);
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct AcceptedItem {
    #[serde(alias = "job_id")]
    id: RawId,
}

/// Parse a classifier answer into accepted ids, in response order.
pub fn parse_accepted_ids(text: &str) -> Result<Vec<String>, ClassifyError> {
    let items: Vec<AcceptedItem> = serde_json::from_str(text.trim())
        .map_err(|e| ClassifyError::Parse(format!("response is not an array of {{id}}: {e}")))?;
    Ok(items.into_iter().map(|item| item.id.into_text()).collect())
}

/// What the classifier sees of a posting.
#[derive(Serialize)]
struct PostingView<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    posted_at: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

impl<'a> From<&'a Posting> for PostingView<'a> {
    fn from(p: &'a Posting) -> Self {
        Self {
            id: &p.id,
            title: p.title.as_deref(),
            organization: p.organization.as_deref(),
            location: p.location.as_deref(),
            posted_at: p.posted_at.as_deref(),
            link: p.link.as_deref(),
            description: p.description.as_deref(),
        }
    }
}

pub fn serialize_chunk(chunk: &[Posting]) -> Result<String, ClassifyError> {
    let view: Vec<PostingView<'_>> = chunk.iter().map(PostingView::from).collect();
    serde_json::to_string(&view).map_err(|e| ClassifyError::Parse(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub size: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationOutcome {
    pub accepted: Vec<Posting>,
    pub chunks: usize,
    pub failed_chunks: Vec<ChunkFailure>,
    /// Ids returned by the classifier that were not part of the submitted chunk.
    pub unknown_ids: usize,
}

pub struct ClassificationEngine {
    classifier: Arc<dyn Classifier>,
    policy: EligibilityPolicy,
    chunk_size: usize,
    schema: ResponseSchema,
    pacer: Option<Arc<RequestPacer>>,
}

impl ClassificationEngine {
    pub fn new(classifier: Arc<dyn Classifier>, policy: EligibilityPolicy, chunk_size: usize) -> Self {
        Self {
            classifier,
            policy,
            chunk_size: chunk_size.max(1),
            schema: ResponseSchema,
            pacer: None,
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<RequestPacer>) -> Self {
        self.pacer = Some(pacer);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn policy(&self) -> &EligibilityPolicy {
        &self.policy
    }

    /// Classify `postings` chunk by chunk; a failing chunk contributes nothing and never
    /// aborts the batch.
    pub async fn classify(&self, postings: &[Posting]) -> ClassificationOutcome {
        let mut outcome = ClassificationOutcome::default();
        if postings.is_empty() {
            info!("no postings to classify");
            return outcome;
        }

        let instructions = self.policy.render_instructions();
        let mut joined: Vec<Posting> = Vec::new();

        for (chunk_index, chunk) in postings.chunks(self.chunk_size).enumerate() {
            outcome.chunks += 1;
            let span = info_span!("classify_chunk", chunk = chunk_index + 1, size = chunk.len());

            let result = self
                .classify_chunk(chunk_index, chunk, &instructions)
                .instrument(span)
                .await;

            match result {
                Ok(ids) => {
                    let by_id: HashMap<&str, &Posting> =
                        chunk.iter().map(|p| (p.id.as_str(), p)).collect();
                    let mut passed = 0usize;
                    for id in &ids {
                        match by_id.get(id.as_str()) {
                            Some(posting) => {
                                joined.push((*posting).clone());
                                passed += 1;
                            }
                            None => {
                                debug!(chunk = chunk_index + 1, id = %id, "classifier returned an id outside the chunk");
                                outcome.unknown_ids += 1;
                            }
                        }
                    }
                    info!(chunk = chunk_index + 1, passed, "chunk classified");
                }
                Err(err) => {
                    warn!(chunk = chunk_index + 1, error = %err, "chunk classification failed; skipping chunk");
                    outcome.failed_chunks.push(ChunkFailure {
                        chunk_index,
                        size: chunk.len(),
                        message: err.to_string(),
                    });
                }
            }
        }

        outcome.accepted = dedupe_by_id(joined);
        info!(
            chunks = outcome.chunks,
            failed = outcome.failed_chunks.len(),
            accepted = outcome.accepted.len(),
            classifier = self.classifier.name(),
            "classification finished"
        );
        outcome
    }

    async fn classify_chunk(
        &self,
        chunk_index: usize,
        chunk: &[Posting],
        instructions: &str,
    ) -> Result<Vec<String>, ClassifyError> {
        if let Some(pacer) = &self.pacer {
            pacer.take().await;
        }
        let request = ClassificationRequest {
            chunk_index,
            instructions: instructions.to_string(),
            payload: serialize_chunk(chunk)?,
            schema: self.schema,
        };
        let text = self.classifier.classify(&request).await?;
        parse_accepted_ids(&text)
    }
}
