//! External collaborator contracts plus the YouTube, transcript and LLM implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ifa_core::{ContentRecord, ContentRef, EnrichmentRecord, Platform, TranscriptSegment};
use ifa_storage::{HttpFetchError, RetryDisposition};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

mod claude;
mod youtube;

pub use claude::{
    parse_analysis, parse_extraction, strip_code_fences, transcript_payload, window_transcript,
    ClaudeConfig, ClaudeEnricher, DEFAULT_ANTHROPIC_BASE_URL, MAX_TRANSCRIPT_CHARS,
};
pub use youtube::{
    parse_iso8601_duration, YouTubeConfig, YouTubeContentFetcher, DEFAULT_YOUTUBE_BASE_URL,
};

pub const CRATE_NAME: &str = "ifa-adapters";

pub const NO_TRANSCRIPT: &str = "no transcript available";

/// Fatal preconditions; surfaced before any work item is attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),
    #[error("credential rejected by {service}: {detail}")]
    CredentialRejected { service: String, detail: String },
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl From<HttpFetchError> for FetchError {
    fn from(err: HttpFetchError) -> Self {
        match err.disposition() {
            RetryDisposition::Retryable => FetchError::Transient(err.to_string()),
            RetryDisposition::NonRetryable => FetchError::Permanent(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("transient enrichment failure: {0}")]
    Transient(String),
    #[error("malformed enrichment response: {0}")]
    MalformedResponse(String),
    #[error("{0}")]
    Permanent(String),
}

impl From<HttpFetchError> for EnrichError {
    fn from(err: HttpFetchError) -> Self {
        match err.disposition() {
            RetryDisposition::Retryable => EnrichError::Transient(err.to_string()),
            RetryDisposition::NonRetryable => EnrichError::Permanent(err.to_string()),
        }
    }
}

/// Content-fetch capability: `fetch(video_id) -> ContentRecord | Transient | Permanent`.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, platform: Platform) -> bool;

    /// Checks credentials and settings; an error aborts the stage before any item runs.
    async fn preflight(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn fetch(&self, content: &ContentRef) -> Result<ContentRecord, FetchError>;
}

/// Everything the enricher needs about one content item.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentRequest {
    pub content: ContentRef,
    pub title: Option<String>,
    pub segments: Vec<TranscriptSegment>,
    pub transcript_text: Option<String>,
    pub offset_hint_seconds: Option<u32>,
}

impl EnrichmentRequest {
    pub fn from_content(record: &ContentRecord, offset_hint_seconds: Option<u32>) -> Self {
        Self {
            content: record.content_ref(),
            title: record.title.clone(),
            segments: record.transcript.clone().unwrap_or_default(),
            transcript_text: record.transcript_text.clone(),
            offset_hint_seconds,
        }
    }

    pub fn has_transcript(&self) -> bool {
        !self.segments.is_empty()
            || self
                .transcript_text
                .as_deref()
                .is_some_and(|text| !text.trim().is_empty())
    }
}

/// Enrichment capability: `enrich(text) -> EnrichmentRecord | error`.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn model(&self) -> &str;

    async fn preflight(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentRecord, EnrichError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
    pub text: String,
}

/// Hand-off directory of the captions / speech-to-text collaborator:
/// `<root>/<video_id>.json` (segment list) or `<root>/<video_id>.txt`.
#[derive(Debug, Clone)]
pub struct TranscriptDirectory {
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TranscriptFile {
    Segments(Vec<TranscriptSegment>),
    Wrapped { segments: Vec<TranscriptSegment> },
}

impl TranscriptDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `Ok(None)` when no transcript exists for the item.
    pub async fn load(&self, content: &ContentRef) -> Result<Option<Transcript>, FetchError> {
        let stem = sanitize_file_stem(&content.video_id);
        let json_path = self.root.join(format!("{stem}.json"));
        if let Some(raw) = read_optional(&json_path).await? {
            let parsed: TranscriptFile = serde_json::from_str(&raw).map_err(|err| {
                FetchError::Permanent(format!(
                    "transcript {} is not a segment list: {err}",
                    json_path.display()
                ))
            })?;
            let segments = match parsed {
                TranscriptFile::Segments(segments) | TranscriptFile::Wrapped { segments } => {
                    segments
                }
            };
            let text = segments
                .iter()
                .map(|s| s.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            return Ok((!text.is_empty()).then_some(Transcript { segments, text }));
        }

        let txt_path = self.root.join(format!("{stem}.txt"));
        Ok(read_optional(&txt_path).await?.and_then(|raw| {
            let text = raw.trim().to_string();
            (!text.is_empty()).then_some(Transcript {
                segments: Vec::new(),
                text,
            })
        }))
    }
}

fn sanitize_file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

async fn read_optional(path: &Path) -> Result<Option<String>, FetchError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(FetchError::Transient(format!(
            "reading transcript {}: {err}",
            path.display()
        ))),
    }
}

/// Applies a transcript lookup to a freshly built content record.
pub fn attach_transcript(record: &mut ContentRecord, transcript: Option<Transcript>) {
    match transcript {
        Some(transcript) => {
            record.transcript = (!transcript.segments.is_empty()).then_some(transcript.segments);
            record.transcript_text = Some(transcript.text);
            record.transcript_error = None;
        }
        None => {
            record.transcript = None;
            record.transcript_text = None;
            record.transcript_error = Some(NO_TRANSCRIPT.to_string());
        }
    }
}

/// Content for platforms without a metadata API: the transcript is the content.
#[derive(Debug, Clone)]
pub struct TranscriptOnlyFetcher {
    transcripts: TranscriptDirectory,
}

impl TranscriptOnlyFetcher {
    pub fn new(transcripts: TranscriptDirectory) -> Self {
        Self { transcripts }
    }
}

#[async_trait]
impl ContentFetcher for TranscriptOnlyFetcher {
    fn name(&self) -> &'static str {
        "transcript-only"
    }

    fn supports(&self, platform: Platform) -> bool {
        matches!(
            platform,
            Platform::InstagramReel | Platform::Story | Platform::Tiktok
        )
    }

    async fn fetch(&self, content: &ContentRef) -> Result<ContentRecord, FetchError> {
        let Some(transcript) = self.transcripts.load(content).await? else {
            return Err(FetchError::Permanent(NO_TRANSCRIPT.to_string()));
        };
        let mut record = ContentRecord::new(content, Utc::now());
        attach_transcript(&mut record, Some(transcript));
        debug!(content = %content, "loaded transcript-only content");
        Ok(record)
    }
}

/// Routes each item to the first fetcher that supports its platform.
#[derive(Clone, Default)]
pub struct PlatformRouter {
    fetchers: Vec<Arc<dyn ContentFetcher>>,
}

impl PlatformRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.fetchers.push(fetcher);
        self
    }

    pub fn fetcher_for(&self, platform: Platform) -> Option<&Arc<dyn ContentFetcher>> {
        self.fetchers.iter().find(|f| f.supports(platform))
    }
}

#[async_trait]
impl ContentFetcher for PlatformRouter {
    fn name(&self) -> &'static str {
        "platform-router"
    }

    fn supports(&self, platform: Platform) -> bool {
        self.fetcher_for(platform).is_some()
    }

    async fn preflight(&self) -> Result<(), ConfigError> {
        for fetcher in &self.fetchers {
            fetcher.preflight().await?;
        }
        Ok(())
    }

    async fn fetch(&self, content: &ContentRef) -> Result<ContentRecord, FetchError> {
        match self.fetcher_for(content.platform) {
            Some(fetcher) => fetcher.fetch(content).await,
            None => {
                warn!(content = %content, "no content fetcher for platform");
                Err(FetchError::Permanent(format!(
                    "no content fetcher for platform {}",
                    content.platform
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn reel(id: &str) -> ContentRef {
        ContentRef {
            platform: Platform::InstagramReel,
            video_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn transcript_directory_reads_json_then_text() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("abc.json"),
            r#"[{"text":"hello ","start":0.0,"duration":1.5},{"text":"world","start":1.5,"duration":2.0}]"#,
        )
        .expect("write json");
        std::fs::write(dir.path().join("xyz.txt"), "  plain words \n").expect("write txt");
        let transcripts = TranscriptDirectory::new(dir.path());

        let json = transcripts.load(&reel("abc")).await.expect("json").expect("present");
        assert_eq!(json.segments.len(), 2);
        assert_eq!(json.text, "hello world");

        let txt = transcripts.load(&reel("xyz")).await.expect("txt").expect("present");
        assert!(txt.segments.is_empty());
        assert_eq!(txt.text, "plain words");

        assert!(transcripts.load(&reel("missing")).await.expect("missing").is_none());
    }

    #[tokio::test]
    async fn transcript_only_fetcher_treats_missing_transcript_as_permanent() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("DH6K1jYJDCB.txt"), "promo text").expect("write");
        let fetcher = TranscriptOnlyFetcher::new(TranscriptDirectory::new(dir.path()));

        let record = fetcher.fetch(&reel("DH6K1jYJDCB")).await.expect("fetched");
        assert!(record.has_transcript());
        assert_eq!(record.transcript_error, None);

        match fetcher.fetch(&reel("other")).await {
            Err(FetchError::Permanent(reason)) => assert_eq!(reason, NO_TRANSCRIPT),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn router_rejects_platforms_without_fetcher() {
        let dir = tempdir().expect("tempdir");
        let router = PlatformRouter::new().with(Arc::new(TranscriptOnlyFetcher::new(
            TranscriptDirectory::new(dir.path()),
        )));
        assert!(router.supports(Platform::Tiktok));
        assert!(!router.supports(Platform::Youtube));

        let err = router
            .fetch(&ContentRef {
                platform: Platform::Youtube,
                video_id: "abc12345678".into(),
            })
            .await
            .expect_err("no fetcher");
        assert!(matches!(err, FetchError::Permanent(_)));
    }

    #[test]
    fn attach_missing_transcript_records_error() {
        let mut record = ContentRecord::new(&reel("a"), Utc::now());
        attach_transcript(&mut record, None);
        assert_eq!(record.transcript_error.as_deref(), Some(NO_TRANSCRIPT));
        assert!(!record.has_transcript());
    }
}
