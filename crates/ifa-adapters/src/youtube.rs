use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ifa_core::{ContentRecord, ContentRef, Platform};
use ifa_storage::{HttpFetchError, HttpFetcher};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{attach_transcript, ConfigError, ContentFetcher, FetchError, TranscriptDirectory};

pub const DEFAULT_YOUTUBE_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";
const SERVICE: &str = "youtube";

/// Reasons YouTube reports with a 403 that clear up on their own.
const TRANSIENT_403_REASONS: [&str; 3] = ["quotaExceeded", "rateLimitExceeded", "userRateLimitExceeded"];

#[derive(Debug, Clone)]
pub struct YouTubeConfig {
    pub api_key: String,
    pub base_url: String,
}

impl YouTubeConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_YOUTUBE_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    #[serde(default)]
    snippet: VideoSnippet,
    #[serde(default)]
    statistics: VideoStatistics,
    #[serde(default)]
    content_details: ContentDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: Option<String>,
    description: Option<String>,
    channel_title: Option<String>,
    channel_id: Option<String>,
    published_at: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    thumbnails: BTreeMap<String, Thumbnail>,
    category_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

// The Data API returns counts as decimal strings.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ContentDetails {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
    #[serde(default)]
    statistics: ChannelStatistics,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatistics {
    subscriber_count: Option<String>,
    #[serde(default)]
    hidden_subscriber_count: bool,
}

/// Parses YouTube's ISO-8601 durations (`PT1H2M3S`, `P1DT5M`) into seconds.
pub fn parse_iso8601_duration(raw: &str) -> Option<u64> {
    let body = raw.trim().strip_prefix('P')?;
    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut in_time = false;
    let mut saw_unit = false;
    for ch in body.chars() {
        match ch {
            'T' if !in_time && digits.is_empty() => in_time = true,
            '0'..='9' => digits.push(ch),
            unit => {
                let value: u64 = digits.parse().ok()?;
                digits.clear();
                let factor = match (unit, in_time) {
                    ('W', false) => 604_800,
                    ('D', false) => 86_400,
                    ('H', true) => 3_600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return None,
                };
                total = total.checked_add(value.checked_mul(factor)?)?;
                saw_unit = true;
            }
        }
    }
    (digits.is_empty() && saw_unit).then_some(total)
}

fn best_thumbnail(thumbnails: &BTreeMap<String, Thumbnail>) -> Option<String> {
    ["maxres", "high", "medium", "default"]
        .iter()
        .find_map(|size| thumbnails.get(*size))
        .map(|t| t.url.clone())
}

fn count(raw: Option<&String>) -> Option<u64> {
    raw.and_then(|value| value.trim().parse().ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn content_from_item(content: &ContentRef, item: VideoItem, fetched_at: DateTime<Utc>) -> ContentRecord {
    let mut record = ContentRecord::new(content, fetched_at);
    let snippet = item.snippet;
    record.thumbnail_url = best_thumbnail(&snippet.thumbnails);
    record.title = non_empty(snippet.title);
    record.description = non_empty(snippet.description);
    record.channel_name = non_empty(snippet.channel_title);
    record.channel_id = non_empty(snippet.channel_id);
    record.published_at = snippet
        .published_at
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));
    record.tags = snippet.tags;
    record.category_id = non_empty(snippet.category_id);
    record.view_count = count(item.statistics.view_count.as_ref());
    record.like_count = count(item.statistics.like_count.as_ref());
    record.comment_count = count(item.statistics.comment_count.as_ref());
    record.duration_seconds = item
        .content_details
        .duration
        .as_deref()
        .and_then(parse_iso8601_duration);
    record
}

fn subscribers(statistics: &ChannelStatistics) -> Option<u64> {
    if statistics.hidden_subscriber_count {
        None
    } else {
        count(statistics.subscriber_count.as_ref())
    }
}

/// YouTube Data API v3 metadata plus transcripts from the transcript directory.
pub struct YouTubeContentFetcher {
    http: Arc<HttpFetcher>,
    config: YouTubeConfig,
    transcripts: TranscriptDirectory,
}

impl YouTubeContentFetcher {
    pub fn new(http: Arc<HttpFetcher>, config: YouTubeConfig, transcripts: TranscriptDirectory) -> Self {
        Self {
            http,
            config,
            transcripts,
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        resource: &str,
        part: &str,
        id: &str,
    ) -> Result<ListResponse<T>, FetchError> {
        let url = format!("{}/{resource}", self.config.base_url.trim_end_matches('/'));
        let request = self
            .http
            .request(Method::GET, &url)
            .query(&[("part", part), ("id", id), ("key", self.config.api_key.as_str())]);
        let response = self.http.execute(SERVICE, request).await.map_err(map_http_error)?;
        response.json().map_err(|err| {
            FetchError::Transient(format!("decoding youtube {resource} response: {err}"))
        })
    }

    async fn channel_subscribers(&self, channel_id: &str) -> Option<u64> {
        match self.list::<ChannelItem>("channels", "statistics", channel_id).await {
            Ok(response) => response.items.first().and_then(|c| subscribers(&c.statistics)),
            Err(err) => {
                warn!(channel_id, error = %err, "channel lookup failed; subscribers left empty");
                None
            }
        }
    }
}

fn map_http_error(err: HttpFetchError) -> FetchError {
    if let HttpFetchError::Status { status: 403, body, .. } = &err {
        if TRANSIENT_403_REASONS.iter().any(|reason| body.contains(reason)) {
            return FetchError::Transient(err.to_string());
        }
    }
    FetchError::from(err)
}

#[async_trait]
impl ContentFetcher for YouTubeContentFetcher {
    fn name(&self) -> &'static str {
        "youtube-data-api"
    }

    fn supports(&self, platform: Platform) -> bool {
        platform == Platform::Youtube
    }

    async fn preflight(&self) -> Result<(), ConfigError> {
        if self.config.api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential("youtube api key".into()));
        }
        match self.list::<VideoItem>("videos", "id", "dQw4w9WgXcQ").await {
            Ok(_) => Ok(()),
            Err(FetchError::Permanent(detail)) => Err(ConfigError::CredentialRejected {
                service: SERVICE.into(),
                detail,
            }),
            Err(FetchError::Transient(detail)) => {
                warn!(%detail, "youtube preflight inconclusive; continuing");
                Ok(())
            }
        }
    }

    async fn fetch(&self, content: &ContentRef) -> Result<ContentRecord, FetchError> {
        let response = self
            .list::<VideoItem>("videos", "snippet,statistics,contentDetails", &content.video_id)
            .await?;
        let Some(item) = response.items.into_iter().find(|i| i.id == content.video_id) else {
            return Err(FetchError::Permanent(
                "video unavailable (private, deleted, or wrong id)".into(),
            ));
        };

        let mut record = content_from_item(content, item, Utc::now());
        if let Some(channel_id) = record.channel_id.clone() {
            record.channel_subscribers = self.channel_subscribers(&channel_id).await;
        }

        let transcript = self.transcripts.load(content).await?;
        if transcript.is_none() {
            info!(video_id = %content.video_id, "no transcript on disk");
        }
        attach_transcript(&mut record, transcript);
        debug!(
            video_id = %content.video_id,
            views = ?record.view_count,
            has_transcript = record.has_transcript(),
            "fetched youtube metadata"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/youtube")
            .join(name)
    }

    #[test]
    fn iso_durations_parse_to_seconds() {
        assert_eq!(parse_iso8601_duration("PT0S"), Some(0));
        assert_eq!(parse_iso8601_duration("PT15M33S"), Some(933));
        assert_eq!(parse_iso8601_duration("PT1H2M3S"), Some(3723));
        assert_eq!(parse_iso8601_duration("P1DT1S"), Some(86_401));
        assert_eq!(parse_iso8601_duration("PT"), None);
        assert_eq!(parse_iso8601_duration("15:33"), None);
        assert_eq!(parse_iso8601_duration("PT5"), None);
    }

    #[test]
    fn video_fixture_maps_to_content_record() {
        let raw = std::fs::read_to_string(fixture("videos_list.json")).expect("fixture");
        let response: ListResponse<VideoItem> = serde_json::from_str(&raw).expect("parse");
        let content = ContentRef {
            platform: Platform::Youtube,
            video_id: "uTc3U2Cqen4".into(),
        };
        let item = response.items.into_iter().next().expect("one item");
        let record = content_from_item(&content, item, Utc::now());

        assert_eq!(record.title.as_deref(), Some("How I switched careers into data analytics"));
        assert_eq!(record.channel_id.as_deref(), Some("UC123channel"));
        assert_eq!(record.view_count, Some(48_213));
        assert_eq!(record.like_count, Some(2_104));
        assert_eq!(record.comment_count, None);
        assert_eq!(record.duration_seconds, Some(933));
        assert_eq!(
            record.thumbnail_url.as_deref(),
            Some("https://i.ytimg.com/vi/uTc3U2Cqen4/hqdefault.jpg")
        );
        assert_eq!(record.tags, vec!["career".to_string(), "data".to_string()]);
        assert!(record.published_at.is_some());
    }

    #[test]
    fn hidden_subscriber_counts_are_null() {
        let raw = std::fs::read_to_string(fixture("channels_list.json")).expect("fixture");
        let response: ListResponse<ChannelItem> = serde_json::from_str(&raw).expect("parse");
        assert_eq!(subscribers(&response.items[0].statistics), Some(153_000));
        assert_eq!(subscribers(&response.items[1].statistics), None);
    }

    #[test]
    fn quota_403_is_transient_other_403_is_permanent() {
        let quota = HttpFetchError::Status {
            service: SERVICE.into(),
            status: 403,
            disposition: ifa_storage::RetryDisposition::NonRetryable,
            body: r#"{"error":{"errors":[{"reason":"quotaExceeded"}]}}"#.into(),
        };
        assert!(matches!(map_http_error(quota), FetchError::Transient(_)));

        let forbidden = HttpFetchError::Status {
            service: SERVICE.into(),
            status: 403,
            disposition: ifa_storage::RetryDisposition::NonRetryable,
            body: "forbidden".into(),
        };
        assert!(matches!(map_http_error(forbidden), FetchError::Permanent(_)));
    }
}
