use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ifa_core::{ContentAnalysis, EnrichmentRecord, IntegrationExtraction, ScoreDimension, Scores, TranscriptSegment};
use ifa_storage::{HttpFetchError, HttpFetcher};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info_span, warn, Instrument};

use crate::{ConfigError, EnrichError, Enricher, EnrichmentRequest, NO_TRANSCRIPT};

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const SERVICE: &str = "anthropic";

pub const MAX_TRANSCRIPT_CHARS: usize = 150_000;
const WINDOW_MIN_SEGMENTS: usize = 50;
const WINDOW_BEFORE_SECS: f64 = 60.0;
const WINDOW_AFTER_SECS: f64 = 300.0;

const EXTRACTION_KEYS: [&str; 5] = [
    "integration_text",
    "integration_start_sec",
    "integration_duration_sec",
    "integration_position",
    "is_full_video_ad",
];

const ANALYSIS_KEYS: [&str; 19] = [
    "offer_type",
    "offer_details",
    "landing_type",
    "cta_type",
    "cta_urgency",
    "cta_text",
    "has_personal_story",
    "personal_story_type",
    "pain_points_addressed",
    "benefits_mentioned",
    "objection_handling",
    "social_proof",
    "scores",
    "overall_tone",
    "language",
    "product_positioning",
    "target_audience_implied",
    "competitive_mention",
    "price_mentioned",
];

const OFFER_TYPES: [&str; 8] = [
    "free_consultation",
    "free_course",
    "trial",
    "promo_code",
    "discount",
    "bootcamp",
    "career_change",
    "other",
];
const TONES: [&str; 8] = [
    "professional",
    "casual",
    "enthusiastic",
    "educational",
    "humorous",
    "inspirational",
    "conversational",
    "mixed",
];
const CTA_TYPES: [&str; 6] = ["link_click", "promo_code", "sign_up", "consultation", "download", "other"];
const LANDING_TYPES: [&str; 6] = ["website", "landing_page", "consultation_form", "app", "promo_page", "other"];

const SYSTEM_PROMPT: &str = "You analyse sponsored segments in creator videos. \
Answer with a single JSON object and nothing else.";

const EXTRACTION_PROMPT: &str = r#"Below is a video transcript as JSON segments (text, start, duration) or plain text.
Find the paid advertising integration inside it. The link the advertiser received hints that it starts near {offset} seconds.

Respond with JSON:
{"integration_text": string or null, "integration_start_sec": number or null, "integration_duration_sec": number or null, "integration_position": "beginning" | "middle" | "end" | null, "is_full_video_ad": boolean}

Transcript:
{transcript}"#;

const ANALYSIS_PROMPT: &str = r#"Describe the advertising integration below.

Respond with JSON containing exactly these keys:
offer_type ({offer_types}), offer_details, landing_type ({landing_types}), cta_type ({cta_types}), cta_urgency (none | low | medium | high), cta_text, has_personal_story (boolean), personal_story_type, pain_points_addressed (list of strings), benefits_mentioned (list of strings), objection_handling (boolean), social_proof, overall_tone ({tones}), language (ISO code), product_positioning, target_audience_implied, competitive_mention (boolean), price_mentioned (boolean), scores (object with integer 1-10 values for urgency, authenticity, storytelling, benefit_clarity, emotional_appeal, specificity, humor, professionalism).

Integration:
{integration}"#;

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Keeps segments from one minute before to five minutes after the offset
/// hint; the full transcript is returned when the window is empty.
pub fn window_transcript(segments: &[TranscriptSegment], offset_seconds: u32) -> Vec<TranscriptSegment> {
    let offset = f64::from(offset_seconds);
    let start = (offset - WINDOW_BEFORE_SECS).max(0.0);
    let end = offset + WINDOW_AFTER_SECS;
    let window = segments
        .iter()
        .filter(|s| s.start >= start && s.start <= end)
        .cloned()
        .collect::<Vec<_>>();
    if window.is_empty() {
        segments.to_vec()
    } else {
        window
    }
}

/// The transcript text sent to the model, windowed and length-capped.
pub fn transcript_payload(request: &EnrichmentRequest) -> String {
    let mut payload = if request.segments.is_empty() {
        request.transcript_text.clone().unwrap_or_default()
    } else {
        let segments = match request.offset_hint_seconds {
            Some(offset) if request.segments.len() > WINDOW_MIN_SEGMENTS => {
                window_transcript(&request.segments, offset)
            }
            _ => request.segments.clone(),
        };
        serde_json::to_string(&segments).unwrap_or_default()
    };

    if let Some((cut, _)) = payload.char_indices().nth(MAX_TRANSCRIPT_CHARS) {
        payload.truncate(cut);
        payload.push_str(" [truncated]");
    }
    payload
}

pub fn strip_code_fences(text: &str) -> &str {
    let mut text = text.trim();
    if text.starts_with("```") {
        text = text.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    }
    if let Some(stripped) = text.trim_end().strip_suffix("```") {
        text = stripped;
    }
    text.trim()
}

fn parse_object(raw: &str, required: &[&str]) -> Result<Map<String, Value>, EnrichError> {
    let value: Value = serde_json::from_str(strip_code_fences(raw))
        .map_err(|err| EnrichError::MalformedResponse(format!("invalid JSON: {err}")))?;
    let Value::Object(object) = value else {
        return Err(EnrichError::MalformedResponse("response is not a JSON object".into()));
    };
    let missing = required
        .iter()
        .filter(|key| !object.contains_key(**key))
        .copied()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(EnrichError::MalformedResponse(format!(
            "missing required keys: {}",
            missing.join(", ")
        )));
    }
    Ok(object)
}

fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_field(object: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = match object.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

fn seconds_field(object: &Map<String, Value>, key: &str) -> Option<u32> {
    number_field(object, key)
        .filter(|v| *v >= 0.0 && *v <= f64::from(u32::MAX))
        .map(|v| v.round() as u32)
}

fn bool_field(object: &Map<String, Value>, key: &str) -> Option<bool> {
    match object.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn list_field(object: &Map<String, Value>, key: &str) -> Vec<String> {
    match object.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn choice_field(object: &Map<String, Value>, key: &str, allowed: &[&str], fallback: &str) -> Option<String> {
    let raw = text_field(object, key)?;
    let normalized = raw.to_lowercase().replace([' ', '-'], "_");
    if allowed.contains(&normalized.as_str()) {
        Some(normalized)
    } else {
        warn!(field = key, value = %raw, fallback, "unexpected category value");
        Some(fallback.to_string())
    }
}

pub fn parse_extraction(raw: &str) -> Result<IntegrationExtraction, EnrichError> {
    let object = parse_object(raw, &EXTRACTION_KEYS)?;
    Ok(IntegrationExtraction {
        integration_text: text_field(&object, "integration_text"),
        integration_start_sec: seconds_field(&object, "integration_start_sec"),
        integration_duration_sec: seconds_field(&object, "integration_duration_sec"),
        integration_position: text_field(&object, "integration_position").map(|p| p.to_lowercase()),
        is_full_video_ad: bool_field(&object, "is_full_video_ad"),
    })
}

pub fn parse_analysis(raw: &str) -> Result<ContentAnalysis, EnrichError> {
    let object = parse_object(raw, &ANALYSIS_KEYS)?;
    let Some(Value::Object(raw_scores)) = object.get("scores") else {
        return Err(EnrichError::MalformedResponse("scores must be an object".into()));
    };

    let mut scores = Scores::default();
    let mut missing = Vec::new();
    for dimension in ScoreDimension::ALL {
        let Some(value) = raw_scores.get(dimension.as_str()) else {
            missing.push(dimension.as_str());
            continue;
        };
        let admitted = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .is_some_and(|v| scores.insert_checked(dimension, v));
        if !admitted && !value.is_null() {
            warn!(dimension = dimension.as_str(), %value, "score outside its scale; stored as null");
        }
    }
    if !missing.is_empty() {
        return Err(EnrichError::MalformedResponse(format!(
            "missing score dimensions: {}",
            missing.join(", ")
        )));
    }

    Ok(ContentAnalysis {
        offer_type: choice_field(&object, "offer_type", &OFFER_TYPES, "other"),
        offer_details: text_field(&object, "offer_details"),
        landing_type: choice_field(&object, "landing_type", &LANDING_TYPES, "other"),
        cta_type: choice_field(&object, "cta_type", &CTA_TYPES, "other"),
        cta_urgency: text_field(&object, "cta_urgency").map(|u| u.to_lowercase()),
        cta_text: text_field(&object, "cta_text"),
        has_personal_story: bool_field(&object, "has_personal_story"),
        personal_story_type: text_field(&object, "personal_story_type"),
        pain_points_addressed: list_field(&object, "pain_points_addressed"),
        benefits_mentioned: list_field(&object, "benefits_mentioned"),
        objection_handling: bool_field(&object, "objection_handling"),
        social_proof: text_field(&object, "social_proof"),
        overall_tone: choice_field(&object, "overall_tone", &TONES, "mixed"),
        language: text_field(&object, "language").map(|l| l.to_lowercase()),
        product_positioning: text_field(&object, "product_positioning"),
        target_audience_implied: text_field(&object, "target_audience_implied"),
        competitive_mention: bool_field(&object, "competitive_mention"),
        price_mentioned: bool_field(&object, "price_mentioned"),
        scores,
    })
}

/// Two-step enrichment over the Anthropic Messages API.
pub struct ClaudeEnricher {
    http: Arc<HttpFetcher>,
    config: ClaudeConfig,
}

impl ClaudeEnricher {
    pub fn new(http: Arc<HttpFetcher>, config: ClaudeConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn headers(&self) -> Result<HeaderMap, ConfigError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.config.api_key).map_err(|_| ConfigError::Invalid {
            field: "llm api key".into(),
            reason: "not a valid header value".into(),
        })?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn complete(&self, prompt: String) -> Result<String, EnrichError> {
        let headers = self
            .headers()
            .map_err(|err| EnrichError::Permanent(err.to_string()))?;
        let body = ChatRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            system: SYSTEM_PROMPT,
            messages: vec![WireMessage {
                role: "user",
                content: prompt,
            }],
        };
        let request = self
            .http
            .request(Method::POST, &self.endpoint("messages"))
            .headers(headers)
            .json(&body);
        let response = self.http.execute(SERVICE, request).await?;
        let chat: ChatResponse = response
            .json()
            .map_err(|err| EnrichError::MalformedResponse(format!("decoding messages response: {err}")))?;

        let text = chat
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(EnrichError::MalformedResponse(format!(
                "empty completion (stop_reason {:?})",
                chat.stop_reason
            )));
        }
        debug!(chars = text.len(), stop_reason = ?chat.stop_reason, "completion received");
        Ok(text)
    }

    fn analysis_prompt(integration: &str) -> String {
        ANALYSIS_PROMPT
            .replace("{offer_types}", &OFFER_TYPES.join(" | "))
            .replace("{landing_types}", &LANDING_TYPES.join(" | "))
            .replace("{cta_types}", &CTA_TYPES.join(" | "))
            .replace("{tones}", &TONES.join(" | "))
            .replace("{integration}", integration)
    }
}

#[async_trait]
impl Enricher for ClaudeEnricher {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn preflight(&self) -> Result<(), ConfigError> {
        if self.config.api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential("llm api key".into()));
        }
        let headers = self.headers()?;
        let request = self
            .http
            .request(Method::GET, &self.endpoint("models"))
            .query(&[("limit", "1")])
            .headers(headers);
        match self.http.execute(SERVICE, request).await {
            Ok(_) => Ok(()),
            Err(err @ HttpFetchError::Status { status: 401 | 403, .. }) => {
                Err(ConfigError::CredentialRejected {
                    service: SERVICE.into(),
                    detail: err.to_string(),
                })
            }
            Err(err) => {
                warn!(error = %err, "llm preflight inconclusive; continuing");
                Ok(())
            }
        }
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentRecord, EnrichError> {
        if !request.has_transcript() {
            return Err(EnrichError::Permanent(NO_TRANSCRIPT.to_string()));
        }
        let span = info_span!("enrich", content = %request.content, model = %self.config.model);
        async {
            let offset = request
                .offset_hint_seconds
                .map(|o| o.to_string())
                .unwrap_or_else(|| "an unknown number of".to_string());
            let prompt = EXTRACTION_PROMPT
                .replace("{offset}", &offset)
                .replace("{transcript}", &transcript_payload(request));
            let extraction = parse_extraction(&self.complete(prompt).await?)?;

            let analysis = match extraction.integration_text.as_deref() {
                Some(text) => {
                    let raw = self.complete(Self::analysis_prompt(text)).await?;
                    Some(parse_analysis(&raw)?)
                }
                None => {
                    debug!("no integration found; analysis skipped");
                    None
                }
            };

            Ok(EnrichmentRecord {
                content: request.content.clone(),
                enriched_at: Utc::now(),
                model: self.config.model.clone(),
                extraction,
                analysis,
            })
        }
        .instrument(span)
        .await
    }
}
