//! Core domain model for integration funnel analytics.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ifa-core";

/// Platform family an integration was published on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Youtube,
    InstagramReel,
    Story,
    Tiktok,
    #[default]
    Unknown,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Youtube,
        Platform::InstagramReel,
        Platform::Story,
        Platform::Tiktok,
        Platform::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::InstagramReel => "instagram_reel",
            Platform::Story => "story",
            Platform::Tiktok => "tiktok",
            Platform::Unknown => "unknown",
        }
    }

    /// Maps a free-form format label ("YouTube", "Reel", "stories", ...) onto a platform.
    pub fn from_hint(hint: &str) -> Platform {
        let hint = hint.trim().to_lowercase().replace([' ', '-'], "_");
        match hint.as_str() {
            "youtube" | "yt" | "youtube_video" | "shorts" => Platform::Youtube,
            "reel" | "reels" | "instagram_reel" | "instagram_reels" | "inst_reel" => {
                Platform::InstagramReel
            }
            "story" | "stories" | "instagram_story" | "instagram_stories" => Platform::Story,
            "tiktok" | "tik_tok" => Platform::Tiktok,
            _ => Platform::Unknown,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural kind of an ad link, independent of the platform it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Platform,
    Empty,
    DriveLink,
    LocalFile,
    #[default]
    Other,
}

impl LinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkKind::Platform => "platform",
            LinkKind::Empty => "empty",
            LinkKind::DriveLink => "drive_link",
            LinkKind::LocalFile => "local_file",
            LinkKind::Other => "other",
        }
    }
}

/// Identity of one real-world integration: normalized `(blogger_id, ad_link)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalKey {
    blogger_id: String,
    ad_link: String,
}

impl CanonicalKey {
    pub fn new(blogger_id: &str, ad_link: &str) -> Self {
        let ad_link = ad_link
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        Self {
            blogger_id: Self::normalize_fragment(blogger_id),
            ad_link: ad_link.trim_end_matches('/').to_string(),
        }
    }

    /// Case-folds and collapses whitespace runs to a single space.
    pub fn normalize_fragment(input: &str) -> String {
        input
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn blogger_id(&self) -> &str {
        &self.blogger_id
    }

    pub fn ad_link(&self) -> &str {
        &self.ad_link
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.blogger_id, self.ad_link)
    }
}

/// Addressable piece of external content: one video/reel/story on one platform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentRef {
    pub platform: Platform,
    pub video_id: String,
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.video_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunnelPair {
    pub plan: Option<u64>,
    pub fact: Option<u64>,
}

impl FunnelPair {
    pub fn populated(&self) -> usize {
        usize::from(self.plan.is_some()) + usize::from(self.fact.is_some())
    }
}

/// Plan/fact values for each marketing stage, reach through purchases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Funnel {
    pub reach: FunnelPair,
    pub traffic: FunnelPair,
    pub contacts: FunnelPair,
    pub deals: FunnelPair,
    pub calls: FunnelPair,
    pub purchases: FunnelPair,
    pub purchases_one_month: FunnelPair,
}

impl Funnel {
    pub fn populated(&self) -> usize {
        [
            self.reach,
            self.traffic,
            self.contacts,
            self.deals,
            self.calls,
            self.purchases,
            self.purchases_one_month,
        ]
        .iter()
        .map(FunnelPair::populated)
        .sum()
    }
}

/// Canonical typed form of one input row, annotated by the URL classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source_row: usize,
    pub blogger_id: String,
    pub ad_link: String,
    pub format_hint: String,
    pub platform: Platform,
    pub link_kind: LinkKind,
    pub is_parseable: bool,
    pub video_id: Option<String>,
    pub integration_start_offset_seconds: Option<u32>,
    pub budget: Option<f64>,
    pub integration_date: Option<NaiveDate>,
    pub topic: Option<String>,
    pub manager: Option<String>,
    pub utm_campaign: Option<String>,
    pub funnel: Funnel,
    /// Rows folded into this record by deduplication, excluding `source_row`.
    #[serde(default)]
    pub merged_rows: Vec<usize>,
}

impl NormalizedRecord {
    pub fn new(source_row: usize, blogger_id: impl Into<String>, ad_link: impl Into<String>) -> Self {
        Self {
            source_row,
            blogger_id: blogger_id.into(),
            ad_link: ad_link.into(),
            format_hint: String::new(),
            platform: Platform::Unknown,
            link_kind: LinkKind::Other,
            is_parseable: false,
            video_id: None,
            integration_start_offset_seconds: None,
            budget: None,
            integration_date: None,
            topic: None,
            manager: None,
            utm_campaign: None,
            funnel: Funnel::default(),
            merged_rows: Vec::new(),
        }
    }

    pub fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey::new(&self.blogger_id, &self.ad_link)
    }

    /// Number of optional row fields carrying a value. Classification annotations
    /// are derived from the link and therefore excluded.
    pub fn populated_fields(&self) -> usize {
        let scalars = [
            !self.format_hint.is_empty(),
            self.budget.is_some(),
            self.integration_date.is_some(),
            self.topic.is_some(),
            self.manager.is_some(),
            self.utm_campaign.is_some(),
        ];
        scalars.iter().filter(|set| **set).count() + self.funnel.populated()
    }

    pub fn content_ref(&self) -> Option<ContentRef> {
        self.video_id.as_ref().map(|video_id| ContentRef {
            platform: self.platform,
            video_id: video_id.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub start: f64,
    pub duration: f64,
}

/// Externally fetched metadata and transcript for one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub platform: Platform,
    pub video_id: String,
    pub fetched_at: DateTime<Utc>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub channel_name: Option<String>,
    pub channel_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    pub duration_seconds: Option<u64>,
    pub channel_subscribers: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub thumbnail_url: Option<String>,
    pub category_id: Option<String>,
    pub transcript: Option<Vec<TranscriptSegment>>,
    pub transcript_text: Option<String>,
    pub transcript_error: Option<String>,
}

impl ContentRecord {
    pub fn new(content: &ContentRef, fetched_at: DateTime<Utc>) -> Self {
        Self {
            platform: content.platform,
            video_id: content.video_id.clone(),
            fetched_at,
            title: None,
            description: None,
            channel_name: None,
            channel_id: None,
            published_at: None,
            view_count: None,
            like_count: None,
            comment_count: None,
            duration_seconds: None,
            channel_subscribers: None,
            tags: Vec::new(),
            thumbnail_url: None,
            category_id: None,
            transcript: None,
            transcript_text: None,
            transcript_error: None,
        }
    }

    pub fn content_ref(&self) -> ContentRef {
        ContentRef {
            platform: self.platform,
            video_id: self.video_id.clone(),
        }
    }

    pub fn has_transcript(&self) -> bool {
        self.transcript_text
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty())
    }
}

/// Closed integer scale a score is declared on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreScale {
    pub min: u8,
    pub max: u8,
}

impl ScoreScale {
    pub const ONE_TO_TEN: ScoreScale = ScoreScale { min: 1, max: 10 };

    /// Admits `raw` only if it is a whole number inside the scale.
    pub fn admit(&self, raw: f64) -> Option<u8> {
        if !raw.is_finite() || raw.fract() != 0.0 {
            return None;
        }
        if raw < f64::from(self.min) || raw > f64::from(self.max) {
            return None;
        }
        Some(raw as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDimension {
    Urgency,
    Authenticity,
    Storytelling,
    BenefitClarity,
    EmotionalAppeal,
    Specificity,
    Humor,
    Professionalism,
}

impl ScoreDimension {
    pub const ALL: [ScoreDimension; 8] = [
        ScoreDimension::Urgency,
        ScoreDimension::Authenticity,
        ScoreDimension::Storytelling,
        ScoreDimension::BenefitClarity,
        ScoreDimension::EmotionalAppeal,
        ScoreDimension::Specificity,
        ScoreDimension::Humor,
        ScoreDimension::Professionalism,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScoreDimension::Urgency => "urgency",
            ScoreDimension::Authenticity => "authenticity",
            ScoreDimension::Storytelling => "storytelling",
            ScoreDimension::BenefitClarity => "benefit_clarity",
            ScoreDimension::EmotionalAppeal => "emotional_appeal",
            ScoreDimension::Specificity => "specificity",
            ScoreDimension::Humor => "humor",
            ScoreDimension::Professionalism => "professionalism",
        }
    }

    pub fn scale(self) -> ScoreScale {
        ScoreScale::ONE_TO_TEN
    }
}

/// Content scores; a dimension is either inside its scale or absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<ScoreDimension, f64>")]
pub struct Scores(BTreeMap<ScoreDimension, u8>);

impl Scores {
    /// Returns false (and stores nothing) when `raw` falls outside the dimension's scale.
    pub fn insert_checked(&mut self, dimension: ScoreDimension, raw: f64) -> bool {
        match dimension.scale().admit(raw) {
            Some(value) => {
                self.0.insert(dimension, value);
                true
            }
            None => {
                self.0.remove(&dimension);
                false
            }
        }
    }

    pub fn get(&self, dimension: ScoreDimension) -> Option<u8> {
        self.0.get(&dimension).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<ScoreDimension, f64>> for Scores {
    fn from(raw: BTreeMap<ScoreDimension, f64>) -> Self {
        let mut scores = Scores::default();
        for (dimension, value) in raw {
            scores.insert_checked(dimension, value);
        }
        scores
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IntegrationExtraction {
    pub integration_text: Option<String>,
    pub integration_start_sec: Option<u32>,
    pub integration_duration_sec: Option<u32>,
    pub integration_position: Option<String>,
    pub is_full_video_ad: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub offer_type: Option<String>,
    pub offer_details: Option<String>,
    pub landing_type: Option<String>,
    pub cta_type: Option<String>,
    pub cta_urgency: Option<String>,
    pub cta_text: Option<String>,
    pub has_personal_story: Option<bool>,
    pub personal_story_type: Option<String>,
    #[serde(default)]
    pub pain_points_addressed: Vec<String>,
    #[serde(default)]
    pub benefits_mentioned: Vec<String>,
    pub objection_handling: Option<bool>,
    pub social_proof: Option<String>,
    pub overall_tone: Option<String>,
    pub language: Option<String>,
    pub product_positioning: Option<String>,
    pub target_audience_implied: Option<String>,
    pub competitive_mention: Option<bool>,
    pub price_mentioned: Option<bool>,
    #[serde(default)]
    pub scores: Scores,
}

/// LLM-derived annotations for one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub content: ContentRef,
    pub enriched_at: DateTime<Utc>,
    pub model: String,
    pub extraction: IntegrationExtraction,
    /// Absent when the extraction step found no integration text.
    pub analysis: Option<ContentAnalysis>,
}

/// Lifecycle of one orchestrated work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    InFlight,
    Succeeded,
    FailedTransient,
    FailedPermanent,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Succeeded | ItemState::FailedPermanent)
    }
}

/// Per-record outcome of a fetch stage, as surfaced in merged output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    FailedPermanent { reason: String },
    Pending,
    NotAttempted,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Succeeded => f.write_str("succeeded"),
            StageStatus::FailedPermanent { reason } => write!(f, "failed_permanent: {reason}"),
            StageStatus::Pending => f.write_str("pending"),
            StageStatus::NotAttempted => f.write_str("not_attempted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    RowSkipped,
    FieldDropped,
}

/// Row-level normalization diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseIssue {
    pub row: usize,
    pub column: Option<String>,
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationAmbiguity {
    pub canonical_key: String,
    pub ad_link: String,
    pub format_hint: String,
    pub platform: Platform,
    pub link_kind: LinkKind,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDiagnosticKind {
    /// Both records had a value and they differed; `discarded` lost.
    Conflict,
    /// The winning record lacked the field; it was taken from `other_row`.
    GapFilled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeDiagnostic {
    pub canonical_key: String,
    pub field: String,
    pub kind: MergeDiagnosticKind,
    pub kept: Option<String>,
    pub discarded: Option<String>,
    pub kept_row: usize,
    pub other_row: usize,
}

/// Slim view of a content record carried into merged output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSummary {
    pub title: Option<String>,
    pub channel_name: Option<String>,
    pub channel_subscribers: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    pub duration_seconds: Option<u64>,
    pub has_transcript: bool,
}

impl From<&ContentRecord> for ContentSummary {
    fn from(record: &ContentRecord) -> Self {
        Self {
            title: record.title.clone(),
            channel_name: record.channel_name.clone(),
            channel_subscribers: record.channel_subscribers,
            published_at: record.published_at,
            view_count: record.view_count,
            like_count: record.like_count,
            comment_count: record.comment_count,
            duration_seconds: record.duration_seconds,
            has_transcript: record.has_transcript(),
        }
    }
}

/// Ratio metrics; every ratio is null when its denominator is absent or non-positive.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub cost_per_view: Option<f64>,
    pub cost_per_contact: Option<f64>,
    pub cost_per_deal: Option<f64>,
    pub cost_per_purchase: Option<f64>,
    pub traffic_to_contact_rate: Option<f64>,
    pub contact_to_deal_rate: Option<f64>,
    pub deal_to_call_rate: Option<f64>,
    pub call_to_purchase_rate: Option<f64>,
    pub full_funnel_conversion: Option<f64>,
    pub plan_vs_fact_reach: Option<f64>,
    pub plan_vs_fact_traffic: Option<f64>,
    pub engagement_rate: Option<f64>,
    pub view_to_reach_ratio: Option<f64>,
    pub has_purchases: bool,
}

/// Final denormalized row: one per canonical key per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub run_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub canonical_key: String,
    pub record: NormalizedRecord,
    pub content: Option<ContentSummary>,
    pub enrichment: Option<EnrichmentRecord>,
    pub content_status: StageStatus,
    pub enrichment_status: StageStatus,
    pub metrics: DerivedMetrics,
}
