use std::sync::LazyLock;

use ifa_core::{ClassificationAmbiguity, LinkKind, NormalizedRecord, Platform};
use regex::Regex;
use tracing::{debug, warn};

static RE_YOUTUBE_ID: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"^/watch/?\?(?:[^#]*&)?v=([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)").unwrap(),
        Regex::new(r"^/(?:embed|shorts|live)/([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)").unwrap(),
        Regex::new(r"^/([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)").unwrap(),
    ]
});
static RE_INSTAGRAM_REEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/(?:reels?|p)/([A-Za-z0-9_-]+)").unwrap());
static RE_INSTAGRAM_STORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/stories/(?:highlights/|[A-Za-z0-9_.]+/)?(\d+)(?:[/?#]|$)").unwrap()
});
static RE_TIKTOK_VIDEO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/(?:@[^/]+/)?video/(\d+)(?:[/?#]|$)").unwrap());
static RE_OFFSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&#](?:t|start)=([0-9hms]+)").unwrap());
static RE_OFFSET_UNIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)([hms]?)").unwrap());
static RE_MEDIA_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(?:mp4|mov|avi|mkv)$").unwrap());
/// Scheme-less web address: a `www.` host, or a dotted host followed by a path or query.
static RE_BARE_WEB_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:www\.[^/\s]+|[a-z0-9-]+(?:\.[a-z0-9-]+)*\.[a-z]{2,}[/?#])").unwrap()
});

/// Result of classifying one ad link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub platform: Platform,
    pub link_kind: LinkKind,
    pub video_id: Option<String>,
    pub start_offset_seconds: Option<u32>,
    pub is_parseable: bool,
}

impl Classification {
    fn unrecognized(link_kind: LinkKind) -> Self {
        Self {
            platform: Platform::Unknown,
            link_kind,
            video_id: None,
            start_offset_seconds: None,
            is_parseable: false,
        }
    }

    fn platform(platform: Platform, video_id: Option<String>, link: &str) -> Self {
        Self {
            platform,
            link_kind: LinkKind::Platform,
            is_parseable: video_id.is_some(),
            video_id,
            start_offset_seconds: extract_offset(link),
        }
    }
}

enum Host {
    Youtube,
    Instagram,
    Tiktok,
    Drive,
    Elsewhere,
}

/// Splits a link into its lower-cased host (without `www.`/`m.`) and the
/// remainder starting at the first `/`, `?` or `#`.
fn split_link(link: &str) -> (String, &str) {
    let without_scheme = link
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(link);
    let boundary = without_scheme
        .find(['/', '?', '#'])
        .unwrap_or(without_scheme.len());
    let (authority, rest) = without_scheme.split_at(boundary);
    let host = authority
        .rsplit('@')
        .next()
        .unwrap_or(authority)
        .split(':')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .unwrap_or(&host)
        .to_string();
    (host, rest)
}

fn host_kind(host: &str) -> Host {
    let is = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));
    if is("youtube.com") || is("youtube-nocookie.com") || host == "youtu.be" {
        Host::Youtube
    } else if is("instagram.com") {
        Host::Instagram
    } else if is("tiktok.com") {
        Host::Tiktok
    } else if host == "drive.google.com" || host == "docs.google.com" {
        Host::Drive
    } else {
        Host::Elsewhere
    }
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn youtube_id(host: &str, rest: &str) -> Option<String> {
    let [watch, embedded, short] = &*RE_YOUTUBE_ID;
    if host == "youtu.be" {
        capture(short, rest)
    } else {
        capture(watch, rest).or_else(|| capture(embedded, rest))
    }
}

/// Parses `331`, `322s`, `1m30s` or `1h2m3s` into seconds.
pub fn parse_offset(raw: &str) -> Option<u32> {
    if raw.is_empty() {
        return None;
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse().ok();
    }
    let mut total: u32 = 0;
    let mut consumed = 0;
    for caps in RE_OFFSET_UNIT.captures_iter(raw) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();
        let value: u32 = caps.get(1)?.as_str().parse().ok()?;
        let factor = match caps.get(2).map(|m| m.as_str()) {
            Some("h") => 3600,
            Some("m") => 60,
            _ => 1,
        };
        total = total.checked_add(value.checked_mul(factor)?)?;
    }
    (consumed == raw.len()).then_some(total)
}

fn extract_offset(link: &str) -> Option<u32> {
    RE_OFFSET
        .captures(link)
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_offset(m.as_str()))
}

/// Derives platform, content identifier and start offset from an ad link.
/// The platform comes from the link's domain; `format_hint` only decides
/// between reel and story for Instagram links that carry no identifier.
/// Never fails: unrecognized links classify as `Platform::Unknown`.
pub fn classify_link(format_hint: &str, ad_link: &str) -> Classification {
    let link = ad_link.trim();
    if link.is_empty() || link.eq_ignore_ascii_case("nan") {
        return Classification::unrecognized(LinkKind::Empty);
    }

    let (host, rest) = split_link(link);
    match host_kind(&host) {
        Host::Youtube => Classification::platform(Platform::Youtube, youtube_id(&host, rest), link),
        Host::Instagram => {
            if let Some(slug) = capture(&RE_INSTAGRAM_REEL, rest) {
                Classification::platform(Platform::InstagramReel, Some(slug), link)
            } else if let Some(story_id) = capture(&RE_INSTAGRAM_STORY, rest) {
                Classification::platform(Platform::Story, Some(story_id), link)
            } else {
                let platform = match Platform::from_hint(format_hint) {
                    Platform::Story => Platform::Story,
                    _ => Platform::InstagramReel,
                };
                Classification::platform(platform, None, link)
            }
        }
        Host::Tiktok => {
            Classification::platform(Platform::Tiktok, capture(&RE_TIKTOK_VIDEO, rest), link)
        }
        Host::Drive => Classification::unrecognized(LinkKind::DriveLink),
        Host::Elsewhere => {
            let scheme_less = !link.to_ascii_lowercase().starts_with("http");
            if RE_MEDIA_FILE.is_match(link) || (scheme_less && !RE_BARE_WEB_LINK.is_match(link)) {
                Classification::unrecognized(LinkKind::LocalFile)
            } else {
                Classification::unrecognized(LinkKind::Other)
            }
        }
    }
}

/// Annotates every record in place and returns one ambiguity per record whose
/// link could not be resolved to an identifier or disagrees with its hint.
pub fn classify_records(records: &mut [NormalizedRecord]) -> Vec<ClassificationAmbiguity> {
    let mut ambiguities = Vec::new();
    for record in records.iter_mut() {
        let classification = classify_link(&record.format_hint, &record.ad_link);
        let hinted = Platform::from_hint(&record.format_hint);

        record.platform = classification.platform;
        record.link_kind = classification.link_kind;
        record.video_id = classification.video_id;
        record.integration_start_offset_seconds = classification.start_offset_seconds;
        record.is_parseable = classification.is_parseable;

        let mut reasons = Vec::new();
        if !record.is_parseable {
            reasons.push(match record.link_kind {
                LinkKind::Platform => format!("no {} identifier in link", record.platform),
                LinkKind::Empty => "empty link".to_string(),
                LinkKind::DriveLink => "drive link has no fetchable content".to_string(),
                LinkKind::LocalFile => "link names a local file".to_string(),
                LinkKind::Other => "link matches no known platform".to_string(),
            });
        }
        if hinted != Platform::Unknown
            && record.platform != Platform::Unknown
            && hinted != record.platform
        {
            reasons.push(format!(
                "format hint {:?} disagrees with link platform {}",
                record.format_hint, record.platform
            ));
        }

        if reasons.is_empty() {
            debug!(row = record.source_row, platform = %record.platform, "classified link");
            continue;
        }
        let canonical_key = record.canonical_key().to_string();
        let reason = reasons.join("; ");
        warn!(row = record.source_row, key = %canonical_key, %reason, "ambiguous link classification");
        ambiguities.push(ClassificationAmbiguity {
            canonical_key,
            ad_link: record.ad_link.clone(),
            format_hint: record.format_hint.clone(),
            platform: record.platform,
            link_kind: record.link_kind,
            reason,
        });
    }
    ambiguities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_of(link: &str) -> Option<String> {
        classify_link("", link).video_id
    }

    #[test]
    fn youtube_watch_link_with_offset() {
        let c = classify_link("youtube", "https://www.youtube.com/watch?v=abc12345678&t=331");
        assert_eq!(c.platform, Platform::Youtube);
        assert_eq!(c.link_kind, LinkKind::Platform);
        assert_eq!(c.video_id.as_deref(), Some("abc12345678"));
        assert_eq!(c.start_offset_seconds, Some(331));
        assert!(c.is_parseable);
    }

    #[test]
    fn youtube_identifier_shapes() {
        let expected = Some("dQw4w9WgXcQ".to_string());
        assert_eq!(id_of("https://youtu.be/dQw4w9WgXcQ"), expected);
        assert_eq!(id_of("https://www.youtube.com/embed/dQw4w9WgXcQ"), expected);
        assert_eq!(id_of("https://www.youtube.com/shorts/dQw4w9WgXcQ"), expected);
        assert_eq!(id_of("https://m.youtube.com/watch?feature=share&v=dQw4w9WgXcQ"), expected);
        assert_eq!(id_of("youtube.com/watch?v=dQw4w9WgXcQ&list=PLx"), expected);
        assert_eq!(
            id_of("https://www.youtube.com/live/uADWm8KRXlY?si=X3MULU1tEykdGoI5&t=799").as_deref(),
            Some("uADWm8KRXlY")
        );
        assert_eq!(id_of("https://www.youtube.com/watch?v=tooShort"), None);
        assert_eq!(id_of("https://www.youtube.com/watch?v=dQw4w9WgXcQextra"), None);
        assert_eq!(id_of("dQw4w9WgXcQ"), None);
    }

    #[test]
    fn offsets_in_several_forms() {
        let offset = |link: &str| classify_link("", link).start_offset_seconds;
        assert_eq!(offset("https://youtu.be/uTc3U2Cqen4?si=tFWWnuYgMps_cQVF&t=331"), Some(331));
        assert_eq!(offset("https://www.youtube.com/watch?v=o-9aumQSTXA&t=322s"), Some(322));
        assert_eq!(offset("https://youtu.be/dBgqgkC1kac?t=27"), Some(27));
        assert_eq!(offset("https://youtu.be/dBgqgkC1kac?start=90"), Some(90));
        assert_eq!(offset("https://youtu.be/dBgqgkC1kac"), None);
        assert_eq!(parse_offset("1m30s"), Some(90));
        assert_eq!(parse_offset("1h2m3s"), Some(3723));
        assert_eq!(parse_offset("ms"), None);
        assert_eq!(parse_offset(""), None);
    }

    #[test]
    fn instagram_and_tiktok_links() {
        let reel = classify_link("reel", "https://www.instagram.com/reel/DH6K1jYJDCB/");
        assert_eq!(reel.platform, Platform::InstagramReel);
        assert_eq!(reel.video_id.as_deref(), Some("DH6K1jYJDCB"));

        let story = classify_link("story", "https://instagram.com/stories/someone/3561234567890/");
        assert_eq!(story.platform, Platform::Story);
        assert_eq!(story.video_id.as_deref(), Some("3561234567890"));

        let profile = classify_link("stories", "https://www.instagram.com/someone");
        assert_eq!(profile.platform, Platform::Story);
        assert_eq!(profile.video_id, None);
        assert!(!profile.is_parseable);

        let tiktok = classify_link("tiktok", "https://www.tiktok.com/@user/video/7494174037552139542?lang=en");
        assert_eq!(tiktok.platform, Platform::Tiktok);
        assert_eq!(tiktok.video_id.as_deref(), Some("7494174037552139542"));
        assert_eq!(classify_link("tiktok", "https://vm.tiktok.com/ZMabc/").video_id, None);
    }

    #[test]
    fn non_platform_links_are_unknown_and_never_fail() {
        let cases = [
            ("", LinkKind::Empty),
            ("nan", LinkKind::Empty),
            ("https://drive.google.com/drive/folders/1XEUfS46Dp", LinkKind::DriveLink),
            ("Resumeofficial.mp4", LinkKind::LocalFile),
            ("https://cdn.example.com/clip.MOV", LinkKind::LocalFile),
            ("https://example.com/landing", LinkKind::Other),
            ("example.com/promo", LinkKind::Other),
            ("www.example.com", LinkKind::Other),
            ("report.pdf", LinkKind::LocalFile),
            ("promo.example.com/clip.mp4", LinkKind::LocalFile),
            ("http://[broken", LinkKind::Other),
        ];
        for (link, kind) in cases {
            let c = classify_link("youtube", link);
            assert_eq!(c.platform, Platform::Unknown, "{link}");
            assert_eq!(c.link_kind, kind, "{link}");
            assert_eq!(c.video_id, None);
            assert_eq!(c.start_offset_seconds, None);
            assert!(!c.is_parseable);
        }
    }

    #[test]
    fn classify_records_annotates_and_reports_ambiguities() {
        let mut records = vec![
            NormalizedRecord::new(2, "a", "https://youtu.be/abc12345678?t=5"),
            NormalizedRecord::new(3, "b", "https://example.com/promo"),
            NormalizedRecord::new(4, "c", "https://www.instagram.com/reel/XYZ"),
        ];
        records[0].format_hint = "youtube".into();
        records[2].format_hint = "youtube".into();
        records[1].funnel.reach.fact = Some(1200);

        let ambiguities = classify_records(&mut records);

        assert_eq!(records[0].video_id.as_deref(), Some("abc12345678"));
        assert_eq!(records[0].integration_start_offset_seconds, Some(5));
        assert_eq!(records[1].platform, Platform::Unknown);
        assert_eq!(records[1].funnel.reach.fact, Some(1200));
        assert_eq!(records[2].platform, Platform::InstagramReel);
        assert_eq!(ambiguities.len(), 2);
        assert_eq!(ambiguities[0].canonical_key, "b|https://example.com/promo");
        assert!(ambiguities[1].reason.contains("disagrees"));
    }
}
