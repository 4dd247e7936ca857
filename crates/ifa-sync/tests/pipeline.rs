use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use ifa_adapters::{ContentFetcher, EnrichError, Enricher, EnrichmentRequest, FetchError, NO_TRANSCRIPT};
use ifa_core::{
    ContentAnalysis, ContentRecord, ContentRef, EnrichmentRecord, IntegrationExtraction, ItemState,
    MergeDiagnosticKind, Platform, ScoreDimension, Scores, StageStatus,
};
use ifa_storage::{Checkpoint, CheckpointStore, ItemRecord};
use ifa_sync::{stage_status, Credentials, Pipeline, PipelineConfig, RunManifest, CONTENT_FETCH_STAGE};
use tempfile::tempdir;

const INPUT: &str = "\
name;format;ad_link;budget;fact_reach;contacts_fact;deals_fact;purchase_f_total
Alpha;youtube;https://youtu.be/aaaaaaaaaaa?t=95;1000;10000;;;2
alpha ;youtube;https://YOUTU.BE/aaaaaaaaaaa?t=95;;10000;40;10;2
beta;youtube;https://www.youtube.com/watch?v=bbbbbbbbbbb;800;4000;12;;0
gamma;youtube;https://youtu.be/ccccccccccc;1200;9000;30;6;1
delta;youtube;https://example.com/promo;700;5000;25;;
";

/// Fetches everything except `bbbbbbbbbbb` (gone) and fails `ccccccccccc`
/// once before returning it without a transcript.
struct FakeFetcher {
    calls: AtomicUsize,
    flaky_left: Mutex<u32>,
    stop_after: Option<(usize, Arc<AtomicBool>)>,
}

impl FakeFetcher {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            flaky_left: Mutex::new(1),
            stop_after: None,
        }
    }

    fn stopping_after(limit: usize, flag: Arc<AtomicBool>) -> Self {
        Self {
            stop_after: Some((limit, flag)),
            ..Self::new()
        }
    }
}

#[async_trait]
impl ContentFetcher for FakeFetcher {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn supports(&self, _platform: Platform) -> bool {
        true
    }

    async fn fetch(&self, content: &ContentRef) -> Result<ContentRecord, FetchError> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, flag)) = &self.stop_after {
            if calls >= *limit {
                flag.store(true, Ordering::SeqCst);
            }
        }
        let mut record = ContentRecord::new(content, Utc::now());
        match content.video_id.as_str() {
            "bbbbbbbbbbb" => Err(FetchError::Permanent("video not found".into())),
            "ccccccccccc" => {
                let mut left = self.flaky_left.lock().expect("lock");
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError::Transient("503 from upstream".into()));
                }
                record.view_count = Some(20_000);
                record.transcript_error = Some(NO_TRANSCRIPT.into());
                Ok(record)
            }
            _ => {
                record.title = Some("How I learned SQL".into());
                record.view_count = Some(8_000);
                record.like_count = Some(300);
                record.comment_count = Some(100);
                record.transcript_text = Some("today's sponsor is a data course".into());
                Ok(record)
            }
        }
    }
}

struct FakeEnricher {
    calls: AtomicUsize,
}

#[async_trait]
impl Enricher for FakeEnricher {
    fn model(&self) -> &str {
        "fake-model"
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentRecord, EnrichError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut scores = Scores::default();
        scores.insert_checked(ScoreDimension::Urgency, 8.0);
        scores.insert_checked(ScoreDimension::Humor, 42.0);
        Ok(EnrichmentRecord {
            content: request.content.clone(),
            enriched_at: Utc::now(),
            model: self.model().to_string(),
            extraction: IntegrationExtraction {
                integration_text: request.transcript_text.clone(),
                integration_start_sec: request.offset_hint_seconds,
                ..IntegrationExtraction::default()
            },
            analysis: Some(ContentAnalysis {
                offer_type: Some("course".into()),
                overall_tone: Some("friendly".into()),
                scores,
                ..ContentAnalysis::default()
            }),
        })
    }
}

fn config_in(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig {
        input_path: root.join("integrations.csv"),
        output_dir: root.join("output"),
        checkpoint_dir: root.join("output/checkpoints"),
        transcripts_dir: root.join("transcripts"),
        ..PipelineConfig::default()
    };
    for stage in [&mut config.content_fetch, &mut config.enrichment] {
        stage.backoff_base_ms = 1;
        stage.backoff_max_ms = 2;
        stage.checkpoint_interval = 1;
    }
    config
}

fn pipeline(
    config: &PipelineConfig,
    fetcher: Arc<FakeFetcher>,
    enricher: Arc<FakeEnricher>,
    shutdown: Arc<AtomicBool>,
) -> Pipeline {
    Pipeline::new(config.clone(), Credentials::default(), shutdown).with_collaborators(fetcher, enricher)
}

async fn content_states(config: &PipelineConfig) -> BTreeMap<String, ItemState> {
    let checkpoint: Checkpoint<ContentRecord> = CheckpointStore::new(config.checkpoint_dir.clone())
        .load(CONTENT_FETCH_STAGE)
        .await
        .expect("load checkpoint");
    checkpoint
        .items
        .into_iter()
        .map(|(key, record)| (key, record.state))
        .collect()
}

#[tokio::test]
async fn full_run_merges_funnel_content_and_enrichment() {
    let dir = tempdir().expect("tempdir");
    let config = config_in(dir.path());
    std::fs::write(&config.input_path, INPUT).expect("write input");
    let fetcher = Arc::new(FakeFetcher::new());
    let enricher = Arc::new(FakeEnricher {
        calls: AtomicUsize::new(0),
    });
    let out = pipeline(&config, fetcher.clone(), enricher.clone(), Arc::new(AtomicBool::new(false)))
        .run_all(None, false)
        .await
        .expect("run");

    // Duplicate alpha rows collapse into one record.
    assert_eq!(out.merged.len(), 4);
    assert_eq!(out.report.prep.rows_read, 5);
    assert_eq!(out.report.prep.duplicate_groups, 1);

    let by_blogger = |name: &str| {
        out.merged
            .iter()
            .find(|m| m.record.blogger_id.trim().eq_ignore_ascii_case(name))
            .unwrap_or_else(|| panic!("{name} missing"))
    };

    let alpha = by_blogger("alpha");
    assert_eq!(alpha.record.budget, Some(1000.0));
    assert_eq!(alpha.record.funnel.contacts.fact, Some(40));
    assert_eq!(alpha.record.merged_rows.len(), 1);
    assert_eq!(alpha.content_status, StageStatus::Succeeded);
    assert_eq!(alpha.enrichment_status, StageStatus::Succeeded);
    assert_eq!(alpha.metrics.cost_per_purchase, Some(500.0));
    assert_eq!(alpha.metrics.engagement_rate, Some(0.05));
    let enrichment = alpha.enrichment.as_ref().expect("enrichment");
    assert_eq!(enrichment.extraction.integration_start_sec, Some(95));
    let scores = &enrichment.analysis.as_ref().expect("analysis").scores;
    assert_eq!(scores.get(ScoreDimension::Urgency), Some(8));
    assert_eq!(scores.get(ScoreDimension::Humor), None);

    let budget_gap = out
        .report
        .prep
        .merge_diagnostics
        .iter()
        .find(|d| d.field == "budget")
        .expect("budget gap diagnostic");
    assert_eq!(budget_gap.kind, MergeDiagnosticKind::GapFilled);

    let beta = by_blogger("beta");
    assert_eq!(
        beta.content_status,
        StageStatus::FailedPermanent {
            reason: "video not found".into()
        }
    );
    assert_eq!(beta.enrichment_status, StageStatus::NotAttempted);
    assert_eq!(beta.metrics.cost_per_purchase, None);
    assert!(!beta.metrics.has_purchases);

    let gamma = by_blogger("gamma");
    assert_eq!(gamma.content_status, StageStatus::Succeeded);
    assert_eq!(
        gamma.enrichment_status,
        StageStatus::FailedPermanent {
            reason: NO_TRANSCRIPT.into()
        }
    );

    let delta = by_blogger("delta");
    assert_eq!(delta.record.platform, Platform::Unknown);
    assert_eq!(delta.record.video_id, None);
    assert_eq!(delta.record.funnel.reach.fact, Some(5000));
    assert_eq!(delta.record.funnel.contacts.fact, Some(25));
    assert_eq!(delta.content_status, StageStatus::NotAttempted);
    assert_eq!(delta.metrics.cost_per_purchase, None);
    assert_eq!(delta.metrics.cost_per_view, Some(0.14));

    // a and b once each, c twice.
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);

    for name in [
        "final_merged.csv",
        "final_merged.json",
        "final_merged.parquet",
        "aggregates.json",
        "aggregates.md",
        "run_report.json",
        "run_report.md",
        "manifest.json",
    ] {
        assert!(out.run_dir.join(name).exists(), "{name} missing");
    }
    let manifest: RunManifest = serde_json::from_slice(
        &std::fs::read(out.run_dir.join("manifest.json")).expect("manifest"),
    )
    .expect("parse manifest");
    assert_eq!(manifest.run_id, out.run_id);
    assert_eq!(manifest.files.len(), 7);

    let report_md = std::fs::read_to_string(out.run_dir.join("run_report.md")).expect("report");
    assert!(report_md.contains("video not found"));
    assert!(report_md.contains("https://example.com/promo"));
}

#[tokio::test]
async fn rerun_after_completion_makes_no_calls_and_writes_a_new_run() {
    let dir = tempdir().expect("tempdir");
    let config = config_in(dir.path());
    std::fs::write(&config.input_path, INPUT).expect("write input");
    let enricher = Arc::new(FakeEnricher {
        calls: AtomicUsize::new(0),
    });

    let first = pipeline(
        &config,
        Arc::new(FakeFetcher::new()),
        enricher.clone(),
        Arc::new(AtomicBool::new(false)),
    )
    .run_all(None, false)
    .await
    .expect("first run");

    let fetcher = Arc::new(FakeFetcher::new());
    let second = pipeline(&config, fetcher.clone(), enricher.clone(), Arc::new(AtomicBool::new(false)))
        .run_all(None, false)
        .await
        .expect("second run");

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);
    assert_ne!(first.run_dir, second.run_dir);
    let content = second.report.content_fetch.as_ref().expect("content summary");
    assert_eq!(content.skipped, 3);
    assert_eq!(content.attempted, 0);
    assert_eq!(
        second
            .merged
            .iter()
            .map(|m| (&m.canonical_key, &m.content_status, m.metrics))
            .collect::<Vec<_>>(),
        first
            .merged
            .iter()
            .map(|m| (&m.canonical_key, &m.content_status, m.metrics))
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn interrupted_fetch_resumes_to_the_uninterrupted_state() {
    let reference_dir = tempdir().expect("tempdir");
    let reference_config = config_in(reference_dir.path());
    std::fs::write(&reference_config.input_path, INPUT).expect("write input");
    let reference = pipeline(
        &reference_config,
        Arc::new(FakeFetcher::new()),
        Arc::new(FakeEnricher {
            calls: AtomicUsize::new(0),
        }),
        Arc::new(AtomicBool::new(false)),
    );
    let prepared = reference.prepare(None).await.expect("prepare");
    reference
        .fetch_content(&prepared.records, false)
        .await
        .expect("reference fetch");
    let expected = content_states(&reference_config).await;
    assert_eq!(expected.len(), 3);

    for stop_after in 1..=4 {
        let dir = tempdir().expect("tempdir");
        let mut config = config_in(dir.path());
        config.content_fetch.concurrency = 1;
        std::fs::write(&config.input_path, INPUT).expect("write input");
        let enricher = Arc::new(FakeEnricher {
            calls: AtomicUsize::new(0),
        });

        let flag = Arc::new(AtomicBool::new(false));
        let interrupted = pipeline(
            &config,
            Arc::new(FakeFetcher::stopping_after(stop_after, flag.clone())),
            enricher.clone(),
            flag,
        );
        let prepared = interrupted.prepare(None).await.expect("prepare");
        let summary = interrupted
            .fetch_content(&prepared.records, false)
            .await
            .expect("interrupted fetch");
        assert!(summary.attempted <= stop_after);

        let resumed = pipeline(&config, Arc::new(FakeFetcher::new()), enricher, Arc::new(AtomicBool::new(false)));
        let summary = resumed
            .fetch_content(&prepared.records, false)
            .await
            .expect("resumed fetch");
        assert!(!summary.interrupted);
        assert_eq!(summary.pending, 0);
        assert_eq!(content_states(&config).await, expected, "stop_after={stop_after}");
    }
}

#[tokio::test]
async fn interrupted_run_still_reports_pending_items() {
    let dir = tempdir().expect("tempdir");
    let mut config = config_in(dir.path());
    config.content_fetch.concurrency = 1;
    std::fs::write(&config.input_path, INPUT).expect("write input");
    let flag = Arc::new(AtomicBool::new(false));
    let enricher = Arc::new(FakeEnricher {
        calls: AtomicUsize::new(0),
    });

    let out = pipeline(
        &config,
        Arc::new(FakeFetcher::stopping_after(1, flag.clone())),
        enricher.clone(),
        flag,
    )
    .run_all(None, false)
    .await
    .expect("interrupted run");

    assert!(out.report.is_incomplete());
    assert_eq!(enricher.calls.load(Ordering::SeqCst), 0);
    assert!(out
        .merged
        .iter()
        .any(|m| m.content_status == StageStatus::Pending));
    assert!(out.run_dir.join("run_report.md").exists());
}

#[test]
fn stage_status_explains_checkpoint_states() {
    assert_eq!(stage_status::<ContentRecord>(None), StageStatus::NotAttempted);

    let mut record: ItemRecord<ContentRecord> = ItemRecord::pending("youtube:aaaaaaaaaaa");
    assert_eq!(stage_status(Some(&record)), StageStatus::Pending);

    record.state = ItemState::FailedPermanent;
    record.last_error = Some("video not found".into());
    assert_eq!(
        stage_status(Some(&record)),
        StageStatus::FailedPermanent {
            reason: "video not found".into()
        }
    );
}
