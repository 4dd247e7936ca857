//! Pipeline orchestration: prepare, fetch content, enrich, merge.

mod aggregate;
mod config;
mod dedup;
mod export;
mod merge;
mod orchestrator;
mod report;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ifa_adapters::{
    ClaudeConfig, ClaudeEnricher, ContentFetcher, Enricher, PlatformRouter, TranscriptDirectory,
    TranscriptOnlyFetcher, YouTubeConfig, YouTubeContentFetcher,
};
use ifa_core::{ContentRecord, EnrichmentRecord, MergedRecord, NormalizedRecord, Platform};
use ifa_ingest::{classify_records, Normalizer};
use ifa_storage::{create_fresh_dir, write_atomic, write_json_atomic, Checkpoint, CheckpointStore, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub use aggregate::{
    Aggregates, BudgetTierRow, CategoryRow, FunnelStageRow, PlatformRow, ScoreComparisonRow,
};
pub use config::{Credentials, LlmSettings, PipelineConfig, StageConfig, YouTubeSettings, DEFAULT_CONFIG_PATH};
pub use dedup::{DedupEngine, DedupOutput};
pub use export::{
    manifest_entry, merged_csv, prepared_csv, write_merged_parquet, write_parquet, ManifestFile, RunManifest,
};
pub use merge::{compute_metrics, safe_divide, stage_status, MergeEngine};
pub use orchestrator::{
    content_work_items, enrichment_work_items, ContentFetchHandler, EnrichmentHandler, ItemFailure,
    Orchestrator, OrchestratorOptions, StageRun, StageSummary, WorkError, WorkHandler, WorkItem,
    CONTENT_FETCH_STAGE, ENRICHMENT_STAGE,
};
pub use report::{PrepDiagnostics, RunReport, StatusCounts};

pub const CRATE_NAME: &str = "ifa-sync";

const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Deduplicated, classified records plus the diagnostics that produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prepared {
    pub records: Vec<NormalizedRecord>,
    pub diagnostics: PrepDiagnostics,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub run_dir: PathBuf,
    pub merged: Vec<MergedRecord>,
    pub aggregates: Aggregates,
    pub report: RunReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    credentials: Credentials,
    shutdown: Arc<AtomicBool>,
    store: CheckpointStore,
    content_fetcher: Option<Arc<dyn ContentFetcher>>,
    enricher: Option<Arc<dyn Enricher>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, credentials: Credentials, shutdown: Arc<AtomicBool>) -> Self {
        let store = CheckpointStore::new(config.checkpoint_dir.clone());
        Self {
            config,
            credentials,
            shutdown,
            store,
            content_fetcher: None,
            enricher: None,
        }
    }

    /// Replaces the collaborators built from configuration.
    pub fn with_collaborators(
        mut self,
        content_fetcher: Arc<dyn ContentFetcher>,
        enricher: Arc<dyn Enricher>,
    ) -> Self {
        self.content_fetcher = Some(content_fetcher);
        self.enricher = Some(enricher);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Normalize, deduplicate and classify the input file, then persist the
    /// prepared records and their diagnostics.
    pub async fn prepare(&self, input: Option<&Path>) -> Result<Prepared> {
        let input_path = input.unwrap_or(self.config.input_path.as_path());
        let normalizer = Normalizer::new(self.config.normalizer_options()?);
        let normalized = normalizer
            .normalize_path(input_path)
            .with_context(|| format!("normalizing {}", input_path.display()))?;
        let rows_read = normalized.rows_read;
        let skipped = normalized.skipped_rows();

        let deduped = DedupEngine::new().apply(normalized.records);
        let mut records = deduped.records;
        let ambiguities = classify_records(&mut records);
        for ambiguity in &ambiguities {
            warn!(
                canonical_key = %ambiguity.canonical_key,
                platform = %ambiguity.platform,
                reason = %ambiguity.reason,
                "classification ambiguity"
            );
        }

        let diagnostics = PrepDiagnostics {
            input_path: input_path.display().to_string(),
            rows_read,
            records_prepared: records.len(),
            duplicate_groups: deduped.duplicate_groups,
            issues: normalized.issues,
            ambiguities,
            merge_diagnostics: deduped.diagnostics,
        };

        write_atomic(&self.config.prepared_csv_path(), &prepared_csv(&records)?).await?;
        write_json_atomic(&self.config.prepared_json_path(), &records).await?;
        write_json_atomic(&self.config.prep_diagnostics_path(), &diagnostics).await?;

        info!(
            rows_read,
            skipped,
            records = records.len(),
            duplicate_groups = diagnostics.duplicate_groups,
            ambiguities = diagnostics.ambiguities.len(),
            "prepared integrations"
        );
        Ok(Prepared { records, diagnostics })
    }

    /// Reads what an earlier `prepare` persisted.
    pub async fn load_prepared(&self) -> Result<Prepared> {
        let records_path = self.config.prepared_json_path();
        let raw = fs::read(&records_path)
            .await
            .with_context(|| format!("reading {}; run `prepare` first", records_path.display()))?;
        let records: Vec<NormalizedRecord> =
            serde_json::from_slice(&raw).with_context(|| format!("parsing {}", records_path.display()))?;

        let diagnostics_path = self.config.prep_diagnostics_path();
        let diagnostics = match fs::read(&diagnostics_path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("parsing {}", diagnostics_path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %diagnostics_path.display(), "prep diagnostics missing; report will omit them");
                PrepDiagnostics::default()
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", diagnostics_path.display())),
        };
        Ok(Prepared { records, diagnostics })
    }

    fn orchestrator(&self, stage: &StageConfig, refetch: bool) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            OrchestratorOptions {
                backoff: stage.backoff(),
                concurrency: stage.concurrency,
                checkpoint_interval: stage.checkpoint_interval,
                token_bucket: stage.token_bucket(),
                refetch,
            },
            Arc::clone(&self.shutdown),
        )
    }

    /// True when some of `keys` is not terminal in the stage checkpoint.
    async fn has_open_items<T>(&self, stage: &str, keys: &[String], refetch: bool) -> Result<bool>
    where
        T: serde::de::DeserializeOwned,
    {
        if keys.is_empty() {
            return Ok(false);
        }
        if refetch {
            return Ok(true);
        }
        let checkpoint: Checkpoint<T> = self
            .store
            .load(stage)
            .await
            .with_context(|| format!("loading {stage} checkpoint"))?;
        Ok(keys
            .iter()
            .any(|key| !checkpoint.get(key).is_some_and(|r| r.state.is_terminal())))
    }

    async fn build_content_fetcher(
        &self,
        records: &[NormalizedRecord],
        refetch: bool,
    ) -> Result<Arc<dyn ContentFetcher>> {
        if let Some(fetcher) = &self.content_fetcher {
            return Ok(Arc::clone(fetcher));
        }
        let transcripts = TranscriptDirectory::new(self.config.transcripts_dir.clone());
        let mut router = PlatformRouter::new();

        let youtube_keys: Vec<String> = content_work_items(records)
            .into_iter()
            .filter(|item| item.input.platform == Platform::Youtube)
            .map(|item| item.key)
            .collect();
        if self
            .has_open_items::<ContentRecord>(CONTENT_FETCH_STAGE, &youtube_keys, refetch)
            .await?
        {
            let api_key = self.credentials.youtube_api_key(&self.config)?;
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(self.config.youtube.batch_timeout_secs),
                ..Default::default()
            })?;
            let mut youtube = YouTubeConfig::new(api_key);
            youtube.base_url = self.config.youtube.base_url.clone();
            router = router.with(Arc::new(YouTubeContentFetcher::new(
                Arc::new(http),
                youtube,
                transcripts.clone(),
            )));
        }
        Ok(Arc::new(router.with(Arc::new(TranscriptOnlyFetcher::new(transcripts)))))
    }

    async fn build_enricher(&self, keys: &[String], refetch: bool) -> Result<Option<Arc<dyn Enricher>>> {
        if let Some(enricher) = &self.enricher {
            return Ok(Some(Arc::clone(enricher)));
        }
        if !self
            .has_open_items::<EnrichmentRecord>(ENRICHMENT_STAGE, keys, refetch)
            .await?
        {
            return Ok(None);
        }
        let llm = &self.config.llm;
        let api_key = self.credentials.anthropic_api_key(&self.config)?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(llm.timeout_secs),
            ..Default::default()
        })?;
        let enricher = ClaudeEnricher::new(
            Arc::new(http),
            ClaudeConfig {
                api_key: api_key.to_string(),
                model: llm.model.clone(),
                max_tokens: llm.max_tokens,
                base_url: llm.base_url.clone(),
            },
        );
        Ok(Some(Arc::new(enricher)))
    }

    pub async fn fetch_content(&self, records: &[NormalizedRecord], refetch: bool) -> Result<StageSummary> {
        let fetcher = self.build_content_fetcher(records, refetch).await?;
        let items = content_work_items(records);
        let run = self
            .orchestrator(&self.config.content_fetch, refetch)
            .run(Arc::new(ContentFetchHandler::new(fetcher)), items)
            .await?;
        Ok(run.summary)
    }

    pub async fn enrich(&self, records: &[NormalizedRecord], refetch: bool) -> Result<StageSummary> {
        let content: Checkpoint<ContentRecord> = self
            .store
            .load(CONTENT_FETCH_STAGE)
            .await
            .context("loading content_fetch checkpoint")?;
        let items = enrichment_work_items(records, &content);
        let keys: Vec<String> = items.iter().map(|item| item.key.clone()).collect();

        let Some(enricher) = self.build_enricher(&keys, refetch).await? else {
            let checkpoint: Checkpoint<EnrichmentRecord> = self
                .store
                .load(ENRICHMENT_STAGE)
                .await
                .context("loading enrichment checkpoint")?;
            info!(items = keys.len(), "enrichment already complete");
            return Ok(StageSummary {
                skipped: keys.len(),
                ..StageSummary::from_checkpoint(ENRICHMENT_STAGE, &checkpoint, &keys)
            });
        };
        let run = self
            .orchestrator(&self.config.enrichment, refetch)
            .run(Arc::new(EnrichmentHandler::new(enricher)), items)
            .await?;
        Ok(run.summary)
    }

    /// Joins prepared records with both checkpoints and writes a fresh run directory.
    pub async fn merge(
        &self,
        prepared: &Prepared,
        started_at: DateTime<Utc>,
        content_summary: Option<StageSummary>,
        enrichment_summary: Option<StageSummary>,
    ) -> Result<RunOutput> {
        let content: Checkpoint<ContentRecord> = self
            .store
            .load(CONTENT_FETCH_STAGE)
            .await
            .context("loading content_fetch checkpoint")?;
        let enrichment: Checkpoint<EnrichmentRecord> = self
            .store
            .load(ENRICHMENT_STAGE)
            .await
            .context("loading enrichment checkpoint")?;

        let content_summary = content_summary.unwrap_or_else(|| {
            let keys: Vec<String> = content_work_items(&prepared.records)
                .into_iter()
                .map(|item| item.key)
                .collect();
            StageSummary::from_checkpoint(CONTENT_FETCH_STAGE, &content, &keys)
        });
        let enrichment_summary = enrichment_summary.unwrap_or_else(|| {
            let keys: Vec<String> = enrichment_work_items(&prepared.records, &content)
                .into_iter()
                .map(|item| item.key)
                .collect();
            StageSummary::from_checkpoint(ENRICHMENT_STAGE, &enrichment, &keys)
        });

        let run_id = Uuid::new_v4();
        let run_at = Utc::now();
        let merged = MergeEngine::new(run_id, run_at).merge(&prepared.records, &content, &enrichment);
        let aggregates = Aggregates::compute(&merged);

        let run_dir = self
            .config
            .runs_dir()
            .join(format!("{}-{}", run_at.format("%Y%m%d_%H%M%S"), run_id));
        create_fresh_dir(&run_dir).await?;

        let report = RunReport::build(
            run_id,
            started_at,
            Utc::now(),
            prepared.diagnostics.clone(),
            Some(content_summary),
            Some(enrichment_summary),
            &merged,
        );
        self.write_run_files(&run_dir, run_id, &merged, &aggregates, &report)
            .await?;

        if report.is_incomplete() {
            warn!(run_id = %run_id, "run finished with pending items; re-run to resume");
        }
        info!(
            run_id = %run_id,
            run_dir = %run_dir.display(),
            merged = merged.len(),
            "merge complete"
        );
        Ok(RunOutput {
            run_id,
            run_dir,
            merged,
            aggregates,
            report,
        })
    }

    /// Merge from what earlier invocations persisted; stage outcomes come from the checkpoints.
    pub async fn merge_persisted(&self) -> Result<RunOutput> {
        let started_at = Utc::now();
        let prepared = self.load_prepared().await?;
        self.merge(&prepared, started_at, None, None).await
    }

    async fn write_run_files(
        &self,
        run_dir: &Path,
        run_id: Uuid,
        merged: &[MergedRecord],
        aggregates: &Aggregates,
        report: &RunReport,
    ) -> Result<()> {
        let csv_path = run_dir.join("final_merged.csv");
        write_atomic(&csv_path, &merged_csv(merged)?).await?;
        let json_path = run_dir.join("final_merged.json");
        write_json_atomic(&json_path, merged).await?;
        let parquet_path = run_dir.join("final_merged.parquet");
        write_merged_parquet(&parquet_path, merged)?;

        let aggregates_json = run_dir.join("aggregates.json");
        write_json_atomic(&aggregates_json, aggregates).await?;
        let aggregates_md = run_dir.join("aggregates.md");
        write_atomic(&aggregates_md, aggregates.to_markdown().as_bytes()).await?;

        let report_json = run_dir.join("run_report.json");
        write_json_atomic(&report_json, report).await?;
        let report_md = run_dir.join("run_report.md");
        write_atomic(&report_md, report.to_markdown().as_bytes()).await?;

        let manifest = RunManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id,
            files: vec![
                manifest_entry("final_merged_csv", run_dir, &csv_path)?,
                manifest_entry("final_merged_json", run_dir, &json_path)?,
                manifest_entry("final_merged_parquet", run_dir, &parquet_path)?,
                manifest_entry("aggregates_json", run_dir, &aggregates_json)?,
                manifest_entry("aggregates_md", run_dir, &aggregates_md)?,
                manifest_entry("run_report_json", run_dir, &report_json)?,
                manifest_entry("run_report_md", run_dir, &report_md)?,
            ],
        };
        write_json_atomic(&run_dir.join("manifest.json"), &manifest).await?;
        Ok(())
    }

    /// Every stage in order. An interrupt skips the remaining fetch stages but
    /// still writes the merged output and report for what is done.
    pub async fn run_all(&self, input: Option<&Path>, refetch: bool) -> Result<RunOutput> {
        let started_at = Utc::now();
        let prepared = self.prepare(input).await?;

        let content_summary = self.fetch_content(&prepared.records, refetch).await?;
        let enrichment_summary = if self.interrupted() {
            warn!("interrupted; skipping enrichment");
            None
        } else {
            Some(self.enrich(&prepared.records, refetch).await?)
        };
        self.merge(&prepared, started_at, Some(content_summary), enrichment_summary)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CSV: &str = "name;format;ad_link;budget;purchase_f_total\n\
alpha;youtube;https://youtu.be/aaaaaaaaaaa;1000;2\n\
beta;reels;https://www.instagram.com/reel/Cxyz123/;500;0\n";

    fn config_in(root: &Path) -> PipelineConfig {
        PipelineConfig {
            input_path: root.join("integrations.csv"),
            output_dir: root.join("output"),
            checkpoint_dir: root.join("output/checkpoints"),
            transcripts_dir: root.join("transcripts"),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn prepare_persists_records_and_diagnostics() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        std::fs::write(&config.input_path, CSV).expect("write csv");
        let pipeline = Pipeline::new(config.clone(), Credentials::default(), Arc::new(AtomicBool::new(false)));

        let prepared = pipeline.prepare(None).await.expect("prepare");
        assert_eq!(prepared.records.len(), 2);
        assert_eq!(prepared.diagnostics.rows_read, 2);
        assert!(config.prepared_csv_path().exists());

        let loaded = pipeline.load_prepared().await.expect("load");
        assert_eq!(loaded, prepared);
    }

    #[tokio::test]
    async fn missing_youtube_key_is_fatal_before_any_checkpoint_is_written() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        std::fs::write(&config.input_path, CSV).expect("write csv");
        let pipeline = Pipeline::new(config.clone(), Credentials::default(), Arc::new(AtomicBool::new(false)));
        let prepared = pipeline.prepare(None).await.expect("prepare");

        let err = pipeline
            .fetch_content(&prepared.records, false)
            .await
            .expect_err("missing key");
        assert!(err.to_string().contains("YOUTUBE_API_KEY"));
        assert!(!CheckpointStore::new(config.checkpoint_dir)
            .path_for(CONTENT_FETCH_STAGE)
            .exists());
    }

    #[tokio::test]
    async fn load_prepared_without_prepare_points_at_the_command() {
        let dir = tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            config_in(dir.path()),
            Credentials::default(),
            Arc::new(AtomicBool::new(false)),
        );
        let err = pipeline.load_prepared().await.expect_err("nothing prepared");
        assert!(err.to_string().contains("run `prepare` first"));
    }
}
