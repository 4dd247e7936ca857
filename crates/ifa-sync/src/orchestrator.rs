//! Resumable, bounded-concurrency driver for the content-fetch and enrichment stages.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use ifa_adapters::{
    ConfigError, ContentFetcher, EnrichError, Enricher, EnrichmentRequest, FetchError, NO_TRANSCRIPT,
};
use ifa_core::{ContentRecord, ContentRef, EnrichmentRecord, ItemState, NormalizedRecord};
use ifa_storage::{BackoffPolicy, Checkpoint, CheckpointStore, ItemRecord, SimpleTokenBucket, TokenBucketConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CONTENT_FETCH_STAGE: &str = "content_fetch";
pub const ENRICHMENT_STAGE: &str = "enrichment";

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// How a single attempt failed, from the orchestrator's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

/// One kind of unreliable call the orchestrator can drive.
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    type Input: Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn stage(&self) -> &'static str;

    async fn preflight(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// `attempt` is 1-based and counts attempts made in earlier runs too.
    async fn handle(&self, input: &Self::Input, attempt: u32) -> Result<Self::Output, WorkError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem<I> {
    pub key: String,
    pub input: I,
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub backoff: BackoffPolicy,
    pub concurrency: usize,
    pub checkpoint_interval: usize,
    pub token_bucket: Option<TokenBucketConfig>,
    /// Re-run items the checkpoint already holds as terminal.
    pub refetch: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            concurrency: 4,
            checkpoint_interval: 10,
            token_bucket: None,
            refetch: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub total_items: usize,
    pub attempted: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed_permanent: usize,
    pub pending: usize,
    pub interrupted: bool,
    pub failures: Vec<ItemFailure>,
    pub pending_keys: Vec<String>,
}

impl StageSummary {
    /// Item states for `keys` as recorded in `checkpoint`; unknown keys count as pending.
    pub fn from_checkpoint<T>(stage: &str, checkpoint: &Checkpoint<T>, keys: &[String]) -> Self {
        let mut summary = StageSummary {
            stage: stage.to_string(),
            total_items: keys.len(),
            ..StageSummary::default()
        };
        for key in keys {
            match checkpoint.get(key) {
                Some(record) if record.state == ItemState::Succeeded => summary.succeeded += 1,
                Some(record) if record.state == ItemState::FailedPermanent => {
                    summary.failed_permanent += 1;
                    summary.failures.push(ItemFailure {
                        key: key.clone(),
                        reason: record.last_error.clone().unwrap_or_default(),
                    });
                }
                _ => {
                    summary.pending += 1;
                    summary.pending_keys.push(key.clone());
                }
            }
        }
        summary
    }
}

/// Checkpoint after the run plus what happened during it.
#[derive(Debug, Clone)]
pub struct StageRun<T> {
    pub checkpoint: Checkpoint<T>,
    pub summary: StageSummary,
}

pub struct Orchestrator {
    store: CheckpointStore,
    options: OrchestratorOptions,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(store: CheckpointStore, options: OrchestratorOptions, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            store,
            options,
            shutdown,
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub async fn run<H: WorkHandler>(
        &self,
        handler: Arc<H>,
        items: Vec<WorkItem<H::Input>>,
    ) -> Result<StageRun<H::Output>> {
        let stage = handler.stage();
        let mut checkpoint: Checkpoint<H::Output> = self
            .store
            .load(stage)
            .await
            .with_context(|| format!("loading {stage} checkpoint"))?;

        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut work = Vec::new();
        let mut skipped = 0usize;
        // Keys whose terminal record stays in place until a new terminal outcome replaces it.
        let mut refetching = HashSet::new();
        for item in items {
            if !seen.insert(item.key.clone()) {
                continue;
            }
            keys.push(item.key.clone());
            let prior = checkpoint.get(&item.key);
            let state = prior.map(|r| r.state).unwrap_or(ItemState::Pending);
            if state.is_terminal() && !self.options.refetch {
                skipped += 1;
                continue;
            }
            let attempts = match prior {
                Some(record) if !state.is_terminal() => record.attempts,
                _ => 0,
            };
            if prior.is_none() {
                checkpoint.upsert(ItemRecord::pending(item.key.clone()));
            } else if state.is_terminal() {
                refetching.insert(item.key.clone());
            }
            work.push((item, attempts));
        }

        if !work.is_empty() {
            handler
                .preflight()
                .await
                .with_context(|| format!("{stage} preflight failed; no items were attempted"))?;
            self.store
                .save(&mut checkpoint)
                .await
                .with_context(|| format!("saving {stage} checkpoint"))?;
        }

        let to_process = work.len();
        info!(stage, total = keys.len(), to_process, skipped, "stage starting");

        let bucket = self
            .options
            .token_bucket
            .map(|config| Arc::new(SimpleTokenBucket::new(config)));
        let interval = self.options.checkpoint_interval.max(1);
        let gate = Arc::clone(&self.shutdown);

        let mut results = stream::iter(work)
            .take_while(move |_| futures::future::ready(!gate.load(Ordering::SeqCst)))
            .map(|(item, prior_attempts)| {
                process_item(
                    Arc::clone(&handler),
                    item,
                    prior_attempts,
                    self.options.backoff,
                    bucket.clone(),
                    Arc::clone(&self.shutdown),
                )
            })
            .buffer_unordered(self.options.concurrency.max(1));

        let mut attempted = 0usize;
        let mut since_save = 0usize;
        while let Some(record) = results.next().await {
            attempted += 1;
            if !record.state.is_terminal() && refetching.contains(&record.key) {
                debug!(stage, key = %record.key, "refetch unfinished; keeping previous result");
                continue;
            }
            since_save += 1;
            checkpoint.upsert(record);
            if since_save >= interval {
                self.store
                    .save(&mut checkpoint)
                    .await
                    .with_context(|| format!("saving {stage} checkpoint"))?;
                since_save = 0;
            }
        }
        drop(results);

        self.store
            .save(&mut checkpoint)
            .await
            .with_context(|| format!("saving {stage} checkpoint"))?;

        let mut summary = StageSummary::from_checkpoint(stage, &checkpoint, &keys);
        summary.attempted = attempted;
        summary.skipped = skipped;
        summary.interrupted =
            self.shutdown.load(Ordering::SeqCst) && (summary.pending > 0 || attempted < to_process);
        if summary.interrupted {
            warn!(stage, pending = summary.pending, "stage interrupted; rerun to resume");
        }
        info!(
            stage,
            succeeded = summary.succeeded,
            failed_permanent = summary.failed_permanent,
            pending = summary.pending,
            "stage finished"
        );
        Ok(StageRun { checkpoint, summary })
    }
}

async fn process_item<H: WorkHandler>(
    handler: Arc<H>,
    item: WorkItem<H::Input>,
    prior_attempts: u32,
    backoff: BackoffPolicy,
    bucket: Option<Arc<SimpleTokenBucket>>,
    shutdown: Arc<AtomicBool>,
) -> ItemRecord<H::Output> {
    let stage = handler.stage();
    let mut record = ItemRecord::pending(item.key.clone());
    record.attempts = prior_attempts;

    loop {
        if let Some(bucket) = &bucket {
            bucket.take().await;
        }
        record.attempts += 1;
        let attempt = record.attempts;
        let span = info_span!("work_item", stage, key = %item.key, attempt);
        let outcome = handler.handle(&item.input, attempt).instrument(span).await;
        record.updated_at = Utc::now();

        match outcome {
            Ok(output) => {
                debug!(stage, key = %item.key, attempt, "item succeeded");
                record.state = ItemState::Succeeded;
                record.result = Some(output);
                record.last_error = None;
                return record;
            }
            Err(WorkError::Permanent(reason)) => {
                warn!(stage, key = %item.key, attempt, error = %reason, "item failed permanently");
                record.state = ItemState::FailedPermanent;
                record.last_error = Some(reason);
                return record;
            }
            Err(WorkError::Transient(reason)) => {
                if backoff.attempts_exhausted(attempt) {
                    warn!(stage, key = %item.key, attempt, error = %reason, "retries exhausted");
                    record.state = ItemState::FailedPermanent;
                    record.last_error = Some(format!("gave up after {attempt} attempts: {reason}"));
                    return record;
                }
                record.state = ItemState::FailedTransient;
                record.last_error = Some(reason.clone());
                let delay = backoff.delay_for_attempt(attempt - 1);
                warn!(
                    stage,
                    key = %item.key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "transient failure; backing off"
                );
                if !sleep_unless_shutdown(delay, &shutdown).await {
                    return record;
                }
            }
        }
    }
}

/// Returns false when the shutdown flag cut the sleep short.
async fn sleep_unless_shutdown(delay: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(SHUTDOWN_POLL)).await;
    }
}

pub struct ContentFetchHandler {
    fetcher: Arc<dyn ContentFetcher>,
}

impl ContentFetchHandler {
    pub fn new(fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl WorkHandler for ContentFetchHandler {
    type Input = ContentRef;
    type Output = ContentRecord;

    fn stage(&self) -> &'static str {
        CONTENT_FETCH_STAGE
    }

    async fn preflight(&self) -> Result<(), ConfigError> {
        self.fetcher.preflight().await
    }

    async fn handle(&self, input: &ContentRef, _attempt: u32) -> Result<ContentRecord, WorkError> {
        self.fetcher.fetch(input).await.map_err(|err| match err {
            FetchError::Transient(reason) => WorkError::Transient(reason),
            FetchError::Permanent(reason) => WorkError::Permanent(reason),
        })
    }
}

pub struct EnrichmentHandler {
    enricher: Arc<dyn Enricher>,
}

impl EnrichmentHandler {
    pub fn new(enricher: Arc<dyn Enricher>) -> Self {
        Self { enricher }
    }
}

#[async_trait]
impl WorkHandler for EnrichmentHandler {
    type Input = EnrichmentRequest;
    type Output = EnrichmentRecord;

    fn stage(&self) -> &'static str {
        ENRICHMENT_STAGE
    }

    async fn preflight(&self) -> Result<(), ConfigError> {
        self.enricher.preflight().await
    }

    async fn handle(&self, input: &EnrichmentRequest, attempt: u32) -> Result<EnrichmentRecord, WorkError> {
        if !input.has_transcript() {
            return Err(WorkError::Permanent(NO_TRANSCRIPT.to_string()));
        }
        self.enricher.enrich(input).await.map_err(|err| match err {
            EnrichError::Transient(reason) => WorkError::Transient(reason),
            // A malformed response gets exactly one more try.
            EnrichError::MalformedResponse(reason) if attempt <= 1 => {
                WorkError::Transient(format!("malformed response: {reason}"))
            }
            EnrichError::MalformedResponse(reason) => {
                WorkError::Permanent(format!("malformed response: {reason}"))
            }
            EnrichError::Permanent(reason) => WorkError::Permanent(reason),
        })
    }
}

/// One content item per distinct `(platform, video_id)` among parseable records.
pub fn content_work_items(records: &[NormalizedRecord]) -> Vec<WorkItem<ContentRef>> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|record| record.is_parseable)
        .filter_map(NormalizedRecord::content_ref)
        .filter(|content| seen.insert(content.clone()))
        .map(|content| WorkItem {
            key: content.to_string(),
            input: content,
        })
        .collect()
}

/// One enrichment item per successfully fetched content item. The offset hint
/// comes from the first record referencing the content that carries one.
pub fn enrichment_work_items(
    records: &[NormalizedRecord],
    content: &Checkpoint<ContentRecord>,
) -> Vec<WorkItem<EnrichmentRequest>> {
    let mut offsets: BTreeMap<String, u32> = BTreeMap::new();
    for record in records {
        if let (Some(content_ref), Some(offset)) = (record.content_ref(), record.integration_start_offset_seconds) {
            offsets.entry(content_ref.to_string()).or_insert(offset);
        }
    }

    content_work_items(records)
        .into_iter()
        .filter_map(|item| {
            let stored = content.get(&item.key)?;
            if stored.state != ItemState::Succeeded {
                return None;
            }
            let fetched = stored.result.as_ref()?;
            Some(WorkItem {
                input: EnrichmentRequest::from_content(fetched, offsets.get(&item.key).copied()),
                key: item.key,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Scripted handler: `script[key]` lists the outcome of each successive attempt;
    /// attempts past the end of the script succeed.
    struct Scripted {
        script: BTreeMap<String, Vec<Option<WorkError>>>,
        calls: AtomicU32,
        seen: Mutex<Vec<(String, u32)>>,
        stop_after: Option<(u32, Arc<AtomicBool>)>,
        peek: Option<(String, CheckpointStore, Arc<Mutex<Option<usize>>>)>,
        preflight_error: bool,
    }

    impl Scripted {
        fn new(script: &[(&str, Vec<Option<WorkError>>)]) -> Self {
            Self {
                script: script
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
                stop_after: None,
                peek: None,
                preflight_error: false,
            }
        }
    }

    #[async_trait]
    impl WorkHandler for Scripted {
        type Input = String;
        type Output = String;

        fn stage(&self) -> &'static str {
            "test_stage"
        }

        async fn preflight(&self) -> Result<(), ConfigError> {
            if self.preflight_error {
                return Err(ConfigError::MissingCredential("TEST_KEY".into()));
            }
            Ok(())
        }

        async fn handle(&self, input: &String, attempt: u32) -> Result<String, WorkError> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().expect("lock").push((input.clone(), attempt));
            if let Some((key, store, slot)) = &self.peek {
                if key == input {
                    let on_disk: Checkpoint<String> = store.load("test_stage").await.expect("peek");
                    *slot.lock().expect("lock") = Some(on_disk.count(ItemState::Succeeded));
                }
            }
            if let Some((limit, flag)) = &self.stop_after {
                if calls >= *limit {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            let outcome = self
                .script
                .get(input)
                .and_then(|steps| steps.get(attempt as usize - 1).cloned())
                .flatten();
            match outcome {
                Some(err) => Err(err),
                None => Ok(format!("done:{input}")),
            }
        }
    }

    fn items(keys: &[&str]) -> Vec<WorkItem<String>> {
        keys.iter()
            .map(|k| WorkItem {
                key: k.to_string(),
                input: k.to_string(),
            })
            .collect()
    }

    fn fast_options(concurrency: usize, interval: usize) -> OrchestratorOptions {
        OrchestratorOptions {
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
            concurrency,
            checkpoint_interval: interval,
            token_bucket: None,
            refetch: false,
        }
    }

    fn transient(msg: &str) -> Option<WorkError> {
        Some(WorkError::Transient(msg.into()))
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed_or_exhaust() {
        let dir = tempdir().expect("tempdir");
        let orchestrator = Orchestrator::new(
            CheckpointStore::new(dir.path()),
            fast_options(2, 10),
            Arc::new(AtomicBool::new(false)),
        );
        let handler = Arc::new(Scripted::new(&[
            ("flaky", vec![transient("timeout")]),
            ("doomed", vec![transient("503"), transient("503"), transient("503")]),
            ("gone", vec![Some(WorkError::Permanent("video unavailable".into()))]),
        ]));
        let run = orchestrator
            .run(Arc::clone(&handler), items(&["ok", "flaky", "doomed", "gone"]))
            .await
            .expect("run");

        let state = |k: &str| run.checkpoint.get(k).expect("record").state;
        assert_eq!(state("ok"), ItemState::Succeeded);
        assert_eq!(state("flaky"), ItemState::Succeeded);
        assert_eq!(run.checkpoint.get("flaky").expect("flaky").attempts, 2);
        assert_eq!(state("doomed"), ItemState::FailedPermanent);
        assert_eq!(run.checkpoint.get("doomed").expect("doomed").attempts, 3);
        assert_eq!(state("gone"), ItemState::FailedPermanent);
        assert_eq!(run.checkpoint.get("gone").expect("gone").attempts, 1);

        assert_eq!(run.summary.succeeded, 2);
        assert_eq!(run.summary.failed_permanent, 2);
        assert_eq!(run.summary.pending, 0);
        assert!(!run.summary.interrupted);
        let reasons = run
            .summary
            .failures
            .iter()
            .map(|f| f.reason.as_str())
            .collect::<Vec<_>>();
        assert!(reasons.contains(&"video unavailable"));
        assert!(reasons.iter().any(|r| r.starts_with("gave up after 3 attempts")));
    }

    #[tokio::test]
    async fn terminal_items_are_skipped_on_rerun_unless_refetching() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        let shutdown = Arc::new(AtomicBool::new(false));
        let first = Orchestrator::new(store.clone(), fast_options(1, 10), Arc::clone(&shutdown));
        first
            .run(Arc::new(Scripted::new(&[])), items(&["a", "b"]))
            .await
            .expect("first run");

        let handler = Arc::new(Scripted::new(&[]));
        let rerun = first
            .run(Arc::clone(&handler), items(&["a", "b", "c"]))
            .await
            .expect("rerun");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(rerun.summary.skipped, 2);
        assert_eq!(rerun.summary.succeeded, 3);

        let refetch = Orchestrator::new(
            store,
            OrchestratorOptions {
                refetch: true,
                ..fast_options(1, 10)
            },
            shutdown,
        );
        let handler = Arc::new(Scripted::new(&[]));
        refetch
            .run(Arc::clone(&handler), items(&["a", "b", "c"]))
            .await
            .expect("refetch");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn interrupted_refetch_keeps_prior_results_on_disk() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        Orchestrator::new(store.clone(), fast_options(1, 10), Arc::new(AtomicBool::new(false)))
            .run(Arc::new(Scripted::new(&[])), items(&["a", "b", "c"]))
            .await
            .expect("first run");

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handler = Scripted::new(&[]);
        handler.stop_after = Some((1, Arc::clone(&shutdown)));
        let handler = Arc::new(handler);
        let refetch = Orchestrator::new(
            store.clone(),
            OrchestratorOptions {
                refetch: true,
                ..fast_options(1, 1)
            },
            shutdown,
        );
        let run = refetch
            .run(Arc::clone(&handler), items(&["a", "b", "c"]))
            .await
            .expect("refetch");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(run.summary.interrupted);

        let on_disk: Checkpoint<String> = store.load("test_stage").await.expect("load");
        for key in ["a", "b", "c"] {
            let record = on_disk.get(key).expect("record");
            assert_eq!(record.state, ItemState::Succeeded, "{key}");
            assert_eq!(record.result.as_deref(), Some(format!("done:{key}").as_str()));
        }
    }

    #[tokio::test]
    async fn refetch_only_replaces_results_with_terminal_outcomes() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        Orchestrator::new(store.clone(), fast_options(1, 10), Arc::new(AtomicBool::new(false)))
            .run(Arc::new(Scripted::new(&[])), items(&["flaky", "gone"]))
            .await
            .expect("first run");

        // Interrupted while backing off: the refetch of "flaky" ends transient.
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handler = Scripted::new(&[("flaky", vec![transient("503")])]);
        handler.stop_after = Some((1, Arc::clone(&shutdown)));
        Orchestrator::new(
            store.clone(),
            OrchestratorOptions {
                refetch: true,
                ..fast_options(1, 10)
            },
            shutdown,
        )
        .run(Arc::new(handler), items(&["flaky"]))
        .await
        .expect("transient refetch");

        let handler = Scripted::new(&[("gone", vec![Some(WorkError::Permanent("removed".into()))])]);
        Orchestrator::new(
            store.clone(),
            OrchestratorOptions {
                refetch: true,
                ..fast_options(1, 10)
            },
            Arc::new(AtomicBool::new(false)),
        )
        .run(Arc::new(handler), items(&["gone"]))
        .await
        .expect("permanent refetch");

        let on_disk: Checkpoint<String> = store.load("test_stage").await.expect("load");
        let flaky = on_disk.get("flaky").expect("flaky");
        assert_eq!(flaky.state, ItemState::Succeeded);
        assert_eq!(flaky.result.as_deref(), Some("done:flaky"));
        assert_eq!(flaky.attempts, 1);
        let gone = on_disk.get("gone").expect("gone");
        assert_eq!(gone.state, ItemState::FailedPermanent);
        assert_eq!(gone.last_error.as_deref(), Some("removed"));
    }

    #[tokio::test]
    async fn preflight_failure_aborts_before_any_item() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        let orchestrator = Orchestrator::new(store.clone(), fast_options(1, 1), Arc::new(AtomicBool::new(false)));
        let mut handler = Scripted::new(&[]);
        handler.preflight_error = true;
        let handler = Arc::new(handler);
        let err = orchestrator
            .run(Arc::clone(&handler), items(&["a"]))
            .await
            .expect_err("preflight should fail");
        assert!(format!("{err:#}").contains("TEST_KEY"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(!store.path_for("test_stage").exists());
    }

    #[tokio::test]
    async fn checkpoint_is_flushed_every_interval() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        let observed = Arc::new(Mutex::new(None));
        let mut handler = Scripted::new(&[]);
        handler.peek = Some(("c".into(), store.clone(), Arc::clone(&observed)));
        let orchestrator = Orchestrator::new(store, fast_options(1, 2), Arc::new(AtomicBool::new(false)));
        orchestrator
            .run(Arc::new(handler), items(&["a", "b", "c", "d"]))
            .await
            .expect("run");
        assert_eq!(*observed.lock().expect("lock"), Some(2));
    }

    #[tokio::test]
    async fn shutdown_stops_dispatch_and_resume_converges() {
        let script: Vec<(&str, Vec<Option<WorkError>>)> = vec![
            ("b", vec![transient("429")]),
            ("d", vec![Some(WorkError::Permanent("private".into()))]),
        ];
        let keys = ["a", "b", "c", "d", "e", "f"];

        let clean_dir = tempdir().expect("tempdir");
        let clean = Orchestrator::new(
            CheckpointStore::new(clean_dir.path()),
            fast_options(1, 1),
            Arc::new(AtomicBool::new(false)),
        )
        .run(Arc::new(Scripted::new(&script)), items(&keys))
        .await
        .expect("clean run");

        for stop_after in 1..=keys.len() as u32 {
            let dir = tempdir().expect("tempdir");
            let store = CheckpointStore::new(dir.path());
            let flag = Arc::new(AtomicBool::new(false));
            let mut handler = Scripted::new(&script);
            handler.stop_after = Some((stop_after, Arc::clone(&flag)));
            let partial = Orchestrator::new(store.clone(), fast_options(1, 1), Arc::clone(&flag))
                .run(Arc::new(handler), items(&keys))
                .await
                .expect("interrupted run");
            assert!(partial.summary.attempted <= stop_after as usize);

            let resumed = Orchestrator::new(store, fast_options(1, 1), Arc::new(AtomicBool::new(false)))
                .run(Arc::new(Scripted::new(&script)), items(&keys))
                .await
                .expect("resumed run");
            for key in keys {
                let a = clean.checkpoint.get(key).expect("clean record");
                let b = resumed.checkpoint.get(key).expect("resumed record");
                assert_eq!((a.state, &a.result, a.attempts), (b.state, &b.result, b.attempts), "key {key}");
            }
            assert_eq!(clean.summary.succeeded, resumed.summary.succeeded);
        }
    }

    #[tokio::test]
    async fn malformed_enrichment_is_retried_once_then_permanent() {
        struct Malformed;

        #[async_trait]
        impl Enricher for Malformed {
            fn model(&self) -> &str {
                "fake"
            }

            async fn enrich(&self, _request: &EnrichmentRequest) -> Result<EnrichmentRecord, EnrichError> {
                Err(EnrichError::MalformedResponse("not json".into()))
            }
        }

        let handler = EnrichmentHandler::new(Arc::new(Malformed));
        let mut record = ContentRecord::new(
            &ContentRef {
                platform: ifa_core::Platform::Youtube,
                video_id: "abc12345678".into(),
            },
            Utc::now(),
        );
        record.transcript_text = Some("hello".into());
        let request = EnrichmentRequest::from_content(&record, None);
        assert!(matches!(handler.handle(&request, 1).await, Err(WorkError::Transient(_))));
        assert!(matches!(handler.handle(&request, 2).await, Err(WorkError::Permanent(_))));

        record.transcript_text = None;
        let request = EnrichmentRequest::from_content(&record, None);
        assert_eq!(
            handler.handle(&request, 1).await,
            Err(WorkError::Permanent(NO_TRANSCRIPT.to_string()))
        );
    }

    #[test]
    fn content_items_are_deduplicated_by_video() {
        let mut a = NormalizedRecord::new(2, "a", "https://youtu.be/abc12345678");
        a.is_parseable = true;
        a.platform = ifa_core::Platform::Youtube;
        a.video_id = Some("abc12345678".into());
        let mut b = a.clone();
        b.source_row = 3;
        b.blogger_id = "b".into();
        b.integration_start_offset_seconds = Some(90);
        let unparseable = NormalizedRecord::new(4, "c", "promo.mp4");

        let content = content_work_items(&[a.clone(), b.clone(), unparseable]);
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].key, "youtube:abc12345678");

        let mut checkpoint: Checkpoint<ContentRecord> = Checkpoint::new(CONTENT_FETCH_STAGE);
        let mut fetched = ItemRecord::pending("youtube:abc12345678");
        fetched.state = ItemState::Succeeded;
        fetched.result = Some(ContentRecord::new(&content[0].input, Utc::now()));
        checkpoint.upsert(fetched);
        let enrich = enrichment_work_items(&[a, b], &checkpoint);
        assert_eq!(enrich.len(), 1);
        assert_eq!(enrich[0].input.offset_hint_seconds, Some(90));
    }
}
