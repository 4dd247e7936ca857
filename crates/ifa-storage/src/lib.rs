//! Durable file writes, checkpoint store, and HTTP plumbing for the pipeline.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use ifa_core::ItemState;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ifa-storage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` through a temp file in the same directory and a
/// rename, so readers never observe a partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredFile> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(StoredFile {
        path: path.to_path_buf(),
        sha256: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

pub async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> anyhow::Result<StoredFile> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes).await
}

/// Creates `dir` and fails if it already exists; run outputs are never overwritten.
pub async fn create_fresh_dir(dir: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    fs::create_dir(dir)
        .await
        .with_context(|| format!("creating run directory {}", dir.display()))
}

/// Persisted state of one orchestrated work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord<T> {
    pub key: String,
    pub state: ItemState,
    pub attempts: u32,
    pub result: Option<T>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl<T> ItemRecord<T> {
    pub fn pending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: ItemState::Pending,
            attempts: 0,
            result: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint<T> {
    pub stage: String,
    pub updated_at: DateTime<Utc>,
    pub items: BTreeMap<String, ItemRecord<T>>,
}

impl<T> Checkpoint<T> {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            updated_at: Utc::now(),
            items: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ItemRecord<T>> {
        self.items.get(key)
    }

    pub fn upsert(&mut self, record: ItemRecord<T>) {
        self.items.insert(record.key.clone(), record);
    }

    pub fn count(&self, state: ItemState) -> usize {
        self.items.values().filter(|r| r.state == state).count()
    }

    pub fn succeeded_results(&self) -> impl Iterator<Item = (&str, &T)> {
        self.items.values().filter_map(|record| match record.state {
            ItemState::Succeeded => record.result.as_ref().map(|r| (record.key.as_str(), r)),
            _ => None,
        })
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("reading checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint {path} belongs to stage {found:?}, expected {expected:?}")]
    StageMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("writing checkpoint {path}: {source:#}")]
    Write {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// One JSON document per stage under a checkpoint directory. Saves are atomic,
/// so a crash leaves either the previous or the new snapshot.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, stage: &str) -> PathBuf {
        self.root.join(format!("{stage}.checkpoint.json"))
    }

    /// A missing file is an empty checkpoint; an unreadable one is an error.
    pub async fn load<T: DeserializeOwned>(
        &self,
        stage: &str,
    ) -> Result<Checkpoint<T>, CheckpointError> {
        let path = self.path_for(stage);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(stage, path = %path.display(), "no checkpoint yet");
                return Ok(Checkpoint::new(stage));
            }
            Err(source) => return Err(CheckpointError::Read { path, source }),
        };
        let checkpoint: Checkpoint<T> = serde_json::from_slice(&bytes)
            .map_err(|source| CheckpointError::Corrupt {
                path: path.clone(),
                source,
            })?;
        if checkpoint.stage != stage {
            return Err(CheckpointError::StageMismatch {
                path,
                expected: stage.to_string(),
                found: checkpoint.stage,
            });
        }
        Ok(checkpoint)
    }

    pub async fn save<T: Serialize>(
        &self,
        checkpoint: &mut Checkpoint<T>,
    ) -> Result<StoredFile, CheckpointError> {
        checkpoint.updated_at = Utc::now();
        let path = self.path_for(&checkpoint.stage);
        write_json_atomic(&path, checkpoint)
            .await
            .map_err(|source| CheckpointError::Write { path, source })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry policy: at most `max_attempts` calls per item, sleeping
/// `base_delay * 2^n` (capped at `max_delay`) after the n-th failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Steady `rpm` requests per minute with a burst of one.
    pub fn per_minute(rpm: u32) -> Option<Self> {
        (rpm > 0).then(|| Self {
            capacity: 1,
            refill_every: Duration::from_millis(60_000 / u64::from(rpm)),
        })
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 || self.refill_every.is_zero() {
                state.tokens = state.tokens.saturating_sub(1);
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_service_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("ifa/{}", env!("CARGO_PKG_VERSION"))),
            global_concurrency: 16,
            per_service_concurrency: 4,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum HttpFetchError {
    #[error("request to {service} failed: {source}")]
    Request {
        service: String,
        disposition: RetryDisposition,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} from {service}: {body}")]
    Status {
        service: String,
        status: u16,
        disposition: RetryDisposition,
        body: String,
    },
}

impl HttpFetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            HttpFetchError::Request { disposition, .. }
            | HttpFetchError::Status { disposition, .. } => *disposition,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpFetchError::Status { status, .. } => Some(*status),
            HttpFetchError::Request { .. } => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

/// Bounded HTTP client shared by the external collaborators. Each call is a
/// single attempt; retrying is the orchestrator's job.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_service_limit: usize,
    per_service: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_service_limit: config.per_service_concurrency.max(1),
            per_service: Mutex::new(HashMap::new()),
            token_bucket,
        })
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    async fn per_service_semaphore(&self, service: &str) -> Arc<Semaphore> {
        let mut map = self.per_service.lock().await;
        map.entry(service.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_service_limit)))
            .clone()
    }

    pub async fn execute(
        &self,
        service: &str,
        request: RequestBuilder,
    ) -> Result<FetchedResponse, HttpFetchError> {
        // Permits are only dropped on close, which never happens for these semaphores.
        let _global = self.global_limit.acquire().await.ok();
        let per_service = self.per_service_semaphore(service).await;
        let _service = per_service.acquire().await.ok();

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", service);
        async {
            let request_error = |source: reqwest::Error| HttpFetchError::Request {
                service: service.to_string(),
                disposition: classify_reqwest_error(&source),
                source,
            };

            let resp = request.send().await.map_err(request_error)?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await.map_err(request_error)?.to_vec();

            if status.is_success() {
                debug!(status = status.as_u16(), bytes = body.len(), "http ok");
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                });
            }

            let mut snippet = String::from_utf8_lossy(&body).into_owned();
            if snippet.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !snippet.is_char_boundary(cut) {
                    cut -= 1;
                }
                snippet.truncate(cut);
            }
            Err(HttpFetchError::Status {
                service: service.to_string(),
                status: status.as_u16(),
                disposition: classify_status(status),
                body: snippet,
            })
        }
        .instrument(span)
        .await
    }
}
