//! Pipeline configuration, loaded once from YAML and passed down by reference.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ifa_adapters::{ConfigError, DEFAULT_ANTHROPIC_BASE_URL, DEFAULT_YOUTUBE_BASE_URL};
use ifa_ingest::{ColumnMap, NormalizerOptions};
use ifa_storage::{BackoffPolicy, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "ifa.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input_path: PathBuf,
    pub delimiter: String,
    pub columns: ColumnMap,
    pub output_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub content_fetch: StageConfig,
    pub enrichment: StageConfig,
    pub youtube: YouTubeSettings,
    pub llm: LlmSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("data/integrations.csv"),
            delimiter: ";".to_string(),
            columns: ColumnMap::default(),
            output_dir: PathBuf::from("output"),
            checkpoint_dir: PathBuf::from("output/checkpoints"),
            transcripts_dir: PathBuf::from("data/transcripts"),
            content_fetch: StageConfig::default(),
            enrichment: StageConfig {
                concurrency: 2,
                ..StageConfig::default()
            },
            youtube: YouTubeSettings::default(),
            llm: LlmSettings::default(),
        }
    }
}

/// Retry, pacing and checkpoint settings for one orchestrated stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub checkpoint_interval: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub concurrency: usize,
    pub requests_per_minute: Option<u32>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            concurrency: 4,
            requests_per_minute: None,
        }
    }
}

impl StageConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
        }
    }

    pub fn token_bucket(&self) -> Option<TokenBucketConfig> {
        self.requests_per_minute.and_then(TokenBucketConfig::per_minute)
    }

    fn validate(&self, stage: &str) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::Invalid {
            field: format!("{stage}.{field}"),
            reason: reason.to_string(),
        };
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.checkpoint_interval == 0 {
            return Err(invalid("checkpoint_interval", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YouTubeSettings {
    pub api_key_env: String,
    pub base_url: String,
    pub batch_timeout_secs: u64,
}

impl Default for YouTubeSettings {
    fn default() -> Self {
        Self {
            api_key_env: "YOUTUBE_API_KEY".to_string(),
            base_url: DEFAULT_YOUTUBE_BASE_URL.to_string(),
            batch_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub api_key_env: String,
    pub model: String,
    pub max_tokens: u32,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4_096,
            base_url: DEFAULT_ANTHROPIC_BASE_URL.to_string(),
            timeout_secs: 120,
        }
    }
}

/// Secrets resolved from the environment variables the config names.
#[derive(Clone, Default)]
pub struct Credentials {
    youtube: Option<String>,
    anthropic: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = |slot: &Option<String>| if slot.is_some() { "set" } else { "unset" };
        f.debug_struct("Credentials")
            .field("youtube", &shown(&self.youtube))
            .field("anthropic", &shown(&self.anthropic))
            .finish()
    }
}

impl Credentials {
    pub fn new(youtube_api_key: Option<String>, anthropic_api_key: Option<String>) -> Self {
        Self {
            youtube: youtube_api_key,
            anthropic: anthropic_api_key,
        }
    }

    fn require<'a>(slot: &'a Option<String>, env: &str) -> Result<&'a str, ConfigError> {
        slot.as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredential(env.to_string()))
    }

    pub fn youtube_api_key(&self, config: &PipelineConfig) -> Result<&str, ConfigError> {
        Self::require(&self.youtube, &config.youtube.api_key_env)
    }

    pub fn anthropic_api_key(&self, config: &PipelineConfig) -> Result<&str, ConfigError> {
        Self::require(&self.anthropic, &config.llm.api_key_env)
    }
}

impl PipelineConfig {
    /// Reads `path`; a missing or empty file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.delimiter_byte()?;
        self.content_fetch.validate("content_fetch")?;
        self.enrichment.validate("enrichment")?;
        if self.llm.max_tokens == 0 {
            return Err(ConfigError::Invalid {
                field: "llm.max_tokens".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        match self.delimiter.as_bytes() {
            [byte] if byte.is_ascii() => Ok(*byte),
            _ => Err(ConfigError::Invalid {
                field: "delimiter".to_string(),
                reason: format!("{:?} is not a single ASCII character", self.delimiter),
            }),
        }
    }

    pub fn normalizer_options(&self) -> Result<NormalizerOptions, ConfigError> {
        Ok(NormalizerOptions {
            delimiter: self.delimiter_byte()?,
            columns: self.columns.clone(),
        })
    }

    /// The only place environment variables are read.
    pub fn credentials(&self) -> Credentials {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Credentials::new(read(&self.youtube.api_key_env), read(&self.llm.api_key_env))
    }

    pub fn prepared_csv_path(&self) -> PathBuf {
        self.output_dir.join("prepared_integrations.csv")
    }

    pub fn prepared_json_path(&self) -> PathBuf {
        self.output_dir.join("prepared_integrations.json")
    }

    pub fn prep_diagnostics_path(&self) -> PathBuf {
        self.output_dir.join("prep_diagnostics.json")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.output_dir.join("runs")
    }
}
