//! Configuration management for OpenRecall
//!
//! Layered precedence: defaults < config file < environment variables.
//! The config file is `$OPENRECALL_CONFIG` if set, otherwise
//! `<config dir>/openrecall/config.toml`. A `.env` file is honoured.

use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest dimension pgvector can build an ivfflat/hnsw index over.
pub const MAX_INDEXABLE_DIMENSIONS: usize = 2000;

fn default_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_true() -> bool {
    true
}

/// PostgreSQL database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    #[serde(skip_serializing, default = "default_secret")]
    pub url: SecretString,
    /// Maximum connections in pool; callers queue when exhausted
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: default_secret(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

/// Embedding capability configuration (OpenAI-compatible `/embeddings`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding API
    #[serde(default = "default_embedding_url")]
    pub base_url: String,
    /// API key, if the endpoint needs one
    #[serde(skip_serializing, default)]
    pub api_key: Option<SecretString>,
    /// Embedding model
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Process-wide vector dimension
    #[serde(default = "default_embedding_dims")]
    pub dimensions: usize,
    /// Per-call timeout
    #[serde(default = "default_embedding_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Query embedding cache entries (0 disables the cache)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    /// Query embedding cache TTL
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            base_url: default_embedding_url(),
            api_key: None,
            model: default_embedding_model(),
            dimensions: default_embedding_dims(),
            timeout: default_embedding_timeout(),
            cache_capacity: default_cache_capacity(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

fn default_embedding_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_embedding_model() -> String {
    "qwen3-embedding:8b".to_string()
}

fn default_embedding_dims() -> usize {
    4096
}

fn default_embedding_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cache_capacity() -> u64 {
    1000
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Generative compression capability configuration (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Run the COMPRESS stage through the external model
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL of the chat completion API
    #[serde(default = "default_compression_url")]
    pub base_url: String,
    /// API key, if the endpoint needs one
    #[serde(skip_serializing, default)]
    pub api_key: Option<SecretString>,
    /// Model used for reduction
    #[serde(default = "default_compression_model")]
    pub model: String,
    /// Per-call timeout
    #[serde(default = "default_compression_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Sampling temperature forwarded to the model
    #[serde(default)]
    pub temperature: f32,
    /// Chunks shorter than this many characters are dropped before compression
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
    /// Hard character cap for the local fallback
    #[serde(default = "default_fallback_char_budget")]
    pub fallback_char_budget: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            enabled: true,
            base_url: default_compression_url(),
            api_key: None,
            model: default_compression_model(),
            timeout: default_compression_timeout(),
            temperature: 0.0,
            min_chunk_chars: default_min_chunk_chars(),
            fallback_char_budget: default_fallback_char_budget(),
        }
    }
}

fn default_compression_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_compression_model() -> String {
    "qwen3:8b".to_string()
}

fn default_compression_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_min_chunk_chars() -> usize {
    50
}

fn default_fallback_char_budget() -> usize {
    8000
}

/// Nearest-neighbour scan strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Full scan, exact ranking
    #[default]
    Exact,
    /// Inverted-file probe; may miss results, never admits extra ones
    Approximate,
}

impl std::str::FromStr for IndexMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(IndexMode::Exact),
            "approximate" | "approx" | "ivf" => Ok(IndexMode::Approximate),
            _ => Err(Error::Config(format!(
                "Invalid index mode: {}. Valid options: exact, approximate",
                s
            ))),
        }
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default result count
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Upper bound any caller-provided limit is clamped to
    #[serde(default = "default_max_results_ceiling")]
    pub max_results_ceiling: usize,
    /// Default acceptance threshold
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f32,
    /// Default token budget for `retrieve_context`
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Scan strategy
    #[serde(default)]
    pub index_mode: IndexMode,
    /// Inverted lists to probe in approximate mode
    #[serde(default = "default_probes")]
    pub probes: usize,
    /// Inverted lists built in approximate mode
    #[serde(default = "default_lists")]
    pub lists: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig {
            max_results: default_max_results(),
            max_results_ceiling: default_max_results_ceiling(),
            similarity_floor: default_similarity_floor(),
            max_tokens: default_max_tokens(),
            index_mode: IndexMode::default(),
            probes: default_probes(),
            lists: default_lists(),
        }
    }
}

fn default_max_results() -> usize {
    100
}

fn default_max_results_ceiling() -> usize {
    1000
}

fn default_similarity_floor() -> f32 {
    0.7
}

fn default_max_tokens() -> usize {
    2000
}

fn default_probes() -> usize {
    10
}

fn default_lists() -> usize {
    100
}

/// Deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Consult the dedup guard on save
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How far back a duplicate is searched for
    #[serde(default = "default_lookback", with = "humantime_serde")]
    pub lookback: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            enabled: true,
            lookback: default_lookback(),
        }
    }
}

fn default_lookback() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before the first retry
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Cap applied after exponential growth
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the breaker stays open before a probe
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Resilience configuration shared by every boundary-crossing call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Retry with backoff
    #[serde(default)]
    pub retry: RetryConfig,
    /// Circuit breaker
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Timeout for each store round trip
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub store_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            store_timeout: default_store_timeout(),
        }
    }
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Retention configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Turns older than this are removed by `purge_expired`
    #[serde(default, with = "humantime_serde")]
    pub max_age: Option<Duration>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info,openrecall=debug".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// PostgreSQL settings
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Embedding capability settings
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Compression capability settings
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Retrieval settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Deduplication settings
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Retry and circuit breaker settings
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Retention settings
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load configuration: file (if any) then environment overrides, validated.
    pub fn load() -> Result<Self> {
        let path = config_path();
        let mut config = if path.exists() {
            Self::from_path(&path)?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file; format is picked by extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Invalid TOML config: {}", e))),
            "json" | "json5" => json5::from_str(&content)
                .map_err(|e| Error::Config(format!("Invalid JSON config: {}", e))),
            _ => toml::from_str(&content)
                .or_else(|_| json5::from_str(&content))
                .map_err(|e| Error::Config(format!("Failed to parse config: {}", e))),
        }
    }

    /// Overlay environment variables (highest precedence)
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        dotenvy::dotenv().ok();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = SecretString::from(url);
        }
        if let Some(n) = env_parse("DATABASE_MAX_CONNECTIONS")? {
            self.database.max_connections = n;
        }
        if let Ok(url) = std::env::var("EMBEDDING_BASE_URL") {
            self.embedding.base_url = url;
        }
        if let Ok(key) = std::env::var("EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(SecretString::from(key));
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(dims) = env_parse("EMBEDDING_DIMENSIONS")? {
            self.embedding.dimensions = dims;
        }
        if let Ok(enabled) = std::env::var("COMPRESSION_ENABLED") {
            self.compression.enabled = matches!(enabled.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(url) = std::env::var("COMPRESSION_BASE_URL") {
            self.compression.base_url = url;
        }
        if let Ok(key) = std::env::var("COMPRESSION_API_KEY") {
            self.compression.api_key = Some(SecretString::from(key));
        }
        if let Ok(model) = std::env::var("COMPRESSION_MODEL") {
            self.compression.model = model;
        }
        if let Some(n) = env_parse("RETRIEVAL_MAX_RESULTS")? {
            self.retrieval.max_results = n;
        }
        if let Some(floor) = env_parse("RETRIEVAL_SIMILARITY_FLOOR")? {
            self.retrieval.similarity_floor = floor;
        }
        if let Ok(mode) = std::env::var("RETRIEVAL_INDEX_MODE") {
            self.retrieval.index_mode = mode.parse()?;
        }
        if let Ok(lookback) = std::env::var("DEDUP_LOOKBACK") {
            self.dedup.lookback = humantime::parse_duration(&lookback)?;
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.log.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.log.format = format;
        }

        Ok(())
    }

    /// Validate values that would otherwise fail deep inside a request
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimensions == 0 {
            return Err(Error::Config("embedding.dimensions must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_floor) {
            return Err(Error::Config(format!(
                "retrieval.similarity_floor must be within [0, 1], got {}",
                self.retrieval.similarity_floor
            )));
        }
        if self.retrieval.max_results == 0
            || self.retrieval.max_results > self.retrieval.max_results_ceiling
        {
            return Err(Error::Config(format!(
                "retrieval.max_results must be within 1..={}",
                self.retrieval.max_results_ceiling
            )));
        }
        if self.resilience.retry.max_attempts == 0 {
            return Err(Error::Config("resilience.retry.max_attempts must be >= 1".to_string()));
        }
        if self.resilience.breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "resilience.breaker.failure_threshold must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Like `validate`, additionally requiring a database URL
    pub fn require_database(&self) -> Result<()> {
        if self.database.url.expose_secret().is_empty() {
            return Err(Error::Config("DATABASE_URL is required".to_string()));
        }
        Ok(())
    }
}

/// Path of the config file
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("OPENRECALL_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .map(|d| d.join("openrecall").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("openrecall.toml"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.embedding.dimensions, 4096);
        assert_eq!(config.retrieval.max_results, 100);
        assert_eq!(config.retrieval.similarity_floor, 0.7);
        assert_eq!(config.compression.min_chunk_chars, 50);
        assert_eq!(config.compression.timeout, Duration::from_secs(120));
        assert_eq!(config.dedup.lookback, Duration::from_secs(7200));
        assert_eq!(config.resilience.retry.max_attempts, 3);
        assert_eq!(config.resilience.breaker.failure_threshold, 5);
        assert_eq!(config.resilience.breaker.recovery_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
        assert!(config.require_database().is_err());
    }

    #[test]
    fn test_index_mode_parsing() {
        assert_eq!("exact".parse::<IndexMode>().unwrap(), IndexMode::Exact);
        assert_eq!("IVF".parse::<IndexMode>().unwrap(), IndexMode::Approximate);
        assert!("hnsw-ish".parse::<IndexMode>().is_err());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[embedding]
dimensions = 3

[dedup]
lookback = "30m"

[resilience.breaker]
recovery_timeout = "5s"
"#
        )
        .unwrap();

        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.embedding.dimensions, 3);
        assert_eq!(config.dedup.lookback, Duration::from_secs(1800));
        assert_eq!(config.resilience.breaker.recovery_timeout, Duration::from_secs(5));
        assert_eq!(config.resilience.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_load_json5_file() {
        let mut file = tempfile::Builder::new().suffix(".json5").tempfile().unwrap();
        writeln!(file, "{{ retrieval: {{ index_mode: 'approximate', probes: 4 }} }}").unwrap();

        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.retrieval.index_mode, IndexMode::Approximate);
        assert_eq!(config.retrieval.probes, 4);
    }

    #[test]
    fn test_validation_rejects_bad_floor() {
        let mut config = Config::default();
        config.retrieval.similarity_floor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_limit_over_ceiling() {
        let mut config = Config::default();
        config.retrieval.max_results = 5000;
        assert!(config.validate().is_err());
    }
}
