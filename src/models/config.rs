//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Git access and worker pool settings
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Bucket discovery rules
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Backoff for outbound calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Work queue backend
    #[serde(default)]
    pub queue: QueueConfig,

    /// External search index backend
    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Override secrets and deployment parameters from the environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(token) = var("GITHUB_TOKEN").filter(|t| !t.is_empty()) {
            self.discovery.token = Some(token);
        }
        if let Some(endpoint) = var("SEARCH_ENDPOINT") {
            self.index.endpoint = endpoint;
        }
        if let Some(key) = var("SEARCH_API_KEY").filter(|k| !k.is_empty()) {
            self.index.api_key = Some(key);
        }
        if let Some(name) = var("SEARCH_INDEX") {
            self.index.name = name;
        }
        if let Some(backend) = var("INDEX_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.index.backend = backend,
                Err(e) => log::warn!("Ignoring INDEX_BACKEND: {}", e),
            }
        }
        if let Some(workers) = var("WORKERS").and_then(|w| w.parse().ok()) {
            self.crawler.workers = workers;
        }
        if let Some(bucket) = var("S3_BUCKET") {
            self.index.s3_bucket = bucket;
        }
        if let Some(prefix) = var("S3_PREFIX") {
            self.index.s3_prefix = prefix;
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.crawler.user_agent.trim().is_empty() {
            return Err(AppError::validation("crawler.user_agent is empty"));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(AppError::validation("crawler.timeout_secs must be > 0"));
        }
        if self.discovery.per_page == 0 || self.discovery.per_page > 100 {
            return Err(AppError::validation(
                "discovery.per_page must be between 1 and 100",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::validation("retry.max_attempts must be > 0"));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(AppError::validation(
                "retry.max_backoff_ms must be >= retry.initial_backoff_ms",
            ));
        }
        if self.queue.max_deliveries == 0 {
            return Err(AppError::validation("queue.max_deliveries must be > 0"));
        }
        if self.queue.visibility_timeout_secs == 0 {
            return Err(AppError::validation(
                "queue.visibility_timeout_secs must be > 0",
            ));
        }
        if self.index.batch_size == 0 {
            return Err(AppError::validation("index.batch_size must be > 0"));
        }
        if self.index.backend == IndexBackend::Search && self.index.endpoint.trim().is_empty() {
            return Err(AppError::validation(
                "index.endpoint is required for the search backend",
            ));
        }
        if self.index.backend == IndexBackend::S3 && self.index.s3_bucket.trim().is_empty() {
            return Err(AppError::validation(
                "index.s3_bucket is required for the s3 backend",
            ));
        }
        Ok(())
    }
}

/// Git access and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Number of concurrent workers (0 = available parallelism)
    #[serde(default)]
    pub workers: usize,

    /// Where bucket clones are kept between runs
    #[serde(default = "defaults::cache_dir")]
    pub cache_dir: PathBuf,

    /// Name of the git executable
    #[serde(default = "defaults::git")]
    pub git: String,
}

impl CrawlerConfig {
    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            workers: 0,
            cache_dir: defaults::cache_dir(),
            git: defaults::git(),
        }
    }
}

/// Bucket discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Base URL of the repository search API
    #[serde(default = "defaults::api_url")]
    pub api_url: String,

    /// Repository topics identifying buckets
    #[serde(default = "defaults::topics")]
    pub topics: Vec<String>,

    /// Extra qualifiers appended to every search query
    #[serde(default)]
    pub extra_query: Option<String>,

    /// Page size for search requests (max 100)
    #[serde(default = "defaults::per_page")]
    pub per_page: u32,

    /// Upper bound of pages fetched per topic
    #[serde(default = "defaults::max_pages")]
    pub max_pages: u32,

    /// API token; usually supplied through `GITHUB_TOKEN`
    #[serde(default)]
    pub token: Option<String>,

    /// Bucket URLs always crawled, found by search or not
    #[serde(default)]
    pub manual_buckets: Vec<String>,

    /// Bucket ids never crawled
    #[serde(default)]
    pub ignored_buckets: Vec<String>,

    /// Delete documents of buckets no longer discovered
    #[serde(default = "defaults::enabled")]
    pub prune_missing: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            api_url: defaults::api_url(),
            topics: defaults::topics(),
            extra_query: None,
            per_page: defaults::per_page(),
            max_pages: defaults::max_pages(),
            token: None,
            manual_buckets: Vec::new(),
            ignored_buckets: Vec::new(),
            prune_missing: true,
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, first call included
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "defaults::max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            initial_backoff_ms: defaults::initial_backoff(),
            max_backoff_ms: defaults::max_backoff(),
        }
    }
}

/// Queue backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Local,
}

/// Work queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,

    /// Directory of the local queue
    #[serde(default = "defaults::queue_path")]
    pub path: PathBuf,

    /// Lease length after which an unacknowledged item is redelivered
    #[serde(default = "defaults::visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Deliveries before an item is dead-lettered
    #[serde(default = "defaults::max_deliveries")]
    pub max_deliveries: u32,

    /// Idle wait while other workers still hold leases
    #[serde(default = "defaults::poll_interval")]
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            path: defaults::queue_path(),
            visibility_timeout_secs: defaults::visibility_timeout(),
            max_deliveries: defaults::max_deliveries(),
            poll_interval_ms: defaults::poll_interval(),
        }
    }
}

/// Index backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Memory,
    #[default]
    Local,
    Search,
    S3,
}

impl std::str::FromStr for IndexBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "local" => Ok(Self::Local),
            "search" => Ok(Self::Search),
            "s3" => Ok(Self::S3),
            other => Err(AppError::config(format!("unknown index backend '{other}'"))),
        }
    }
}

/// External index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub backend: IndexBackend,

    /// JSON file of the local backend
    #[serde(default = "defaults::index_path")]
    pub path: PathBuf,

    /// Search service URL, e.g. `https://<service>.search.windows.net`
    #[serde(default)]
    pub endpoint: String,

    /// Index name on the search service
    #[serde(default = "defaults::index_name")]
    pub name: String,

    #[serde(default = "defaults::api_version")]
    pub api_version: String,

    /// Admin key; usually supplied through `SEARCH_API_KEY`
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub s3_bucket: String,

    #[serde(default = "defaults::s3_prefix")]
    pub s3_prefix: String,

    /// Documents per upsert/delete request
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::default(),
            path: defaults::index_path(),
            endpoint: String::new(),
            name: defaults::index_name(),
            api_version: defaults::api_version(),
            api_key: None,
            s3_bucket: String::new(),
            s3_prefix: defaults::s3_prefix(),
            batch_size: defaults::batch_size(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Crawler defaults
    pub fn user_agent() -> String {
        concat!("bucket-crawler/", env!("CARGO_PKG_VERSION")).into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn cache_dir() -> PathBuf {
        PathBuf::from(".cache/buckets")
    }
    pub fn git() -> String {
        "git".into()
    }

    // Discovery defaults
    pub fn api_url() -> String {
        "https://api.github.com".into()
    }
    pub fn topics() -> Vec<String> {
        vec!["scoop-bucket".into()]
    }
    pub fn per_page() -> u32 {
        100
    }
    pub fn max_pages() -> u32 {
        10
    }
    pub fn enabled() -> bool {
        true
    }

    // Retry defaults
    pub fn max_attempts() -> u32 {
        5
    }
    pub fn initial_backoff() -> u64 {
        500
    }
    pub fn max_backoff() -> u64 {
        5_000
    }

    // Queue defaults
    pub fn queue_path() -> PathBuf {
        PathBuf::from(".cache/queue")
    }
    pub fn visibility_timeout() -> u64 {
        600
    }
    pub fn max_deliveries() -> u32 {
        5
    }
    pub fn poll_interval() -> u64 {
        500
    }

    // Index defaults
    pub fn index_path() -> PathBuf {
        PathBuf::from(".cache/index.json")
    }
    pub fn index_name() -> String {
        "buckets".into()
    }
    pub fn api_version() -> String {
        "2020-06-30".into()
    }
    pub fn s3_prefix() -> String {
        "index".into()
    }
    pub fn batch_size() -> usize {
        100
    }

    pub fn log_level() -> String {
        "info".into()
    }
}
