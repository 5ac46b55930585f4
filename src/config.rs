//! Configuration types for bulkfetch

use crate::error::{Error, Result};
use crate::types::{FormatConstraints, MediaSelection, Resolution};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Download behavior configuration (directories, concurrency, formats)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Working directory holding state, caches, and scratch downloads (default: "./work")
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Directory the local sink moves finished artifacts into (default: "./output")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Maximum concurrent downloads (default: 5)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Hard deadline for a single download attempt (default: 600 seconds)
    #[serde(default = "default_attempt_timeout", with = "duration_serde")]
    pub attempt_timeout: Duration,

    /// Format constraints applied to every task
    #[serde(default)]
    pub constraints: FormatConstraints,

    /// Regex every input ID must match (default: 11-character URL-safe IDs)
    #[serde(default = "default_id_pattern")]
    pub id_pattern: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            output_dir: default_output_dir(),
            max_concurrent: default_max_concurrent(),
            attempt_timeout: default_attempt_timeout(),
            constraints: FormatConstraints::default(),
            id_pattern: default_id_pattern(),
        }
    }
}

/// Retry configuration for transient task failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Run-level circuit breaker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive task failures that stop the run (default: 10)
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
        }
    }
}

/// Proxy pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// URL of the upstream proxy list (one endpoint per line)
    #[serde(default)]
    pub list_url: Option<String>,

    /// Throughput floor in MB/s; slower proxies are never handed out (default: 1.0)
    #[serde(default = "default_min_speed_mbps")]
    pub min_speed_mbps: f64,

    /// Concurrent uses allowed per proxy (default: max(1, max_concurrent / 2))
    #[serde(default)]
    pub max_uses_per_proxy: Option<usize>,

    /// Consecutive failures tolerated before a proxy is declared dead (default: 2)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Interval between background refresh and probe rounds (default: 300 seconds)
    #[serde(default = "default_refresh_interval", with = "duration_serde")]
    pub refresh_interval: Duration,

    /// Base re-check delay for failing proxies, doubled per failure (default: 30 seconds)
    #[serde(default = "default_recheck_base", with = "duration_serde")]
    pub recheck_base: Duration,

    /// Upper bound of the re-check delay (default: 1800 seconds)
    #[serde(default = "default_recheck_cap", with = "duration_serde")]
    pub recheck_cap: Duration,

    /// Weight of the newest sample in the throughput moving average (default: 0.3)
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,

    /// Probes run concurrently per round (default: 8)
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,

    /// First wait when no proxy is available (default: 2 seconds)
    #[serde(default = "default_acquire_initial_backoff", with = "duration_serde")]
    pub acquire_initial_backoff: Duration,

    /// Longest wait between acquisition attempts (default: 60 seconds)
    #[serde(default = "default_acquire_max_backoff", with = "duration_serde")]
    pub acquire_max_backoff: Duration,

    /// Total wait for a proxy before the attempt counts as failed (default: 300 seconds)
    #[serde(default = "default_acquire_max_wait", with = "duration_serde")]
    pub acquire_max_wait: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            list_url: None,
            min_speed_mbps: default_min_speed_mbps(),
            max_uses_per_proxy: None,
            failure_threshold: default_failure_threshold(),
            refresh_interval: default_refresh_interval(),
            recheck_base: default_recheck_base(),
            recheck_cap: default_recheck_cap(),
            ewma_alpha: default_ewma_alpha(),
            probe_concurrency: default_probe_concurrency(),
            acquire_initial_backoff: default_acquire_initial_backoff(),
            acquire_max_backoff: default_acquire_max_backoff(),
            acquire_max_wait: default_acquire_max_wait(),
        }
    }
}

impl ProxyConfig {
    /// Throughput floor in bytes per second
    pub fn min_speed_bps(&self) -> f64 {
        self.min_speed_mbps * BYTES_PER_MB
    }
}

/// Health probe configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Item downloaded through each proxy by the fetch-based probe
    #[serde(default)]
    pub reference_item: Option<String>,

    /// URL fetched through each proxy by the HTTP probe
    #[serde(default)]
    pub reference_url: Option<String>,

    /// Hard timeout for one probe (default: 30 seconds)
    #[serde(default = "default_probe_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Stop reading after this many bytes (default: 2 MiB)
    #[serde(default = "default_probe_max_bytes")]
    pub max_bytes: u64,

    /// Exact transfer size the reference must produce, when known
    #[serde(default)]
    pub expected_bytes: Option<u64>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            reference_item: None,
            reference_url: None,
            timeout: default_probe_timeout(),
            max_bytes: default_probe_max_bytes(),
            expected_bytes: None,
        }
    }
}

/// Persisted state locations
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database of resumable records (default: `<work_dir>/state.db`)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Proxy health snapshot (default: `<work_dir>/cache/proxies.json`)
    #[serde(default)]
    pub proxy_snapshot_path: Option<PathBuf>,
}

/// Main configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directories, concurrency, formats
    #[serde(default)]
    pub download: DownloadConfig,

    /// Per-task retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Run-level circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Proxy pool behavior
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Health probes
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Persisted state locations
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Load configuration from the process environment, reading `.env` first
    ///
    /// Recognized variables: `BULKFETCH_WORK_DIR`, `BULKFETCH_OUTPUT_DIR`,
    /// `YTBULK_MAX_RETRIES`, `YTBULK_MAX_CONCURRENT`, `YTBULK_ERROR_THRESHOLD`,
    /// `YTBULK_TEST_VIDEO`, `YTBULK_PROXY_LIST_URL`, `YTBULK_PROXY_MIN_SPEED`,
    /// `YTBULK_DEFAULT_RESOLUTION`, `BULKFETCH_PROBE_URL`.
    /// Unset variables keep their defaults. The result is not validated.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "Failed to load .env file");
            }
        }

        let mut config = Config::default();

        if let Some(v) = env_var("BULKFETCH_WORK_DIR") {
            config.download.work_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("BULKFETCH_OUTPUT_DIR") {
            config.download.output_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<u32>("YTBULK_MAX_RETRIES")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = env_parse::<usize>("YTBULK_MAX_CONCURRENT")? {
            config.download.max_concurrent = v;
        }
        if let Some(v) = env_parse::<u32>("YTBULK_ERROR_THRESHOLD")? {
            config.circuit_breaker.error_threshold = v;
        }
        if let Some(v) = env_var("YTBULK_TEST_VIDEO") {
            config.probe.reference_item = Some(v);
        }
        if let Some(v) = env_var("BULKFETCH_PROBE_URL") {
            config.probe.reference_url = Some(v);
        }
        if let Some(v) = env_var("YTBULK_PROXY_LIST_URL") {
            config.proxy.list_url = Some(v);
        }
        if let Some(v) = env_parse::<f64>("YTBULK_PROXY_MIN_SPEED")? {
            config.proxy.min_speed_mbps = v;
        }
        if let Some(v) = env_parse::<Resolution>("YTBULK_DEFAULT_RESOLUTION")? {
            config.download.constraints.max_resolution = v;
        }

        Ok(config)
    }

    /// Check the configuration for values the run cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent == 0 {
            return Err(Error::config("max_concurrent", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("max_retries", "must be positive"));
        }
        if self.circuit_breaker.error_threshold == 0 {
            return Err(Error::config("error_threshold", "must be positive"));
        }
        if !(self.proxy.min_speed_mbps > 0.0) {
            return Err(Error::config("proxy_min_speed", "must be positive"));
        }
        if !(self.proxy.ewma_alpha > 0.0 && self.proxy.ewma_alpha <= 1.0) {
            return Err(Error::config("ewma_alpha", "must be in (0, 1]"));
        }
        if self.proxy.max_uses_per_proxy == Some(0) {
            return Err(Error::config("max_uses_per_proxy", "must be positive"));
        }
        if self.proxy.acquire_max_wait.is_zero() {
            return Err(Error::config("acquire_max_wait", "must be positive"));
        }
        if self.proxy.list_url.is_none() {
            return Err(Error::config("proxy_list_url", "is required"));
        }
        if self.probe.reference_item.is_none() && self.probe.reference_url.is_none() {
            return Err(Error::config(
                "probe_reference",
                "a reference item or reference URL is required",
            ));
        }
        self.id_regex()?;
        Ok(())
    }

    /// Compiled item ID pattern
    pub fn id_regex(&self) -> Result<regex::Regex> {
        regex::Regex::new(&self.download.id_pattern)
            .map_err(|e| Error::config("id_pattern", format!("invalid regex: {}", e)))
    }

    /// Concurrent uses allowed per proxy
    ///
    /// Defaults to half the worker count so a single fast proxy cannot absorb
    /// the whole run, while small runs still get at least one slot per proxy.
    pub fn max_uses_per_proxy(&self) -> usize {
        self.proxy
            .max_uses_per_proxy
            .unwrap_or_else(|| (self.download.max_concurrent / 2).max(1))
    }

    /// Resolved path of the resumable state database
    pub fn database_path(&self) -> PathBuf {
        self.persistence
            .database_path
            .clone()
            .unwrap_or_else(|| self.download.work_dir.join("state.db"))
    }

    /// Resolved path of the proxy health snapshot
    pub fn proxy_snapshot_path(&self) -> PathBuf {
        self.persistence
            .proxy_snapshot_path
            .clone()
            .unwrap_or_else(|| self.download.work_dir.join("cache").join("proxies.json"))
    }

    /// Scratch directory for downloads in progress
    pub fn downloads_dir(&self) -> PathBuf {
        self.download.work_dir.join("downloads")
    }

    /// Apply the two stream toggles of a front end
    pub fn set_media_selection(&mut self, video: bool, audio: bool) -> Result<()> {
        self.download.constraints.selection = MediaSelection::from_flags(video, audio)
            .ok_or_else(|| Error::config("selection", "at least one of video/audio is required"))?;
        Ok(())
    }
}

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Default item ID pattern: eleven URL-safe base64 characters
pub const DEFAULT_ID_PATTERN: &str = "^[A-Za-z0-9_-]{11}$";

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(key, format!("invalid value '{}': {}", raw, e))),
        None => Ok(None),
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./work")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_max_concurrent() -> usize {
    5
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_id_pattern() -> String {
    DEFAULT_ID_PATTERN.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_error_threshold() -> u32 {
    10
}

fn default_min_speed_mbps() -> f64 {
    1.0
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_recheck_base() -> Duration {
    Duration::from_secs(30)
}

fn default_recheck_cap() -> Duration {
    Duration::from_secs(1800)
}

fn default_ewma_alpha() -> f64 {
    0.3
}

fn default_probe_concurrency() -> usize {
    8
}

fn default_acquire_initial_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_acquire_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_acquire_max_wait() -> Duration {
    Duration::from_secs(300)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_probe_max_bytes() -> u64 {
    2 * 1024 * 1024
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
