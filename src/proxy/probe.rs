//! Health probes: short test transfers through a candidate proxy

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::endpoint::ProxyEndpoint;
use crate::fetch::Downloader;
use crate::types::{FormatConstraints, ItemId};

/// Outcome of one probe
///
/// Probes never fail with an error; every problem becomes an unsuccessful
/// result so that one bad proxy cannot disturb a probing round.
#[must_use]
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeResult {
    /// Whether the transfer completed
    pub success: bool,
    /// Measured throughput in bytes per second (0 on failure)
    pub throughput_bps: f64,
    /// Time to first response, or time until failure
    pub latency: Duration,
    /// Bytes transferred
    pub bytes: u64,
    /// Failure detail
    pub error: Option<String>,
}

impl ProbeResult {
    /// Successful probe
    pub fn succeeded(throughput_bps: f64, latency: Duration, bytes: u64) -> Self {
        Self {
            success: true,
            throughput_bps,
            latency,
            bytes,
            error: None,
        }
    }

    /// Failed probe
    pub fn failed(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            throughput_bps: 0.0,
            latency,
            bytes: 0,
            error: Some(error.into()),
        }
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { bytes as f64 / secs } else { bytes as f64 }
}

/// Test transfer through a proxy
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `endpoint`; never errors
    async fn probe(&self, endpoint: &ProxyEndpoint) -> ProbeResult;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Probe that GETs a reference URL through the proxy
///
/// Reads at most `max_bytes` of the body under a hard timeout. An error
/// status, a timeout, a connection error, or a body size that differs from
/// `expected_bytes` is a failure.
pub struct HttpHealthProbe {
    url: String,
    timeout: Duration,
    max_bytes: u64,
    expected_bytes: Option<u64>,
}

impl HttpHealthProbe {
    /// Create a probe for `url`
    pub fn new(url: impl Into<String>, timeout: Duration, max_bytes: u64) -> Self {
        Self {
            url: url.into(),
            timeout,
            max_bytes,
            expected_bytes: None,
        }
    }

    /// Require the transfer to produce exactly this many bytes (capped at `max_bytes`)
    pub fn with_expected_bytes(mut self, expected: Option<u64>) -> Self {
        self.expected_bytes = expected;
        self
    }

    async fn transfer(&self, endpoint: &ProxyEndpoint, started: Instant) -> Result<ProbeResult, String> {
        let proxy = reqwest::Proxy::all(endpoint.url()).map_err(|e| e.to_string())?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .build()
            .map_err(|e| e.to_string())?;

        let mut response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let latency = started.elapsed();

        let mut bytes = 0u64;
        while bytes < self.max_bytes {
            match response.chunk().await.map_err(|e| e.to_string())? {
                Some(chunk) => bytes += chunk.len() as u64,
                None => break,
            }
        }
        let bytes = bytes.min(self.max_bytes);

        if bytes == 0 {
            return Err("empty response body".to_string());
        }
        if let Some(expected) = self.expected_bytes {
            let expected = expected.min(self.max_bytes);
            if bytes != expected {
                return Err(format!("size mismatch: got {bytes} bytes, expected {expected}"));
            }
        }

        Ok(ProbeResult::succeeded(rate(bytes, started.elapsed()), latency, bytes))
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> ProbeResult {
        let started = Instant::now();
        // the client timeout covers the request; this covers slow bodies too
        match tokio::time::timeout(self.timeout, self.transfer(endpoint, started)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ProbeResult::failed(started.elapsed(), e),
            Err(_) => ProbeResult::failed(started.elapsed(), format!("timed out after {:?}", self.timeout)),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Probe that fetches a known reference item with the real downloader
///
/// Uses the smallest format constraints, measures bytes over elapsed time and
/// deletes the artifact afterwards.
pub struct FetchHealthProbe {
    downloader: Arc<dyn Downloader>,
    item: ItemId,
    scratch_root: PathBuf,
    timeout: Duration,
}

impl FetchHealthProbe {
    /// Create a probe downloading `item` into directories under `scratch_root`
    pub fn new(
        downloader: Arc<dyn Downloader>,
        item: ItemId,
        scratch_root: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            downloader,
            item,
            scratch_root: scratch_root.into(),
            timeout,
        }
    }

    fn scratch_dir(&self, endpoint: &ProxyEndpoint) -> PathBuf {
        let tag: u32 = rand::random();
        let host: String = endpoint
            .host()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.scratch_root
            .join(format!("probe-{}-{}-{:08x}", host, endpoint.port(), tag))
    }
}

#[async_trait]
impl HealthProbe for FetchHealthProbe {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> ProbeResult {
        let dir = self.scratch_dir(endpoint);
        let constraints = FormatConstraints::smallest();
        let started = Instant::now();
        let fetch = self
            .downloader
            .fetch(&self.item, endpoint, &constraints, &dir);

        let result = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(Ok(artifact)) if artifact.bytes > 0 => {
                let elapsed = started.elapsed();
                ProbeResult::succeeded(rate(artifact.bytes, elapsed), elapsed, artifact.bytes)
            }
            Ok(Ok(_)) => ProbeResult::failed(started.elapsed(), "empty artifact"),
            Ok(Err(e)) => ProbeResult::failed(started.elapsed(), e.to_string()),
            Err(_) => ProbeResult::failed(started.elapsed(), format!("timed out after {:?}", self.timeout)),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(dir = %dir.display(), error = %e, "Failed to remove probe scratch directory");
        }
        result
    }

    fn name(&self) -> &'static str {
        "fetch"
    }
}
