//! Shared mocks and builders for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bulkfetch::proxy::{PoolPolicy, ProbeResult, ProxyScheme, StaticProxyListSource};
use bulkfetch::{
    Artifact, Config, DownloadOrchestrator, Downloader, Event, FetchError, FormatConstraints,
    HealthProbe, ItemId, ItemMetadata, LocalDirSink, ProxyEndpoint, ProxySupervisor,
    ResumableStateStore, StorageSink,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const MB: f64 = 1024.0 * 1024.0;

/// Size reported for every mock artifact, large enough to keep proxies above any floor
pub const ARTIFACT_BYTES: u64 = 256 * 1024 * 1024;

pub fn ep(n: u8) -> ProxyEndpoint {
    ProxyEndpoint::new(ProxyScheme::Http, format!("10.0.0.{n}"), 8080)
}

/// `count` distinct valid item IDs
pub fn ids(count: usize) -> Vec<ItemId> {
    (0..count)
        .map(|i| ItemId::new(format!("item{:07}", i)).unwrap())
        .collect()
}

/// Probe answering from a fixed table of MB/s values; missing entries fail
pub struct SpeedProbe {
    speeds: HashMap<ProxyEndpoint, f64>,
}

impl SpeedProbe {
    pub fn new(speeds: &[(u8, f64)]) -> Self {
        Self {
            speeds: speeds.iter().map(|(n, s)| (ep(*n), *s)).collect(),
        }
    }
}

#[async_trait]
impl HealthProbe for SpeedProbe {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> ProbeResult {
        match self.speeds.get(endpoint) {
            Some(mbps) => ProbeResult::succeeded(mbps * MB, Duration::from_millis(5), 4096),
            None => ProbeResult::failed(Duration::from_millis(5), "connection refused"),
        }
    }

    fn name(&self) -> &'static str {
        "speed"
    }
}

/// How the mock downloader answers for an item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Transient,
    NotFound,
}

/// In-memory downloader recording every call and the lease concurrency it saw
pub struct MockDownloader {
    default: Behavior,
    behaviors: HashMap<ItemId, Behavior>,
    delay: Duration,
    calls: Mutex<Vec<(ItemId, ProxyEndpoint)>>,
    in_flight: Mutex<HashMap<ProxyEndpoint, usize>>,
    max_per_proxy: Mutex<usize>,
    max_total: Mutex<usize>,
}

impl MockDownloader {
    pub fn new(default: Behavior) -> Self {
        Self {
            default,
            behaviors: HashMap::new(),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_per_proxy: Mutex::new(0),
            max_total: Mutex::new(0),
        }
    }

    pub fn with(mut self, item: &ItemId, behavior: Behavior) -> Self {
        self.behaviors.insert(item.clone(), behavior);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<(ItemId, ProxyEndpoint)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, item: &ItemId) -> usize {
        self.calls().iter().filter(|(i, _)| i == item).count()
    }

    pub fn fetched_items(&self) -> Vec<ItemId> {
        let mut items: Vec<ItemId> = self.calls().into_iter().map(|(i, _)| i).collect();
        items.sort();
        items.dedup();
        items
    }

    pub fn max_per_proxy(&self) -> usize {
        *self.max_per_proxy.lock().unwrap()
    }

    pub fn max_total(&self) -> usize {
        *self.max_total.lock().unwrap()
    }

    fn enter(&self, proxy: &ProxyEndpoint) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let n = in_flight.entry(proxy.clone()).or_default();
        *n += 1;
        let here = *n;
        let total: usize = in_flight.values().sum();
        let mut max = self.max_per_proxy.lock().unwrap();
        *max = (*max).max(here);
        let mut max_total = self.max_total.lock().unwrap();
        *max_total = (*max_total).max(total);
    }

    fn leave(&self, proxy: &ProxyEndpoint) {
        if let Some(n) = self.in_flight.lock().unwrap().get_mut(proxy) {
            *n -= 1;
        }
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn fetch(
        &self,
        item: &ItemId,
        proxy: &ProxyEndpoint,
        _constraints: &FormatConstraints,
        dest_dir: &Path,
    ) -> Result<Artifact, FetchError> {
        self.calls.lock().unwrap().push((item.clone(), proxy.clone()));
        self.enter(proxy);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.leave(proxy);

        match self.behaviors.get(item).copied().unwrap_or(self.default) {
            Behavior::Transient => Err(FetchError::Network("connection reset by peer".into())),
            Behavior::NotFound => Err(FetchError::NotFound("video unavailable".into())),
            Behavior::Succeed => {
                let file = dest_dir.join(format!("{}.mp4", item));
                tokio::fs::write(&file, b"media").await.unwrap();
                Ok(Artifact {
                    dir: dest_dir.to_path_buf(),
                    files: vec![file],
                    bytes: ARTIFACT_BYTES,
                    metadata: ItemMetadata::default(),
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Fast-retrying configuration rooted in `dir`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.download.work_dir = dir.join("work");
    config.download.output_dir = dir.join("out");
    config.download.max_concurrent = 2;
    config.retry.max_attempts = 2;
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config.proxy.acquire_initial_backoff = Duration::from_millis(5);
    config.proxy.acquire_max_backoff = Duration::from_millis(20);
    config.proxy.acquire_max_wait = Duration::from_millis(200);
    config
}

/// Orchestrator over static proxies answering the given MB/s, storing into `out/`
pub async fn orchestrator(
    config: Config,
    speeds: &[(u8, f64)],
    downloader: Arc<MockDownloader>,
) -> DownloadOrchestrator {
    let sink = Arc::new(LocalDirSink::new(config.download.output_dir.clone()));
    orchestrator_with_sink(config, speeds, downloader, sink).await
}

/// Orchestrator over static proxies answering the given MB/s
pub async fn orchestrator_with_sink(
    config: Config,
    speeds: &[(u8, f64)],
    downloader: Arc<MockDownloader>,
    sink: Arc<dyn StorageSink>,
) -> DownloadOrchestrator {
    let endpoints = speeds.iter().map(|(n, _)| ep(*n)).collect();
    let supervisor = Arc::new(ProxySupervisor::from_config(
        &config,
        Arc::new(StaticProxyListSource::new(endpoints)),
        Arc::new(SpeedProbe::new(speeds)),
    ));
    let store = Arc::new(
        ResumableStateStore::open(&config.database_path())
            .await
            .unwrap(),
    );
    DownloadOrchestrator::new(config, supervisor, store, downloader, sink)
}

/// Policy used by the pool-level scenarios
pub fn policy(min_speed_mbps: f64, failure_threshold: u32, max_uses: usize) -> PoolPolicy {
    PoolPolicy {
        min_speed_bps: min_speed_mbps * MB,
        max_uses_per_proxy: max_uses,
        failure_threshold,
        ewma_alpha: 0.3,
        recheck_base: Duration::from_secs(30),
        recheck_cap: Duration::from_secs(600),
        healthy_recheck: Duration::from_secs(300),
    }
}

/// Every event received so far
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}
