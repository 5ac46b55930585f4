//! Proxy supervisor: owns the pool and keeps it fresh

use chrono::Utc;
use futures::StreamExt;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::endpoint::ProxyEndpoint;
use super::pool::{MergeReport, PoolPolicy, PoolSnapshot, PoolStats, ProxyPool, ReleaseOutcome};
use super::probe::HealthProbe;
use super::source::ProxyListSource;
use crate::config::Config;
use crate::{Error, Result};

/// Thread-safe front of the [`ProxyPool`]
///
/// The pool sits behind one mutex that is held only for selection and record
/// updates, never across a network call. Refreshing and probing run either on
/// demand or from the maintenance loop started by
/// [`ProxySupervisor::start_maintenance`].
pub struct ProxySupervisor {
    pool: Mutex<ProxyPool>,
    source: Arc<dyn ProxyListSource>,
    probe: Arc<dyn HealthProbe>,
    snapshot_path: Option<PathBuf>,
    probe_concurrency: usize,
    refresh_interval: Duration,
}

impl ProxySupervisor {
    /// Create a supervisor with an empty pool
    pub fn new(
        policy: PoolPolicy,
        source: Arc<dyn ProxyListSource>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let refresh_interval = policy.healthy_recheck;
        Self {
            pool: Mutex::new(ProxyPool::new(policy)),
            source,
            probe,
            snapshot_path: None,
            probe_concurrency: 8,
            refresh_interval,
        }
    }

    /// Create a supervisor configured from `config`, snapshotting to the configured path
    pub fn from_config(
        config: &Config,
        source: Arc<dyn ProxyListSource>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self::new(PoolPolicy::from_config(config), source, probe)
            .with_snapshot_path(config.proxy_snapshot_path())
            .with_probe_concurrency(config.proxy.probe_concurrency)
            .with_refresh_interval(config.proxy.refresh_interval)
    }

    /// Persist the pool to this file after rounds and on shutdown
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Maximum probes in flight
    pub fn with_probe_concurrency(mut self, n: usize) -> Self {
        self.probe_concurrency = n.max(1);
        self
    }

    /// Period of the maintenance loop
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Reload a previous snapshot, if one exists
    ///
    /// Returns the number of restored endpoints. A missing file is not an error.
    pub async fn load_snapshot(&self) -> Result<usize> {
        let Some(path) = &self.snapshot_path else {
            return Ok(0);
        };
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let snapshot: PoolSnapshot = serde_json::from_slice(&raw)?;
        let saved_at = snapshot.saved_at;
        let restored = self.pool.lock().await.restore(snapshot);
        tracing::info!(path = %path.display(), restored, saved_at = %saved_at, "Restored proxy snapshot");
        Ok(restored)
    }

    /// Write the pool to the snapshot file (temp file + rename)
    pub async fn save_snapshot(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = self.pool.lock().await.snapshot(Utc::now());
        let json = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn save_snapshot_logged(&self) {
        if let Err(e) = self.save_snapshot().await {
            tracing::warn!(error = %e, "Failed to save proxy snapshot");
        }
    }

    /// Merge the upstream list into the pool
    ///
    /// Soft-fails: when the source is unreachable or returns nothing, the pool
    /// is left untouched and `None` is returned.
    pub async fn refresh(&self) -> Option<MergeReport> {
        let upstream = match self.source.fetch().await {
            Ok(list) if !list.is_empty() => list,
            Ok(_) => {
                tracing::warn!(source = self.source.name(), "Proxy source returned an empty list, keeping pool");
                return None;
            }
            Err(e) => {
                tracing::warn!(source = self.source.name(), error = %e, "Proxy refresh failed, keeping pool");
                return None;
            }
        };

        let report = self.pool.lock().await.merge(&upstream);
        tracing::info!(
            upstream = upstream.len(),
            added = report.added,
            removed = report.removed,
            retained = report.retained,
            "Proxy pool refreshed"
        );
        Some(report)
    }

    /// Probe every endpoint that is due; returns the number of probes run
    pub async fn probe_all(&self) -> usize {
        self.probe_due(None).await
    }

    /// Probe due endpoints in testing order, stopping early once `stop_at`
    /// endpoints are acquirable
    async fn probe_due(&self, stop_at: Option<usize>) -> usize {
        let due = self.pool.lock().await.due_for_probe(Utc::now());
        if due.is_empty() {
            return 0;
        }
        tracing::debug!(count = due.len(), probe = self.probe.name(), "Probing proxies");

        let probe = &self.probe;
        let mut results = futures::stream::iter(due)
            .map(|endpoint| async move {
                let result = probe.probe(&endpoint).await;
                (endpoint, result)
            })
            .buffer_unordered(self.probe_concurrency);

        let mut probed = 0;
        while let Some((endpoint, result)) = results.next().await {
            probed += 1;
            let available = {
                let mut pool = self.pool.lock().await;
                pool.apply_probe(&endpoint, &result, Utc::now());
                pool.stats().available
            };

            if result.success {
                tracing::debug!(
                    proxy = %endpoint,
                    mbps = result.throughput_bps / (1024.0 * 1024.0),
                    latency_ms = result.latency.as_millis() as u64,
                    "Probe succeeded"
                );
            } else {
                tracing::debug!(proxy = %endpoint, error = result.error.as_deref().unwrap_or(""), "Probe failed");
            }

            if stop_at.is_some_and(|min| available >= min) {
                break;
            }
        }
        drop(results);

        let stats = self.stats().await;
        tracing::info!(
            probed,
            healthy = stats.healthy,
            degraded = stats.degraded,
            dead = stats.dead,
            untested = stats.untested,
            "Probe round finished"
        );
        self.save_snapshot_logged().await;
        probed
    }

    /// Startup helper: refresh, then probe until `min` proxies are usable
    ///
    /// Returns the number of acquirable proxies afterwards, which may be lower
    /// than `min` if the upstream list does not have enough good ones.
    pub async fn ensure_ready(&self, min: usize) -> usize {
        self.refresh().await;
        let available = self.stats().await.available;
        if available < min {
            self.probe_due(Some(min)).await;
        }
        let available = self.stats().await.available;
        if available < min {
            tracing::warn!(available, wanted = min, "Fewer usable proxies than requested");
        }
        available
    }

    /// Lease the best available proxy
    ///
    /// Endpoints in `exclude` are never returned.
    ///
    /// # Errors
    ///
    /// [`Error::NoHealthyProxy`] when nothing qualifies right now; callers
    /// back off and retry.
    pub async fn acquire(&self, exclude: &HashSet<ProxyEndpoint>) -> Result<ProxyEndpoint> {
        self.pool
            .lock()
            .await
            .acquire(exclude, Utc::now())
            .ok_or(Error::NoHealthyProxy)
    }

    /// Return a lease
    pub async fn release(&self, endpoint: &ProxyEndpoint, outcome: ReleaseOutcome) {
        let mut pool = self.pool.lock().await;
        pool.release(endpoint, outcome);
        if let Some(health) = pool.health(endpoint)
            && matches!(outcome, ReleaseOutcome::Failure)
        {
            tracing::debug!(
                proxy = %endpoint,
                failures = health.consecutive_failures,
                state = ?health.state,
                "Proxy failure recorded"
            );
        }
    }

    /// Counts per health state
    pub async fn stats(&self) -> PoolStats {
        self.pool.lock().await.stats()
    }

    /// Spawn the timer-driven refresh and probe loop
    ///
    /// Runs one round per refresh interval until `cancel` fires, then writes a
    /// final snapshot.
    pub fn start_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(supervisor.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick completes immediately; startup already ran a round
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        supervisor.refresh().await;
                        supervisor.probe_all().await;
                    }
                    _ = cancel.cancelled() => {
                        break;
                    }
                }
            }

            supervisor.save_snapshot_logged().await;
            tracing::debug!("Proxy maintenance stopped");
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::pool::HealthState;
    use crate::proxy::probe::ProbeResult;
    use crate::proxy::{ProxyScheme, StaticProxyListSource};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MB: f64 = 1024.0 * 1024.0;

    fn ep(n: u8) -> ProxyEndpoint {
        ProxyEndpoint::new(ProxyScheme::Http, format!("10.0.0.{n}"), 8080)
    }

    fn policy() -> PoolPolicy {
        PoolPolicy {
            min_speed_bps: MB,
            max_uses_per_proxy: 2,
            failure_threshold: 2,
            ewma_alpha: 0.3,
            recheck_base: Duration::from_secs(30),
            recheck_cap: Duration::from_secs(600),
            healthy_recheck: Duration::from_secs(300),
        }
    }

    /// Probe answering from a fixed table of MB/s values; missing entries fail
    struct TableProbe {
        speeds: HashMap<ProxyEndpoint, f64>,
        calls: AtomicUsize,
    }

    impl TableProbe {
        fn new(speeds: &[(ProxyEndpoint, f64)]) -> Self {
            Self {
                speeds: speeds.iter().cloned().collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for TableProbe {
        async fn probe(&self, endpoint: &ProxyEndpoint) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.speeds.get(endpoint) {
                Some(mbps) => ProbeResult::succeeded(mbps * MB, Duration::from_millis(50), 1024),
                None => ProbeResult::failed(Duration::from_millis(50), "refused"),
            }
        }

        fn name(&self) -> &'static str {
            "table"
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ProxyListSource for FailingSource {
        async fn fetch(&self) -> Result<Vec<ProxyEndpoint>> {
            Err(Error::Other("unreachable".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn supervisor(endpoints: Vec<ProxyEndpoint>, speeds: &[(ProxyEndpoint, f64)]) -> ProxySupervisor {
        ProxySupervisor::new(
            policy(),
            Arc::new(StaticProxyListSource::new(endpoints)),
            Arc::new(TableProbe::new(speeds)),
        )
    }

    #[tokio::test]
    async fn floor_scenario_picks_fast_proxy_until_it_dies() {
        let sup = supervisor(vec![ep(1), ep(2)], &[(ep(1), 0.5), (ep(2), 3.0)]);
        sup.refresh().await.unwrap();
        assert_eq!(sup.probe_all().await, 2);

        for _ in 0..3 {
            let got = sup.acquire(&HashSet::new()).await.unwrap();
            assert_eq!(got, ep(2));
            sup.release(&got, ReleaseOutcome::Failure).await;
        }

        assert!(matches!(sup.acquire(&HashSet::new()).await, Err(Error::NoHealthyProxy)));
        let stats = sup.stats().await;
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.degraded, 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_pool() {
        let sup = ProxySupervisor::new(
            policy(),
            Arc::new(FailingSource),
            Arc::new(TableProbe::new(&[])),
        );
        sup.pool.lock().await.insert(ep(1));
        assert!(sup.refresh().await.is_none());
        assert_eq!(sup.pool.lock().await.len(), 1);

        let empty = supervisor(vec![], &[]);
        empty.pool.lock().await.insert(ep(1));
        assert!(empty.refresh().await.is_none());
        assert_eq!(empty.pool.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn ensure_ready_stops_once_enough_are_usable() {
        let endpoints: Vec<_> = (1..=10).map(ep).collect();
        let speeds: Vec<_> = endpoints.iter().map(|e| (e.clone(), 5.0)).collect();
        let probe = Arc::new(TableProbe::new(&speeds));
        let sup = ProxySupervisor::new(
            policy(),
            Arc::new(StaticProxyListSource::new(endpoints)),
            probe.clone(),
        )
        .with_probe_concurrency(1);

        let available = sup.ensure_ready(3).await;
        assert_eq!(available, 3);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn probe_all_skips_fresh_records() {
        let probe = Arc::new(TableProbe::new(&[(ep(1), 2.0)]));
        let sup = ProxySupervisor::new(
            policy(),
            Arc::new(StaticProxyListSource::new(vec![ep(1), ep(2)])),
            probe.clone(),
        );
        sup.refresh().await;
        assert_eq!(sup.probe_all().await, 2);
        // healthy one is fresh, failed one waits for its back-off
        assert_eq!(sup.probe_all().await, 0);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn snapshot_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("proxies.json");

        let sup = supervisor(vec![ep(1), ep(2)], &[(ep(1), 4.0)]).with_snapshot_path(&path);
        sup.refresh().await;
        sup.probe_all().await;
        assert!(path.exists(), "probe round writes the snapshot");

        let reloaded = supervisor(vec![], &[]).with_snapshot_path(&path);
        assert_eq!(reloaded.load_snapshot().await.unwrap(), 2);
        let pool = reloaded.pool.lock().await;
        assert_eq!(pool.health(&ep(1)).unwrap().state, HealthState::Healthy);
        assert_eq!(pool.health(&ep(2)).unwrap().state, HealthState::Degraded);
        assert!(pool.health(&ep(2)).unwrap().last_checked.is_some());
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(vec![], &[]).with_snapshot_path(dir.path().join("none.json"));
        assert_eq!(sup.load_snapshot().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_acquire_never_exceeds_limit() {
        let sup = Arc::new(supervisor(vec![ep(1)], &[(ep(1), 3.0)]));
        sup.refresh().await;
        sup.probe_all().await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sup = sup.clone();
            handles.push(tokio::spawn(async move { sup.acquire(&HashSet::new()).await.is_ok() }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 2);
        assert_eq!(sup.stats().await.in_use, 2);

        for _ in 0..3 {
            sup.release(&ep(1), ReleaseOutcome::Neutral).await;
        }
        assert_eq!(sup.stats().await.in_use, 0);
    }

    #[tokio::test]
    async fn maintenance_stops_on_cancel_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.json");
        let sup = Arc::new(
            supervisor(vec![ep(1)], &[(ep(1), 3.0)])
                .with_snapshot_path(&path)
                .with_refresh_interval(Duration::from_millis(20)),
        );
        let cancel = CancellationToken::new();
        let handle = sup.start_maintenance(cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sup.stats().await.healthy, 1);
        assert!(path.exists());
    }
}
