//! Proxy pool: health records and selection logic.
//!
//! The pool is plain data. It performs no I/O and takes the current time as a
//! parameter, which keeps every state transition deterministic and testable.
//! [`ProxySupervisor`](super::ProxySupervisor) owns the only instance and
//! serializes access to it.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::endpoint::ProxyEndpoint;
use super::probe::ProbeResult;
use crate::config::Config;

/// Health classification of a proxy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Never probed
    Untested,
    /// Working and fast enough
    Healthy,
    /// Working below the speed floor, or failing but not yet dead
    Degraded,
    /// Failed more often than the threshold allows
    Dead,
}

/// Mutable health metrics attached to one endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyHealth {
    /// Current classification
    pub state: HealthState,
    /// Measured throughput in bytes per second
    pub throughput_bps: Option<f64>,
    /// Latency of the last successful probe, in milliseconds
    pub latency_ms: Option<u64>,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Time of the last probe
    pub last_checked: Option<DateTime<Utc>>,
    /// Time the proxy was last handed out
    pub last_used: Option<DateTime<Utc>>,
    /// Leases currently outstanding (not persisted)
    #[serde(skip)]
    pub in_use: usize,
}

impl Default for ProxyHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Untested,
            throughput_bps: None,
            latency_ms: None,
            consecutive_failures: 0,
            last_checked: None,
            last_used: None,
            in_use: 0,
        }
    }
}

/// How a lease ended, as reported to [`ProxyPool::release`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReleaseOutcome {
    /// Transfer succeeded; the sample feeds the throughput average when non-empty
    Success {
        /// Bytes transferred
        bytes: u64,
        /// Transfer duration
        elapsed: Duration,
    },
    /// Transfer failed because of the proxy (timeout, reset, refused)
    Failure,
    /// Transfer ended for reasons unrelated to the proxy (missing item, cancellation)
    Neutral,
}

/// Thresholds governing selection and state transitions
#[derive(Clone, Debug)]
pub struct PoolPolicy {
    /// Throughput floor in bytes per second
    pub min_speed_bps: f64,
    /// Concurrent leases allowed per proxy
    pub max_uses_per_proxy: usize,
    /// Consecutive failures tolerated before a proxy is dead
    pub failure_threshold: u32,
    /// Weight of the newest sample in the throughput average
    pub ewma_alpha: f64,
    /// First re-check delay for failing proxies
    pub recheck_base: Duration,
    /// Upper bound of the re-check delay
    pub recheck_cap: Duration,
    /// Age after which healthy proxies are probed again
    pub healthy_recheck: Duration,
}

impl PoolPolicy {
    /// Derive the policy from the run configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_speed_bps: config.proxy.min_speed_bps(),
            max_uses_per_proxy: config.max_uses_per_proxy(),
            failure_threshold: config.proxy.failure_threshold,
            ewma_alpha: config.proxy.ewma_alpha,
            recheck_base: config.proxy.recheck_base,
            recheck_cap: config.proxy.recheck_cap,
            healthy_recheck: config.proxy.refresh_interval,
        }
    }

    /// Delay before a proxy with `failures` consecutive failures is probed again
    pub fn recheck_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.recheck_base
            .saturating_mul(1u32 << exponent)
            .min(self.recheck_cap)
    }
}

/// Result of merging an upstream list into the pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Endpoints new to the pool
    pub added: usize,
    /// Endpoints dropped because upstream no longer lists them
    pub removed: usize,
    /// Endpoints absent upstream but kept because they are healthy and leased
    pub retained: usize,
}

/// Counts per state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Untested proxies
    pub untested: usize,
    /// Healthy proxies
    pub healthy: usize,
    /// Degraded proxies
    pub degraded: usize,
    /// Dead proxies
    pub dead: usize,
    /// Outstanding leases across the pool
    pub in_use: usize,
    /// Healthy proxies with a free slot right now
    pub available: usize,
}

/// One serialized pool entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Endpoint identity
    pub endpoint: ProxyEndpoint,
    /// Health at snapshot time
    pub health: ProxyHealth,
}

/// Serialized pool, reloaded on startup
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// When the snapshot was taken
    pub saved_at: DateTime<Utc>,
    /// Entries
    pub proxies: Vec<SnapshotEntry>,
}

/// Mapping from endpoint to health, plus the policy that drives it
pub struct ProxyPool {
    entries: HashMap<ProxyEndpoint, ProxyHealth>,
    policy: PoolPolicy,
}

impl ProxyPool {
    /// Create an empty pool
    pub fn new(policy: PoolPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
        }
    }

    /// Active policy
    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Number of endpoints
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool has no endpoints
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Health of one endpoint
    pub fn health(&self, endpoint: &ProxyEndpoint) -> Option<&ProxyHealth> {
        self.entries.get(endpoint)
    }

    /// Add an endpoint as untested; no-op if already present
    pub fn insert(&mut self, endpoint: ProxyEndpoint) -> bool {
        if self.entries.contains_key(&endpoint) {
            return false;
        }
        self.entries.insert(endpoint, ProxyHealth::default());
        true
    }

    /// Reconcile the pool with a fresh upstream list
    ///
    /// New endpoints start untested. Endpoints missing upstream are dropped,
    /// except healthy ones with outstanding leases.
    pub fn merge(&mut self, upstream: &[ProxyEndpoint]) -> MergeReport {
        let mut report = MergeReport::default();
        let listed: HashSet<&ProxyEndpoint> = upstream.iter().collect();

        let before = self.entries.len();
        self.entries.retain(|endpoint, health| {
            if listed.contains(endpoint) {
                return true;
            }
            let keep = health.state == HealthState::Healthy && health.in_use > 0;
            if keep {
                report.retained += 1;
            }
            keep
        });
        report.removed = before - self.entries.len();

        for endpoint in upstream {
            if self.insert(endpoint.clone()) {
                report.added += 1;
            }
        }

        report
    }

    fn is_acquirable(&self, health: &ProxyHealth) -> bool {
        health.state == HealthState::Healthy
            && health.consecutive_failures <= self.policy.failure_threshold
            && health
                .throughput_bps
                .is_some_and(|t| t >= self.policy.min_speed_bps)
            && health.in_use < self.policy.max_uses_per_proxy
    }

    fn best_candidate(&self, exclude: &HashSet<ProxyEndpoint>) -> Option<ProxyEndpoint> {
        self.entries
            .iter()
            .filter(|(endpoint, health)| !exclude.contains(*endpoint) && self.is_acquirable(health))
            .max_by(|(ea, a), (eb, b)| {
                let ta = a.throughput_bps.unwrap_or(0.0);
                let tb = b.throughput_bps.unwrap_or(0.0);
                ta.total_cmp(&tb)
                    // fewer failures wins
                    .then_with(|| b.consecutive_failures.cmp(&a.consecutive_failures))
                    // least recently used wins (never used sorts first)
                    .then_with(|| b.last_used.cmp(&a.last_used))
                    // stable choice between otherwise identical entries
                    .then_with(|| eb.cmp(ea))
            })
            .map(|(endpoint, _)| endpoint.clone())
    }

    /// Lease the best available proxy
    ///
    /// Picks the healthy endpoint with the highest throughput that has a free
    /// slot; ties go to fewer failures, then least recently used. Endpoints
    /// in `exclude` are never returned, even when nothing else qualifies.
    pub fn acquire(
        &mut self,
        exclude: &HashSet<ProxyEndpoint>,
        now: DateTime<Utc>,
    ) -> Option<ProxyEndpoint> {
        let chosen = self.best_candidate(exclude)?;

        if let Some(health) = self.entries.get_mut(&chosen) {
            health.in_use += 1;
            health.last_used = Some(now);
        }
        Some(chosen)
    }

    /// Return a lease and record how it went
    pub fn release(&mut self, endpoint: &ProxyEndpoint, outcome: ReleaseOutcome) {
        let policy = self.policy.clone();
        let Some(health) = self.entries.get_mut(endpoint) else {
            return;
        };
        health.in_use = health.in_use.saturating_sub(1);

        match outcome {
            ReleaseOutcome::Success { bytes, elapsed } => {
                health.consecutive_failures = 0;
                let secs = elapsed.as_secs_f64();
                if bytes > 0 && secs > 0.0 {
                    let sample = bytes as f64 / secs;
                    let avg = match health.throughput_bps {
                        Some(prev) => policy.ewma_alpha * sample + (1.0 - policy.ewma_alpha) * prev,
                        None => sample,
                    };
                    health.throughput_bps = Some(avg);
                    if health.state == HealthState::Healthy && avg < policy.min_speed_bps {
                        health.state = HealthState::Degraded;
                    }
                }
            }
            ReleaseOutcome::Failure => {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                if health.consecutive_failures > policy.failure_threshold {
                    health.state = HealthState::Dead;
                }
            }
            ReleaseOutcome::Neutral => {}
        }
    }

    /// Record a probe result
    ///
    /// A successful probe is the only way back to healthy; it also enforces the
    /// speed floor. A failed probe degrades the proxy, or kills it once the
    /// failure count exceeds the threshold.
    pub fn apply_probe(&mut self, endpoint: &ProxyEndpoint, result: &ProbeResult, now: DateTime<Utc>) {
        let policy = self.policy.clone();
        let Some(health) = self.entries.get_mut(endpoint) else {
            return;
        };
        health.last_checked = Some(now);

        if result.success {
            health.consecutive_failures = 0;
            health.throughput_bps = Some(result.throughput_bps);
            health.latency_ms = Some(result.latency.as_millis() as u64);
            health.state = if result.throughput_bps >= policy.min_speed_bps {
                HealthState::Healthy
            } else {
                HealthState::Degraded
            };
        } else {
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.state = if health.consecutive_failures > policy.failure_threshold {
                HealthState::Dead
            } else {
                HealthState::Degraded
            };
        }
    }

    /// Endpoints whose next probe is due, in testing order
    ///
    /// Order: degraded first (most likely to recover), then untested in random
    /// order, then healthy, then dead.
    pub fn due_for_probe(&self, now: DateTime<Utc>) -> Vec<ProxyEndpoint> {
        let elapsed_since = |t: Option<DateTime<Utc>>| -> Option<Duration> {
            t.map(|t| (now - t).to_std().unwrap_or(Duration::ZERO))
        };

        let mut degraded = Vec::new();
        let mut untested = Vec::new();
        let mut healthy = Vec::new();
        let mut dead = Vec::new();

        for (endpoint, health) in &self.entries {
            let since = elapsed_since(health.last_checked);
            match health.state {
                HealthState::Untested => untested.push(endpoint.clone()),
                HealthState::Healthy => {
                    if since.is_none_or(|s| s >= self.policy.healthy_recheck) {
                        healthy.push(endpoint.clone());
                    }
                }
                HealthState::Degraded | HealthState::Dead => {
                    let delay = self.policy.recheck_delay(health.consecutive_failures);
                    if since.is_none_or(|s| s >= delay) {
                        if health.state == HealthState::Dead {
                            dead.push(endpoint.clone());
                        } else {
                            degraded.push(endpoint.clone());
                        }
                    }
                }
            }
        }

        degraded.sort();
        healthy.sort();
        dead.sort();
        untested.shuffle(&mut rand::thread_rng());

        degraded
            .into_iter()
            .chain(untested)
            .chain(healthy)
            .chain(dead)
            .collect()
    }

    /// Counts per state
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for health in self.entries.values() {
            match health.state {
                HealthState::Untested => stats.untested += 1,
                HealthState::Healthy => stats.healthy += 1,
                HealthState::Degraded => stats.degraded += 1,
                HealthState::Dead => stats.dead += 1,
            }
            stats.in_use += health.in_use;
            if self.is_acquirable(health) {
                stats.available += 1;
            }
        }
        stats
    }

    /// Serializable copy of the pool
    pub fn snapshot(&self, now: DateTime<Utc>) -> PoolSnapshot {
        let mut proxies: Vec<SnapshotEntry> = self
            .entries
            .iter()
            .map(|(endpoint, health)| SnapshotEntry {
                endpoint: endpoint.clone(),
                health: health.clone(),
            })
            .collect();
        proxies.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        PoolSnapshot {
            saved_at: now,
            proxies,
        }
    }

    /// Load health records from a snapshot; returns how many were restored
    ///
    /// Lease counts are reset since no lease survives a restart. Existing
    /// entries are overwritten.
    pub fn restore(&mut self, snapshot: PoolSnapshot) -> usize {
        let count = snapshot.proxies.len();
        for entry in snapshot.proxies {
            let mut health = entry.health;
            health.in_use = 0;
            self.entries.insert(entry.endpoint, health);
        }
        count
    }
}
