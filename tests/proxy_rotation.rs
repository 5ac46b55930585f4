//! Proxy selection as seen by callers of the supervisor and by a full run.

mod support;

use bulkfetch::proxy::{ProbeResult, ProxyPool, StaticProxyListSource};
use bulkfetch::{Error, HealthState, ProxySupervisor, ReleaseOutcome};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use support::{Behavior, MB, MockDownloader, SpeedProbe, ep, ids, orchestrator, policy, test_config};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn slow_proxy_is_skipped_and_dead_proxy_is_never_acquired() {
    let supervisor = ProxySupervisor::new(
        policy(1.0, 2, 4),
        Arc::new(StaticProxyListSource::new(vec![ep(1), ep(2)])),
        Arc::new(SpeedProbe::new(&[(1, 0.5), (2, 3.0)])),
    );
    supervisor.refresh().await.unwrap();
    assert_eq!(supervisor.probe_all().await, 2);

    for _ in 0..5 {
        let proxy = supervisor.acquire(&HashSet::new()).await.unwrap();
        assert_eq!(proxy, ep(2));
        supervisor
            .release(
                &proxy,
                ReleaseOutcome::Success {
                    bytes: 30 * 1024 * 1024,
                    elapsed: Duration::from_secs(10),
                },
            )
            .await;
    }

    for _ in 0..3 {
        let proxy = supervisor.acquire(&HashSet::new()).await.unwrap();
        assert_eq!(proxy, ep(2));
        supervisor.release(&proxy, ReleaseOutcome::Failure).await;
    }

    assert!(matches!(
        supervisor.acquire(&HashSet::new()).await,
        Err(Error::NoHealthyProxy)
    ));
    let stats = supervisor.stats().await;
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.degraded, 1);
    assert_eq!(stats.in_use, 0);
}

#[test]
fn only_a_successful_probe_revives_a_dead_proxy() {
    let mut pool = ProxyPool::new(policy(1.0, 2, 4));
    pool.insert(ep(1));
    let now = Utc::now();
    pool.apply_probe(&ep(1), &ProbeResult::succeeded(3.0 * MB, Duration::from_millis(20), 1024), now);

    for _ in 0..3 {
        let proxy = pool.acquire(&HashSet::new(), now).unwrap();
        pool.release(&proxy, ReleaseOutcome::Failure);
    }
    assert_eq!(pool.health(&ep(1)).unwrap().state, HealthState::Dead);

    // a failed probe does not bring it back
    pool.apply_probe(&ep(1), &ProbeResult::failed(Duration::from_secs(1), "timeout"), now);
    assert!(pool.acquire(&HashSet::new(), now).is_none());

    pool.apply_probe(&ep(1), &ProbeResult::succeeded(2.0 * MB, Duration::from_millis(20), 1024), now);
    let health = pool.health(&ep(1)).unwrap();
    assert_eq!(health.state, HealthState::Healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(pool.acquire(&HashSet::new(), now), Some(ep(1)));
}

#[tokio::test]
async fn leases_balance_and_respect_the_per_proxy_limit() {
    let dir = tempfile::tempdir().unwrap();
    let items = ids(24);
    let mut config = test_config(dir.path());
    config.download.max_concurrent = 6;
    config.proxy.max_uses_per_proxy = Some(2);

    let downloader = Arc::new(
        MockDownloader::new(Behavior::Succeed).with_delay(Duration::from_millis(20)),
    );
    let orch = orchestrator(config, &[(1, 3.0), (2, 4.0), (3, 5.0)], downloader.clone()).await;

    let summary = orch
        .run_to_completion(&items, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 24);
    assert!(downloader.max_per_proxy() <= 2, "per-proxy limit exceeded");
    assert!(downloader.max_total() <= 6, "worker limit exceeded");
    assert!(downloader.max_total() >= 2, "downloads should overlap");
    assert_eq!(orch.supervisor().stats().await.in_use, 0);
}

#[tokio::test]
async fn proxies_without_a_passing_probe_are_never_used() {
    let dir = tempfile::tempdir().unwrap();
    let items = ids(4);
    let mut config = test_config(dir.path());
    config.download.max_concurrent = 1;

    let downloader = Arc::new(MockDownloader::new(Behavior::Succeed));
    // ep(3) probes below the floor
    let orch = orchestrator(config, &[(1, 2.0), (3, 0.2)], downloader.clone()).await;

    let summary = orch
        .run_to_completion(&items, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 4);
    assert!(downloader.calls().iter().all(|(_, proxy)| *proxy == ep(1)));
}
