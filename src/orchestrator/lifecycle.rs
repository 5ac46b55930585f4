//! Default wiring, startup and shutdown coordination.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::DownloadOrchestrator;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{CliDownloader, DEFAULT_BINARY, Downloader};
use crate::proxy::{
    FetchHealthProbe, HealthProbe, HttpHealthProbe, HttpProxyListSource, ProxySupervisor,
};
use crate::sink::LocalDirSink;
use crate::state::{RecoveryReport, ResumableStateStore};
use crate::types::{ItemId, RunSummary};

impl DownloadOrchestrator {
    /// Build an orchestrator with the reference collaborators
    ///
    /// - [`CliDownloader`] found on `PATH`
    /// - [`LocalDirSink`] writing to `download.output_dir`
    /// - [`HttpProxyListSource`] reading `proxy.list_url`
    /// - [`HttpHealthProbe`] when `probe.reference_url` is set, otherwise a
    ///   [`FetchHealthProbe`] downloading `probe.reference_item`
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid, the downloader binary is not
    /// installed, or the state database cannot be opened.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let downloader: Arc<dyn Downloader> = Arc::new(CliDownloader::from_path().ok_or_else(
            || Error::ExternalTool(format!("{} not found on PATH", DEFAULT_BINARY)),
        )?);

        let list_url = config
            .proxy
            .list_url
            .clone()
            .ok_or_else(|| Error::config("proxy_list_url", "is required"))?;
        let source = Arc::new(HttpProxyListSource::new(list_url)?.with_retry(config.retry.clone()));

        let probe: Arc<dyn HealthProbe> = match (&config.probe.reference_url, &config.probe.reference_item) {
            (Some(url), _) => Arc::new(
                HttpHealthProbe::new(url.clone(), config.probe.timeout, config.probe.max_bytes)
                    .with_expected_bytes(config.probe.expected_bytes),
            ),
            (None, Some(item)) => Arc::new(FetchHealthProbe::new(
                Arc::clone(&downloader),
                ItemId::new(item.clone())?,
                config.downloads_dir().join(".probe"),
                config.probe.timeout,
            )),
            (None, None) => {
                return Err(Error::config(
                    "probe_reference",
                    "a reference item or reference URL is required",
                ));
            }
        };

        let supervisor = Arc::new(ProxySupervisor::from_config(&config, source, probe));
        let store = Arc::new(ResumableStateStore::open(&config.database_path()).await?);
        let sink = Arc::new(LocalDirSink::new(config.download.output_dir.clone()));

        Ok(Self::new(config, supervisor, store, downloader, sink))
    }

    /// Recover persisted state and get the proxy pool ready
    ///
    /// 1. Resets records left in progress by an interrupted run
    /// 2. Restores the proxy health snapshot, if any
    /// 3. Refreshes the upstream list and probes until enough proxies are usable
    ///
    /// # Errors
    ///
    /// [`Error::NoHealthyProxy`] when not a single proxy passed its probe.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let report = self.store.recover().await?;

        match self.supervisor.load_snapshot().await {
            Ok(restored) if restored > 0 => {
                tracing::info!(restored, "Restored proxy health snapshot");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable proxy snapshot");
            }
        }

        let available = self
            .supervisor
            .ensure_ready(self.config.download.max_concurrent)
            .await;
        if available == 0 {
            return Err(Error::NoHealthyProxy);
        }
        tracing::info!(available, "Proxy pool ready");

        Ok(report)
    }

    /// Full lifecycle: start, run with background proxy maintenance, shut down
    ///
    /// # Errors
    ///
    /// Propagates startup and state store failures. A tripped breaker is not
    /// an error; check [`RunSummary::breaker_tripped`].
    pub async fn run_to_completion(
        &self,
        ids: &[ItemId],
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        if let Err(e) = self.start().await {
            self.shutdown().await.ok();
            return Err(e);
        }

        let maintenance_token = cancel.child_token();
        let maintenance = self.supervisor.start_maintenance(maintenance_token.clone());

        let result = self.run(ids, cancel).await;

        maintenance_token.cancel();
        if let Err(e) = maintenance.await {
            tracing::warn!(error = %e, "Proxy maintenance task ended abnormally");
        }

        let shutdown = self.shutdown().await;
        let summary = result?;
        shutdown?;
        Ok(summary)
    }

    /// Persist final state and stop the state writer
    ///
    /// Proxy health is snapshotted and a clean shutdown is recorded, so the
    /// next start knows no recovery was needed. Safe to call once per store.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating shutdown");

        if let Err(e) = self.supervisor.save_snapshot().await {
            tracing::error!(error = %e, "Failed to save proxy snapshot during shutdown");
        }

        self.store.shutdown().await?;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}
