//! Download orchestration, split into focused submodules.
//!
//! The [`DownloadOrchestrator`] and its methods are organized by concern:
//! - [`breaker`] - Run-level circuit breaker
//! - `task` - Per-task state machine (acquire, fetch, store, persist)
//! - `workers` - Bounded worker pool draining the pending queue
//! - `lifecycle` - Default wiring, startup and shutdown

pub mod breaker;
mod lifecycle;
mod task;
mod workers;


pub use breaker::CircuitBreaker;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::fetch::Downloader;
use crate::proxy::ProxySupervisor;
use crate::sink::StorageSink;
use crate::state::ResumableStateStore;
use crate::types::Event;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Schedules downloads across a bounded worker pool
///
/// Cheap to clone; clones share the supervisor, store, collaborators and
/// event channel.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    pub(crate) config: Arc<Config>,
    pub(crate) supervisor: Arc<ProxySupervisor>,
    pub(crate) store: Arc<ResumableStateStore>,
    pub(crate) downloader: Arc<dyn Downloader>,
    pub(crate) sink: Arc<dyn StorageSink>,
    pub(crate) event_tx: broadcast::Sender<Event>,
}

impl DownloadOrchestrator {
    /// Assemble an orchestrator from explicit collaborators
    ///
    /// See [`DownloadOrchestrator::from_config`] for the default wiring.
    pub fn new(
        config: Config,
        supervisor: Arc<ProxySupervisor>,
        store: Arc<ResumableStateStore>,
        downloader: Arc<dyn Downloader>,
        sink: Arc<dyn StorageSink>,
    ) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            supervisor,
            store,
            downloader,
            sink,
            event_tx,
        }
    }

    /// Subscribe to run events
    ///
    /// Slow subscribers lag and miss events rather than stall workers.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Proxy supervisor used by the workers
    pub fn supervisor(&self) -> &Arc<ProxySupervisor> {
        &self.supervisor
    }

    /// Resumable state store
    pub fn store(&self) -> &Arc<ResumableStateStore> {
        &self.store
    }
}
