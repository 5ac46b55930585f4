//! Storage sink trait

use async_trait::async_trait;

use crate::error::SinkError;
use crate::fetch::{Artifact, ItemMetadata};
use crate::types::ItemId;

/// Final destination of fetched artifacts
///
/// Called once per successful fetch, before the item is marked complete. A
/// [`SinkError::Transient`] lets the orchestrator retry the whole attempt.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Persist the artifact of `item`
    async fn store(
        &self,
        item: &ItemId,
        artifact: &Artifact,
        metadata: &ItemMetadata,
    ) -> Result<(), SinkError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}
