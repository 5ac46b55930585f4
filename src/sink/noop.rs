//! Sink that leaves artifacts where the downloader put them

use super::traits::StorageSink;
use crate::error::SinkError;
use crate::fetch::{Artifact, ItemMetadata};
use crate::types::ItemId;
use async_trait::async_trait;

/// Sink for embedders that consume artifacts from the scratch directory themselves
pub struct NoOpSink;

#[async_trait]
impl StorageSink for NoOpSink {
    async fn store(
        &self,
        item: &ItemId,
        artifact: &Artifact,
        _metadata: &ItemMetadata,
    ) -> Result<(), SinkError> {
        tracing::debug!(item = %item, dir = %artifact.dir.display(), "Artifact left in place");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
