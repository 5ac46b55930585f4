//! Sink that moves artifacts into a local output directory

use super::traits::StorageSink;
use crate::error::SinkError;
use crate::fetch::{Artifact, ItemMetadata};
use crate::types::ItemId;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Moves artifact files into `<output_dir>/<item>/` and removes the scratch directory
pub struct LocalDirSink {
    output_dir: PathBuf,
}

impl LocalDirSink {
    /// Create a sink rooted at `output_dir`
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Directory an item's files end up in
    pub fn item_dir(&self, item: &ItemId) -> PathBuf {
        self.output_dir.join(item.as_str())
    }
}

fn classify_io(context: &str, path: &Path, e: std::io::Error) -> SinkError {
    let msg = format!("{} {}: {}", context, path.display(), e);
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
            SinkError::Permanent(msg)
        }
        _ => SinkError::Transient(msg),
    }
}

/// Rename, falling back to copy + remove across filesystems
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(e),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

#[async_trait]
impl StorageSink for LocalDirSink {
    async fn store(
        &self,
        item: &ItemId,
        artifact: &Artifact,
        metadata: &ItemMetadata,
    ) -> Result<(), SinkError> {
        let dest = self.item_dir(item);
        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| classify_io("cannot create", &dest, e))?;

        for file in &artifact.files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let target = dest.join(name);
            move_file(file, &target)
                .await
                .map_err(|e| classify_io("cannot move", file, e))?;
        }

        // scratch dir is disposable; a leftover is only logged
        if let Err(e) = tokio::fs::remove_dir_all(&artifact.dir).await
            && e.kind() != ErrorKind::NotFound
        {
            tracing::warn!(item = %item, dir = %artifact.dir.display(), error = %e, "Failed to remove scratch directory");
        }

        tracing::info!(
            item = %item,
            files = artifact.files.len(),
            bytes = artifact.bytes,
            title = metadata.title.as_deref().unwrap_or(""),
            dest = %dest.display(),
            "Stored artifact"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local-dir"
    }
}
