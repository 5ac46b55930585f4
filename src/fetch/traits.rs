//! Traits and types for fetching items through a proxy

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::FetchError;
use crate::proxy::ProxyEndpoint;
use crate::types::{FormatConstraints, ItemId};

/// Suffix of the metadata sidecar written next to the media files
pub const INFO_SUFFIX: &str = ".info.json";

/// Descriptive metadata of a fetched item
///
/// Taken from the `<id>.info.json` sidecar when the downloader writes one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Item title
    #[serde(default)]
    pub title: Option<String>,
    /// Owning channel
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Duration in seconds
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Files produced by one successful fetch
#[must_use]
#[derive(Clone, Debug)]
pub struct Artifact {
    /// Directory holding the files
    pub dir: PathBuf,
    /// Produced files, sorted by name
    pub files: Vec<PathBuf>,
    /// Total size in bytes
    pub bytes: u64,
    /// Metadata read from the sidecar, if any
    pub metadata: ItemMetadata,
}

impl Artifact {
    /// Collect every regular file in `dir` into an artifact
    ///
    /// Fails with [`FetchError::Tool`] when the directory is missing or holds
    /// no media file besides the metadata sidecar.
    pub async fn collect(dir: &Path) -> Result<Self, FetchError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| FetchError::Tool(format!("cannot read {}: {}", dir.display(), e)))?;

        let mut files = Vec::new();
        let mut bytes = 0u64;
        let mut metadata = ItemMetadata::default();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FetchError::Tool(e.to_string()))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| FetchError::Tool(e.to_string()))?;
            if !meta.is_file() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            // partial downloads left behind by an earlier attempt
            if name.ends_with(".part") || name.ends_with(".ytdl") {
                continue;
            }
            if name.ends_with(INFO_SUFFIX) {
                match tokio::fs::read(&path).await {
                    Ok(raw) => match serde_json::from_slice::<ItemMetadata>(&raw) {
                        Ok(m) => metadata = m,
                        Err(e) => {
                            tracing::debug!(file = %path.display(), error = %e, "Unreadable metadata sidecar")
                        }
                    },
                    Err(e) => tracing::debug!(file = %path.display(), error = %e, "Cannot read metadata sidecar"),
                }
            }
            bytes += meta.len();
            files.push(path);
        }

        files.sort();

        let has_media = files.iter().any(|f| {
            !f.to_string_lossy().ends_with(INFO_SUFFIX)
        });
        if !has_media {
            return Err(FetchError::Tool(format!(
                "no media file produced in {}",
                dir.display()
            )));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            bytes,
            metadata,
        })
    }
}

/// Media-fetch operation: item ID plus proxy to local artifact
///
/// Implementations must convert every transport or tool failure into a
/// [`FetchError`] so that the caller can classify it without inspecting raw
/// errors.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `item` through `proxy` into `dest_dir`
    ///
    /// # Errors
    ///
    /// Returns a classified [`FetchError`]; transfer problems are retryable,
    /// problems with the item itself are not.
    async fn fetch(
        &self,
        item: &ItemId,
        proxy: &ProxyEndpoint,
        constraints: &FormatConstraints,
        dest_dir: &Path,
    ) -> Result<Artifact, FetchError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}
