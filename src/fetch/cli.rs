//! CLI-based downloader using an external yt-dlp compatible binary

use super::parser::classify_failure;
use super::traits::{Artifact, Downloader};
use crate::error::FetchError;
use crate::proxy::ProxyEndpoint;
use crate::types::{FormatConstraints, ItemId, MediaSelection};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Default binary searched for in PATH
pub const DEFAULT_BINARY: &str = "yt-dlp";

/// Default item URL; `{id}` is replaced by the item ID
pub const DEFAULT_URL_TEMPLATE: &str = "https://www.youtube.com/watch?v={id}";

/// Downloader that shells out to an external binary
///
/// Each fetch runs one process with the proxy, a format selector derived from
/// the constraints, and an output template inside the destination directory.
/// The process is killed when the returned future is dropped, so an
/// attempt timeout applied by the caller also ends the transfer.
///
/// # Examples
///
/// ```no_run
/// use bulkfetch::fetch::{CliDownloader, Downloader};
///
/// let downloader = CliDownloader::from_path().expect("yt-dlp not found in PATH");
/// assert_eq!(downloader.name(), "cli-yt-dlp");
/// ```
pub struct CliDownloader {
    binary_path: PathBuf,
    url_template: String,
    extra_args: Vec<String>,
}

impl CliDownloader {
    /// Create a downloader with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            binary_path,
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            extra_args: Vec::new(),
        }
    }

    /// Attempt to find the default binary in PATH
    ///
    /// Uses the `which` crate; returns `None` when it is not installed.
    pub fn from_path() -> Option<Self> {
        which::which(DEFAULT_BINARY).ok().map(Self::new)
    }

    /// Override the item URL template (`{id}` placeholder)
    pub fn with_url_template(mut self, template: impl Into<String>) -> Self {
        self.url_template = template.into();
        self
    }

    /// Extra arguments passed before the item URL
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Item URL for an ID
    pub fn item_url(&self, item: &ItemId) -> String {
        self.url_template.replace("{id}", item.as_str())
    }

    /// Full argument list for one fetch
    pub fn build_args(
        &self,
        item: &ItemId,
        proxy: &ProxyEndpoint,
        constraints: &FormatConstraints,
        dest_dir: &Path,
    ) -> Vec<String> {
        let template = dest_dir.join("%(id)s.%(ext)s");
        let mut args = vec![
            "--proxy".to_string(),
            proxy.url(),
            "--format".to_string(),
            constraints.format_selector(),
            "--output".to_string(),
            template.to_string_lossy().into_owned(),
            "--write-info-json".to_string(),
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "--no-warnings".to_string(),
            // retries are the orchestrator's job, with a fresh proxy each time
            "--retries".to_string(),
            "0".to_string(),
        ];
        if constraints.selection == MediaSelection::VideoAndAudio {
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push("--".to_string());
        args.push(self.item_url(item));
        args
    }
}

#[async_trait]
impl Downloader for CliDownloader {
    async fn fetch(
        &self,
        item: &ItemId,
        proxy: &ProxyEndpoint,
        constraints: &FormatConstraints,
        dest_dir: &Path,
    ) -> Result<Artifact, FetchError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| FetchError::Tool(format!("cannot create {}: {}", dest_dir.display(), e)))?;

        let args = self.build_args(item, proxy, constraints, dest_dir);
        tracing::debug!(item = %item, proxy = %proxy, binary = %self.binary_path.display(), "Starting downloader");

        let output = Command::new(&self.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                FetchError::Tool(format!(
                    "failed to execute {}: {}",
                    self.binary_path.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let err = classify_failure(&output.stderr);
            tracing::debug!(item = %item, proxy = %proxy, status = ?output.status.code(), error = %err, "Downloader failed");
            return Err(err);
        }

        Artifact::collect(dest_dir).await
    }

    fn name(&self) -> &'static str {
        "cli-yt-dlp"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyScheme;
    use crate::types::Resolution;

    fn item() -> ItemId {
        ItemId::new("dQw4w9WgXcQ").unwrap()
    }

    #[test]
    fn args_carry_proxy_format_and_output() {
        let downloader = CliDownloader::new(PathBuf::from("/usr/bin/yt-dlp"));
        let proxy = ProxyEndpoint::new(ProxyScheme::Socks5, "10.0.0.1", 1080);
        let constraints = FormatConstraints {
            max_resolution: Resolution::P720,
            selection: MediaSelection::VideoAndAudio,
        };
        let args = downloader.build_args(&item(), &proxy, &constraints, Path::new("/tmp/work/x"));

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--proxy") + 1], "socks5://10.0.0.1:1080");
        assert_eq!(args[pos("--format") + 1], constraints.format_selector());
        assert_eq!(args[pos("--output") + 1], "/tmp/work/x/%(id)s.%(ext)s");
        assert_eq!(args[pos("--merge-output-format") + 1], "mp4");
        assert_eq!(
            args.last().unwrap(),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert_eq!(args[args.len() - 2], "--");
    }

    #[test]
    fn audio_only_skips_merge_and_template_is_configurable() {
        let downloader = CliDownloader::new(PathBuf::from("yt-dlp"))
            .with_url_template("https://media.example.com/{id}")
            .with_extra_args(vec!["--limit-rate".into(), "5M".into()]);
        let proxy = ProxyEndpoint::new(ProxyScheme::Http, "p", 3128);
        let constraints = FormatConstraints {
            max_resolution: Resolution::P360,
            selection: MediaSelection::AudioOnly,
        };
        let args = downloader.build_args(&item(), &proxy, &constraints, Path::new("/d"));
        assert!(!args.iter().any(|a| a == "--merge-output-format"));
        assert!(args.iter().any(|a| a == "--limit-rate"));
        assert_eq!(args.last().unwrap(), "https://media.example.com/dQw4w9WgXcQ");
    }

    #[test]
    fn from_path_consistent_with_which() {
        assert_eq!(
            which::which(DEFAULT_BINARY).is_ok(),
            CliDownloader::from_path().is_some()
        );
    }

    #[tokio::test]
    async fn missing_binary_is_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = CliDownloader::new(PathBuf::from("/nonexistent/bulkfetch-downloader-xyz"));
        let proxy = ProxyEndpoint::new(ProxyScheme::Http, "127.0.0.1", 9);
        let err = downloader
            .fetch(&item(), &proxy, &FormatConstraints::smallest(), &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Tool(_)));
    }
}
