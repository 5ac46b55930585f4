//! Fetching items through a proxy
//!
//! The [`Downloader`] trait is the seam between the orchestrator and whatever
//! actually transfers media. [`CliDownloader`] drives an external yt-dlp
//! compatible binary; tests and embedders can plug in their own.

mod cli;
mod parser;
mod traits;

pub use cli::{CliDownloader, DEFAULT_BINARY, DEFAULT_URL_TEMPLATE};
pub use parser::classify_failure;
pub use traits::{Artifact, Downloader, INFO_SUFFIX, ItemMetadata};
