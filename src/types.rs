//! Core types for bulkfetch

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::FailureClass;
use crate::proxy::ProxyEndpoint;

/// Identifier of an item to download
///
/// IDs are opaque to the orchestrator. They are used as database keys and as
/// directory names, so path separators and whitespace are rejected.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Create an ItemId, rejecting values unusable as a key or directory name
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty()
            || trimmed.len() != id.len()
            || id
                .chars()
                .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c.is_control())
            || id == "."
            || id == ".."
        {
            return Err(crate::Error::InvalidItemId(id));
        }
        Ok(Self(id))
    }

    /// Borrow the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Maximum vertical resolution for video downloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resolution {
    /// 360 lines
    P360,
    /// 480 lines
    P480,
    /// 720 lines
    P720,
    /// 1080 lines
    #[default]
    P1080,
    /// 2160 lines
    Uhd4k,
}

impl Resolution {
    /// All resolutions, highest first
    pub const ALL: [Resolution; 5] = [
        Resolution::Uhd4k,
        Resolution::P1080,
        Resolution::P720,
        Resolution::P480,
        Resolution::P360,
    ];

    /// Height in pixels
    pub fn height(&self) -> u32 {
        match self {
            Resolution::P360 => 360,
            Resolution::P480 => 480,
            Resolution::P720 => 720,
            Resolution::P1080 => 1080,
            Resolution::Uhd4k => 2160,
        }
    }

    /// Closest resolution that does not exceed `height` (360p when nothing fits)
    pub fn from_height(height: u32) -> Self {
        Self::ALL
            .into_iter()
            .find(|r| height >= r.height())
            .unwrap_or(Resolution::P360)
    }

    /// Label used in configuration ("4K", "1080p", ...)
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::P360 => "360p",
            Resolution::P480 => "480p",
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::Uhd4k => "4K",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Resolution {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|r| r.label().to_ascii_lowercase() == normalized)
            .or(match normalized.as_str() {
                "2160p" | "uhd" => Some(Resolution::Uhd4k),
                _ => None,
            })
            .ok_or_else(|| {
                crate::Error::config("resolution", format!("unknown resolution '{}'", s))
            })
    }
}

impl Serialize for Resolution {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which streams to fetch for an item
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSelection {
    /// Video and audio merged into one artifact
    #[default]
    VideoAndAudio,
    /// Video stream only
    VideoOnly,
    /// Audio stream only
    AudioOnly,
}

impl MediaSelection {
    /// Build a selection from the two CLI-style toggles; `None` if both are off
    pub fn from_flags(video: bool, audio: bool) -> Option<Self> {
        match (video, audio) {
            (true, true) => Some(MediaSelection::VideoAndAudio),
            (true, false) => Some(MediaSelection::VideoOnly),
            (false, true) => Some(MediaSelection::AudioOnly),
            (false, false) => None,
        }
    }
}

/// Format constraints passed to the downloader for every task
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatConstraints {
    /// Maximum video resolution
    #[serde(default)]
    pub max_resolution: Resolution,
    /// Streams to fetch
    #[serde(default)]
    pub selection: MediaSelection,
}

impl FormatConstraints {
    /// Cheapest constraints, used for health probes
    pub fn smallest() -> Self {
        Self {
            max_resolution: Resolution::P360,
            selection: MediaSelection::AudioOnly,
        }
    }

    /// Render a yt-dlp style format selector
    pub fn format_selector(&self) -> String {
        let h = self.max_resolution.height();
        match self.selection {
            MediaSelection::VideoAndAudio => {
                format!("bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]")
            }
            MediaSelection::VideoOnly => format!("bestvideo[height<={h}][ext=mp4]"),
            MediaSelection::AudioOnly => "bestaudio[ext=m4a]".to_string(),
        }
    }
}

/// One unit of work: an item plus where and how to fetch it
///
/// Immutable once created; dropped when the task reaches a terminal state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadTask {
    /// Item being downloaded
    pub item: ItemId,
    /// Scratch directory the downloader writes into
    pub target_dir: PathBuf,
    /// Format constraints
    pub constraints: FormatConstraints,
}

/// Per-task lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the queue
    Pending,
    /// Waiting for a proxy
    AcquiringProxy,
    /// Transfer in progress
    Downloading,
    /// Previous attempt failed transiently, another will follow
    Retrying,
    /// Terminal success
    Succeeded,
    /// Terminal failure
    Failed,
}

/// Outcome of a single attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Downloaded and stored
    Success,
    /// Failed; `class` decides whether the task tries again
    Failed {
        /// How the failure is handled
        class: FailureClass,
        /// Error detail
        error: String,
    },
}

/// Bookkeeping for one try of a task against one proxy
#[derive(Clone, Debug)]
pub struct DownloadAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    /// Proxy the attempt was routed through; `None` when none could be leased
    pub proxy: Option<ProxyEndpoint>,
    /// What happened
    pub outcome: AttemptOutcome,
    /// Wall-clock duration of the attempt
    pub elapsed: Duration,
}

/// Durable status of an item in the resumable state store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Not yet attempted (or reset after an interrupted run)
    Pending,
    /// A worker owns the item right now
    InProgress,
    /// Downloaded and stored; terminal
    Complete,
    /// Gave up; may be retried by a later run
    Failed,
}

impl RecordStatus {
    /// Convert integer status code to RecordStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => RecordStatus::Pending,
            1 => RecordStatus::InProgress,
            2 => RecordStatus::Complete,
            3 => RecordStatus::Failed,
            _ => RecordStatus::Pending, // unknown codes are retried rather than trusted
        }
    }

    /// Convert RecordStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            RecordStatus::Pending => 0,
            RecordStatus::InProgress => 1,
            RecordStatus::Complete => 2,
            RecordStatus::Failed => 3,
        }
    }
}

/// Event emitted during a run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Run started
    RunStarted {
        /// IDs in the input list
        total: usize,
        /// IDs skipped because they were already complete
        already_complete: usize,
        /// IDs scheduled in this run
        scheduled: usize,
    },

    /// Task changed state
    TaskState {
        /// Item
        item: ItemId,
        /// New state
        state: TaskState,
    },

    /// An attempt failed
    AttemptFailed {
        /// Item
        item: ItemId,
        /// 1-based attempt number
        attempt: u32,
        /// Proxy used, as `scheme://host:port`; `None` when none could be leased
        proxy: Option<String>,
        /// Error detail
        error: String,
        /// Whether another attempt will follow
        will_retry: bool,
    },

    /// Item downloaded and stored
    TaskCompleted {
        /// Item
        item: ItemId,
        /// Attempts used
        attempts: u32,
    },

    /// Item failed permanently for this run
    TaskFailed {
        /// Item
        item: ItemId,
        /// Attempts used
        attempts: u32,
        /// Error summary
        error: String,
    },

    /// Circuit breaker tripped; no new tasks will start
    BreakerTripped {
        /// Consecutive task failures at the time of tripping
        consecutive_failures: u32,
    },

    /// Run finished
    RunFinished {
        /// Final counters
        summary: RunSummary,
    },
}

/// Final counters of a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// IDs in the input list
    pub total: usize,
    /// IDs that were already complete before the run
    pub already_complete: usize,
    /// IDs completed in this run
    pub completed: usize,
    /// IDs that failed in this run
    pub failed: usize,
    /// IDs never reached (breaker or cancellation)
    pub pending: usize,
    /// Whether the circuit breaker ended the run
    pub breaker_tripped: bool,
    /// Whether the run was cancelled externally
    pub cancelled: bool,
}

impl RunSummary {
    /// Process exit status for a front end: non-zero when the breaker tripped
    pub fn exit_code(&self) -> i32 {
        if self.breaker_tripped { 1 } else { 0 }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_rejects_unsafe_values() {
        assert!(ItemId::new("dQw4w9WgXcQ").is_ok());
        for bad in ["", "  ", " abc", "a/b", "a\\b", "..", "a b", "x\n"] {
            assert!(ItemId::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn resolution_from_height_picks_closest_not_exceeding() {
        assert_eq!(Resolution::from_height(2160), Resolution::Uhd4k);
        assert_eq!(Resolution::from_height(1440), Resolution::P1080);
        assert_eq!(Resolution::from_height(720), Resolution::P720);
        assert_eq!(Resolution::from_height(500), Resolution::P480);
        assert_eq!(Resolution::from_height(144), Resolution::P360);
    }

    #[test]
    fn resolution_parses_labels_case_insensitively() {
        assert_eq!("4k".parse::<Resolution>().unwrap(), Resolution::Uhd4k);
        assert_eq!("1080P".parse::<Resolution>().unwrap(), Resolution::P1080);
        assert_eq!("2160p".parse::<Resolution>().unwrap(), Resolution::Uhd4k);
        assert!("999p".parse::<Resolution>().is_err());
    }

    #[test]
    fn resolution_serializes_as_label() {
        let json = serde_json::to_string(&Resolution::P720).unwrap();
        assert_eq!(json, "\"720p\"");
        let back: Resolution = serde_json::from_str("\"4K\"").unwrap();
        assert_eq!(back, Resolution::Uhd4k);
    }

    #[test]
    fn format_selector_follows_selection() {
        let mut c = FormatConstraints {
            max_resolution: Resolution::P720,
            selection: MediaSelection::VideoAndAudio,
        };
        assert_eq!(
            c.format_selector(),
            "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]"
        );
        c.selection = MediaSelection::VideoOnly;
        assert_eq!(c.format_selector(), "bestvideo[height<=720][ext=mp4]");
        c.selection = MediaSelection::AudioOnly;
        assert_eq!(c.format_selector(), "bestaudio[ext=m4a]");
    }

    #[test]
    fn media_selection_from_flags() {
        assert_eq!(
            MediaSelection::from_flags(true, true),
            Some(MediaSelection::VideoAndAudio)
        );
        assert_eq!(MediaSelection::from_flags(false, false), None);
    }

    #[test]
    fn record_status_roundtrips_and_unknown_is_pending() {
        for s in [
            RecordStatus::Pending,
            RecordStatus::InProgress,
            RecordStatus::Complete,
            RecordStatus::Failed,
        ] {
            assert_eq!(RecordStatus::from_i32(s.to_i32()), s);
        }
        assert_eq!(RecordStatus::from_i32(42), RecordStatus::Pending);
    }

    #[test]
    fn exit_code_reflects_breaker() {
        let mut s = RunSummary::default();
        assert_eq!(s.exit_code(), 0);
        s.breaker_tripped = true;
        assert_eq!(s.exit_code(), 1);
    }
}
