//! Classification of external downloader output

use crate::error::FetchError;
use std::str;

/// Markers of failures caused by the item itself; checked first
const RESTRICTED_MARKERS: &[&str] = &[
    "private video",
    "video is private",
    "members-only",
    "join this channel",
    "confirm your age",
    "age-restricted",
    "not available in your country",
    "removed by the uploader",
    "account associated with this video has been terminated",
    "copyright claim",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "video unavailable",
    "does not exist",
    "http error 404",
    "no video formats found",
];

const MALFORMED_MARKERS: &[&str] = &[
    "incomplete youtube id",
    "is not a valid url",
    "unsupported url",
];

/// Markers that blame the proxy; anti-bot walls count since another exit IP
/// usually gets through
const PROXY_MARKERS: &[&str] = &[
    "proxyerror",
    "unable to connect to proxy",
    "tunnel connection failed",
    "http error 407",
    "sign in to confirm you're not a bot",
    "sign in to confirm you’re not a bot",
    "http error 429",
    "http error 403",
    "socks",
];

const NETWORK_MARKERS: &[&str] = &[
    "timed out",
    "connection reset",
    "connection refused",
    "connection aborted",
    "temporary failure in name resolution",
    "name or service not known",
    "remote end closed connection",
    "incompleteread",
    "http error 5",
    "eof occurred",
    "ssl",
];

const TOOL_MARKERS: &[&str] = &[
    "requested format is not available",
    "ffmpeg",
    "no space left on device",
    "permission denied",
];

/// Classify a failed downloader run from its stderr
///
/// Item-level markers win over transport markers, so an unavailable item is
/// never retried even when the message also mentions the network. Output that
/// matches nothing is treated as a transient network failure.
pub fn classify_failure(stderr: &[u8]) -> FetchError {
    let text = str::from_utf8(stderr).unwrap_or_default();
    let detail = last_error_line(text);
    let lower = text.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(RESTRICTED_MARKERS) {
        FetchError::Restricted(detail)
    } else if has(MALFORMED_MARKERS) {
        FetchError::MalformedId(detail)
    } else if has(NOT_FOUND_MARKERS) {
        FetchError::NotFound(detail)
    } else if has(TOOL_MARKERS) {
        FetchError::Tool(detail)
    } else if has(PROXY_MARKERS) {
        FetchError::Proxy(detail)
    } else if has(NETWORK_MARKERS) {
        FetchError::Network(detail)
    } else if detail.is_empty() {
        FetchError::Network("downloader exited without output".to_string())
    } else {
        FetchError::Network(detail)
    }
}

/// Last line starting with `ERROR:`, or the last non-empty line
fn last_error_line(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|l| l.trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_default()
}
