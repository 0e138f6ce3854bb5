//! Shared data types for the crawl control plane: sources, wire events, and
//! the fixed vocabulary of outcome codes used across the coordination store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed constants from the external interface table. Not runtime-tunable.
pub const MIN_CRAWL_SIZE: f64 = 5_000.0;
pub const MAX_CRAWL_SIZE: f64 = 500_000_000.0;
pub const MIN_CRAWL_RPS: f64 = 0.2;
pub const MAX_CRAWL_RPS: f64 = 200.0;

pub const ERROR_WINDOW_THRESHOLD: f64 = 0.10;
pub const ERROR_WINDOW_MIN_SAMPLES: usize = 5;
pub const LAST_50_SIZE: usize = 50;

pub const WINDOW_60S_SECS: u64 = 60;
pub const WINDOW_1HR_SECS: u64 = 60 * 60;
pub const WINDOW_12HR_SECS: u64 = 12 * 60 * 60;

pub const REGULATOR_TICK: std::time::Duration = std::time::Duration::from_secs(1);
pub const OVERRIDE_CHECK_PERIOD: std::time::Duration = std::time::Duration::from_secs(10);
pub const CATALOG_REFRESH_PERIOD: std::time::Duration = std::time::Duration::from_secs(1800);
pub const SCHEDULER_PERIOD: std::time::Duration = std::time::Duration::from_secs(5);
pub const LOGGER_PERIOD: std::time::Duration = std::time::Duration::from_secs(5);

/// The reserved outcome code recorded when the downstream processor can't
/// decode a fetched payload as an image. Counts as an error for accounting
/// purposes but is "expected" for circuit-breaker classification.
pub const UNIDENTIFIED_IMAGE_ERROR: &str = "UnidentifiedImageError";

/// A case-normalized upstream content origin, e.g. `flickr`, `met`.
/// Construction always lower-cases the input so callers never hold a
/// source name in the wrong case by accident.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Source(String);

impl Source {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn urls_topic(&self) -> String {
        format!("{}_urls", self.0)
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Source {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Message on the unified inbound topic, produced externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundUrlEvent {
    pub source: String,
    pub uuid: Uuid,
    pub url: String,
}

/// Message on a per-source topic, produced by the splitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceUrlEvent {
    pub uuid: Uuid,
    pub url: String,
}

/// One message on the outbound metadata topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataEvent {
    Resolution {
        identifier: Uuid,
        height: u32,
        width: u32,
    },
    Exif {
        identifier: Uuid,
        exif: std::collections::HashMap<String, String>,
    },
}

/// A response outcome as recorded in the coordination store's sliding
/// windows: either a numeric HTTP status or the reserved decode-failure code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeCode {
    Status(u16),
    UnidentifiedImage,
}

impl OutcomeCode {
    /// True iff this outcome does not count toward circuit-breaker windows.
    /// The fixed expected set is `{200, 404, 301, UnidentifiedImageError}`.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            OutcomeCode::Status(200) | OutcomeCode::Status(404) | OutcomeCode::Status(301)
        ) || matches!(self, OutcomeCode::UnidentifiedImage)
    }

    /// True iff the outcome counts as a "success" for the global/per-source
    /// success counters (anything below 400, by the fetcher's own contract).
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeCode::Status(code) if *code < 400)
    }

    pub fn as_wire_str(&self) -> String {
        match self {
            OutcomeCode::Status(code) => code.to_string(),
            OutcomeCode::UnidentifiedImage => UNIDENTIFIED_IMAGE_ERROR.to_string(),
        }
    }

    /// Parses the textual form stored in the coordination store's windows
    /// and counters back into an `OutcomeCode`. A value that is neither the
    /// reserved literal nor a valid status number is mapped to a synthetic
    /// 599, mirroring how `CrawlError::outcome_code` handles connection-level
    /// failures that never produced a real HTTP status.
    pub fn parse(raw: &str) -> Self {
        if raw == UNIDENTIFIED_IMAGE_ERROR {
            OutcomeCode::UnidentifiedImage
        } else {
            OutcomeCode::Status(raw.parse::<u16>().unwrap_or(599))
        }
    }
}

impl std::fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire_str())
    }
}

/// Seconds since the Unix epoch, used as the score for sliding-window
/// entries. Not strictly monotonic across a leap-second or clock step, but
/// shared consistently across the splitter, regulator, and fetcher
/// processes, which a per-process `Instant` epoch would not be.
pub fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Maps a catalog image count to a target crawl rate by linear
/// interpolation between `(MIN_CRAWL_SIZE, MIN_CRAWL_RPS)` and
/// `(MAX_CRAWL_SIZE, MAX_CRAWL_RPS)`, clamped at both ends.
pub fn compute_crawl_rate(image_count: f64) -> f64 {
    if image_count <= MIN_CRAWL_SIZE {
        return MIN_CRAWL_RPS;
    }
    if image_count >= MAX_CRAWL_SIZE {
        return MAX_CRAWL_RPS;
    }

    let slope = (MAX_CRAWL_RPS - MIN_CRAWL_RPS) / (MAX_CRAWL_SIZE - MIN_CRAWL_SIZE);
    let rate = MIN_CRAWL_RPS + slope * (image_count - MIN_CRAWL_SIZE);
    rate.min(MAX_CRAWL_RPS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_normalizes_case() {
        assert_eq!(Source::new("FLICKR").as_str(), "flickr");
        assert_eq!(Source::new("flickr").urls_topic(), "flickr_urls");
    }

    #[test]
    fn expected_set_matches_spec() {
        assert!(OutcomeCode::Status(200).is_expected());
        assert!(OutcomeCode::Status(404).is_expected());
        assert!(OutcomeCode::Status(301).is_expected());
        assert!(OutcomeCode::UnidentifiedImage.is_expected());
        assert!(!OutcomeCode::Status(500).is_expected());
        assert!(!OutcomeCode::Status(403).is_expected());
    }

    #[test]
    fn unidentified_image_counts_as_error_not_success() {
        assert!(!OutcomeCode::UnidentifiedImage.is_success());
    }

    #[test]
    fn compute_crawl_rate_boundaries() {
        assert_eq!(compute_crawl_rate(1.0), MIN_CRAWL_RPS);
        assert_eq!(compute_crawl_rate(1_000_000_000.0), MAX_CRAWL_RPS);

        let mid = compute_crawl_rate(MAX_CRAWL_SIZE / 2.0);
        assert!((mid - MAX_CRAWL_RPS / 2.0).abs() <= 1.0);
    }

    #[test]
    fn compute_crawl_rate_is_monotonic() {
        let a = compute_crawl_rate(10_000.0);
        let b = compute_crawl_rate(20_000.0);
        assert!(b >= a);
    }

    #[test]
    fn outcome_code_wire_round_trip() {
        assert_eq!(OutcomeCode::parse("200"), OutcomeCode::Status(200));
        assert_eq!(
            OutcomeCode::parse(UNIDENTIFIED_IMAGE_ERROR),
            OutcomeCode::UnidentifiedImage
        );
        assert_eq!(OutcomeCode::parse("garbage"), OutcomeCode::Status(599));
    }
}
