//! Configuration management: every tunable in the external interfaces
//! table, layered compiled-in defaults → environment variables → CLI
//! overrides, validated once before any control loop starts.

use serde::{Deserialize, Serialize};

use crate::error::CrawlError;
use crate::types::{MAX_CRAWL_RPS, MIN_CRAWL_RPS};

/// Target thumbnail bounding box, read from `TARGET_RESOLUTION` as
/// `{width}x{height}`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl std::str::FromStr for Resolution {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s.split_once('x').ok_or_else(|| {
            CrawlError::Configuration(format!("TARGET_RESOLUTION must be WIDTHxHEIGHT, got {s:?}"))
        })?;
        let width = w
            .parse()
            .map_err(|_| CrawlError::Configuration(format!("invalid resolution width: {w:?}")))?;
        let height = h
            .parse()
            .map_err(|_| CrawlError::Configuration(format!("invalid resolution height: {h:?}")))?;
        Ok(Self { width, height })
    }
}

/// All tunables in the external interfaces table (§6), plus a handful of
/// operator conveniences (verbosity, catalog endpoint) that have no
/// environment-variable home in that table but need to live somewhere.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// `REDIS_HOST` — coordination-store endpoint.
    pub redis_host: String,

    /// `KAFKA_HOSTS` — comma-separated message-bus bootstrap servers.
    pub kafka_hosts: String,

    /// `ZOOKEEPER_HOST` — retained for deployments whose Kafka cluster still
    /// depends on it; unused by the bus client itself, which talks to
    /// brokers directly.
    pub zookeeper_host: Option<String>,

    /// `MAX_TASKS` — global concurrency cap and scheduler share divisor.
    /// Defaults to 3,000, matching the cap described in §5.
    pub max_tasks: usize,

    /// `SCHEDULE_SIZE` — reserved for deployments that want to decouple the
    /// scheduler's per-pass drain size from `max_tasks`; the scheduler's
    /// share computation in this crate derives its budget from `max_tasks`
    /// directly, so this is carried through for compatibility with the
    /// tunables table but not separately consumed yet.
    pub schedule_size: usize,

    /// `LOG_FREQUENCY_SECONDS` — structured-logger interval.
    pub log_frequency_seconds: u64,

    /// `TARGET_RESOLUTION` — thumbnail bounding box.
    pub target_resolution: Resolution,

    /// Catalog API endpoint the regulator polls for source image counts.
    /// Not in the environment tunables table but has no sensible compiled
    /// default, so it is required at the CLI/env layer in practice.
    pub catalog_sources_url: String,

    /// Directory the reference downstream processor writes thumbnails to.
    pub thumbnail_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_host: "127.0.0.1:6379".to_string(),
            kafka_hosts: "127.0.0.1:9092".to_string(),
            zookeeper_host: None,
            max_tasks: 3_000,
            schedule_size: 3_000,
            log_frequency_seconds: 5,
            target_resolution: Resolution::default(),
            catalog_sources_url: "http://localhost:8080/sources".to_string(),
            thumbnail_dir: "./thumbnails".to_string(),
        }
    }
}

impl Config {
    /// Layers environment variables over the compiled-in defaults. CLI
    /// overrides are applied afterward by the caller (`cli::load_config`),
    /// since they come from `clap` rather than `std::env`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("REDIS_HOST") {
            config.redis_host = v;
        }
        if let Ok(v) = std::env::var("KAFKA_HOSTS") {
            config.kafka_hosts = v;
        }
        if let Ok(v) = std::env::var("ZOOKEEPER_HOST") {
            config.zookeeper_host = Some(v);
        }
        if let Ok(v) = std::env::var("MAX_TASKS") {
            if let Ok(parsed) = v.parse() {
                config.max_tasks = parsed;
            }
        }
        if let Ok(v) = std::env::var("SCHEDULE_SIZE") {
            if let Ok(parsed) = v.parse() {
                config.schedule_size = parsed;
            }
        }
        if let Ok(v) = std::env::var("LOG_FREQUENCY_SECONDS") {
            if let Ok(parsed) = v.parse() {
                config.log_frequency_seconds = parsed;
            }
        }
        if let Ok(v) = std::env::var("TARGET_RESOLUTION") {
            if let Ok(parsed) = v.parse() {
                config.target_resolution = parsed;
            }
        }

        config
    }

    /// Rejects non-positive `max_tasks`/`schedule_size`, a zero-dimension
    /// target resolution, and empty store/bus endpoints, per §10.1. Called
    /// once at startup, before any control loop begins.
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.max_tasks == 0 {
            return Err(CrawlError::Configuration(
                "max_tasks must be positive".to_string(),
            ));
        }
        if self.schedule_size == 0 {
            return Err(CrawlError::Configuration(
                "schedule_size must be positive".to_string(),
            ));
        }
        if self.target_resolution.width == 0 || self.target_resolution.height == 0 {
            return Err(CrawlError::Configuration(
                "target_resolution must have non-zero width and height".to_string(),
            ));
        }
        if self.redis_host.trim().is_empty() {
            return Err(CrawlError::Configuration(
                "redis_host must not be empty".to_string(),
            ));
        }
        if self.kafka_hosts.trim().is_empty() {
            return Err(CrawlError::Configuration(
                "kafka_hosts must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sanity bounds the catalog rate curve must respect regardless of
/// deployment-specific tuning; used by validation in tests and by the
/// benchmark suite to generate representative inputs.
pub const RATE_RANGE: std::ops::RangeInclusive<f64> = MIN_CRAWL_RPS..=MAX_CRAWL_RPS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_max_tasks_fails_validation() {
        let mut config = Config::default();
        config.max_tasks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_dimension_resolution_fails_validation() {
        let mut config = Config::default();
        config.target_resolution = Resolution { width: 0, height: 480 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_redis_host_fails_validation() {
        let mut config = Config::default();
        config.redis_host = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolution_parses_widthxheight() {
        let r: Resolution = "1280x720".parse().unwrap();
        assert_eq!(r.width, 1280);
        assert_eq!(r.height, 720);
    }

    #[test]
    fn resolution_rejects_malformed_input() {
        assert!("1280".parse::<Resolution>().is_err());
        assert!("widex720".parse::<Resolution>().is_err());
    }
}
