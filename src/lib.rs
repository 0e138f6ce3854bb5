//! # Crawl Control Plane
//!
//! The rate-limiting and fair-scheduling core of a distributed image-crawling
//! pipeline: a coordination-store-backed regulator that turns catalog size
//! into per-source request budgets and circuit-breaks distressed upstreams,
//! a fair scheduler that demultiplexes per-source work under a global
//! concurrency cap, and the rate-limited fetchers that consume those budgets.
//!
//! ## Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`store`] | Coordination store (C1): token buckets, halt sets, sliding status windows. |
//! | [`bus`] | Message bus (C2): inbound/per-source/outbound topics. |
//! | [`splitter`] | Source splitter (C3): demultiplexes the inbound topic per source. |
//! | [`regulator`] | Rate regulator (C4): catalog-driven rates, overrides, circuit breaking. |
//! | [`scheduler`] | Crawl scheduler (C5): fair per-source dispatch under a concurrency cap. |
//! | [`fetcher`] | Rate-limited fetcher (C6): token acquisition, HTTP GET, status recording. |
//! | [`logger`] | Structured logger (C7): periodic `monitoring_update` snapshots. |
//! | [`processor`] | Downstream processor contract and reference implementation. |
//!
//! Every control-plane component talks to [`store::CoordinationStore`] and
//! [`bus::MessageBus`] through trait objects, so the regulator/scheduler/
//! fetcher/splitter can all be exercised in tests against the in-memory fakes
//! in those modules rather than a live Redis/Kafka deployment.
//!
//! ## CLI
//!
//! ```bash
//! crawl-control-plane splitter
//! crawl-control-plane crawl-host
//! crawl-control-plane validate
//! ```

/// Configuration: tunables from the external interfaces table, layered
/// compiled-in defaults → environment variables → CLI overrides.
pub mod config;

/// Crate-wide error taxonomy and the catalog-client circuit breaker.
pub mod error;

/// Shared data types: sources, wire events, outcome codes, the catalog rate curve.
pub mod types;

/// Coordination store client trait plus Redis and in-memory implementations.
pub mod store;

/// Message bus client trait plus Kafka and in-memory implementations.
pub mod bus;

/// Source splitter (C3).
pub mod splitter;

/// Rate regulator (C4).
pub mod regulator;

/// Crawl scheduler (C5).
pub mod scheduler;

/// Rate-limited fetcher (C6).
pub mod fetcher;

/// Downstream processor contract and reference implementation (§4.6).
pub mod processor;

/// Structured logger (C7).
pub mod logger;

/// The crawl's own structured-event channel, distinct from ambient tracing.
pub mod telemetry;

/// Command-line interface and process wiring.
pub mod cli;

pub use bus::{BusMessage, MessageBus};
pub use cli::{Cli, CliRunner, Commands};
pub use config::Config;
pub use error::CrawlError;
pub use store::CoordinationStore;
pub use types::{OutcomeCode, Source};
