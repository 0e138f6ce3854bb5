//! Structured logger (C7): periodically aggregates coordination-store
//! counters and windows into one JSON `monitoring_update` document. This is
//! the crawl's own telemetry product, distinct from ambient tracing
//! diagnostics (§10.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::CrawlError;
use crate::store::{CoordinationStore, CumulativeCounters};
use crate::telemetry;
use crate::types::{now_seconds, Source};

#[derive(Debug, Serialize)]
struct GeneralBlock {
    resize_rate: f64,
    error_rate: f64,
    split_rate: f64,
    halted: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SourceBlock {
    successes: i64,
    errors: i64,
    last_50: Vec<String>,
    rate_limit: f64,
}

#[derive(Debug, Serialize)]
struct MonitoringUpdate {
    event: &'static str,
    timestamp: f64,
    general: GeneralBlock,
    specific: HashMap<String, SourceBlock>,
}

/// The per-source target rates the logger reports under `rate_limit`. The
/// regulator owns computing these; the logger only reads a snapshot, so it
/// never races the regulator's own writes to the coordination store.
pub type RateSnapshot = Arc<tokio::sync::RwLock<HashMap<Source, f64>>>;

pub struct StructuredLogger {
    store: Arc<dyn CoordinationStore>,
    rates: RateSnapshot,
    previous: CumulativeCounters,
    interval: Duration,
}

impl StructuredLogger {
    pub fn new(store: Arc<dyn CoordinationStore>, rates: RateSnapshot, interval: Duration) -> Self {
        Self {
            store,
            rates,
            previous: CumulativeCounters::default(),
            interval,
        }
    }

    pub async fn run(&mut self) -> Result<(), CrawlError> {
        loop {
            self.tick().await?;
            tokio::time::sleep(self.interval).await;
        }
    }

    pub async fn tick(&mut self) -> Result<(), CrawlError> {
        let now = now_seconds();
        let current = self.store.counters().await?;
        let elapsed = self.interval.as_secs_f64().max(1.0);

        let general = GeneralBlock {
            resize_rate: (current.num_resized - self.previous.num_resized) as f64 / elapsed,
            error_rate: (current.resize_errors - self.previous.resize_errors) as f64 / elapsed,
            split_rate: (current.num_split - self.previous.num_split) as f64 / elapsed,
            halted: self
                .store
                .halted()
                .await?
                .into_iter()
                .map(|s| s.to_string())
                .collect(),
        };

        let rates = self.rates.read().await.clone();
        let mut specific = HashMap::new();
        for (source, rate) in &rates {
            let counters = self.store.source_counters(source).await?;
            if counters.successes <= 0 {
                continue;
            }
            let last_50 = self
                .store
                .last_50(source)
                .await?
                .iter()
                .map(|o| o.as_wire_str())
                .collect();
            specific.insert(
                source.to_string(),
                SourceBlock {
                    successes: counters.successes,
                    errors: counters.errors,
                    last_50,
                    rate_limit: *rate,
                },
            );
        }

        telemetry::emit(&MonitoringUpdate {
            event: "monitoring_update",
            timestamp: now,
            general,
            specific,
        });

        self.previous = current;
        Ok(())
    }
}
