//! Rate regulator (C4): recomputes per-source target rates from catalog
//! size, merges operator overrides, watches status windows for distress,
//! and writes token allotments and halt flags back to the coordination
//! store. The largest and most stateful of the control-plane components;
//! everything it owns in-memory (rate table, deferred-refill deadlines) is
//! private to one regulator instance (§9's single-regulator assumption).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{CircuitBreaker, CrawlError};
use crate::store::CoordinationStore;
use crate::telemetry;
use crate::types::{
    compute_crawl_rate, now_seconds, OutcomeCode, Source, CATALOG_REFRESH_PERIOD,
    ERROR_WINDOW_MIN_SAMPLES, ERROR_WINDOW_THRESHOLD, LAST_50_SIZE, OVERRIDE_CHECK_PERIOD,
    REGULATOR_TICK,
};

/// One row of the catalog API's sources listing.
#[derive(Debug, Clone)]
pub struct CatalogSourceCount {
    pub source: Source,
    pub image_count: f64,
}

/// The regulator's view of the external catalog API. Implementations may
/// wrap their own retry/circuit-breaking policy; the regulator itself only
/// distinguishes success from failure (on failure it retains the previous
/// rate table, per §4.2).
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn fetch_sources(&self) -> Result<Vec<CatalogSourceCount>, CrawlError>;
}

/// `CatalogClient` backed by a real HTTP endpoint, with a circuit breaker
/// shielding the regulator tick from a catalog API that is down but still
/// accepting (and slowly timing out) connections.
pub struct HttpCatalogClient {
    client: reqwest::Client,
    sources_url: String,
    breaker: CircuitBreaker,
}

#[derive(Debug, serde::Deserialize)]
struct CatalogApiEntry {
    source_name: String,
    image_count: f64,
}

impl HttpCatalogClient {
    pub fn new(sources_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            sources_url: sources_url.into(),
            breaker: CircuitBreaker::new(5, Duration::from_secs(60)),
        }
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn fetch_sources(&self) -> Result<Vec<CatalogSourceCount>, CrawlError> {
        if !self.breaker.can_execute() {
            return Err(CrawlError::Configuration(format!(
                "catalog circuit open for {}",
                self.sources_url
            )));
        }

        let result = async {
            let response = self.client.get(&self.sources_url).send().await?;
            let response = response.error_for_status()?;
            response.json::<Vec<CatalogApiEntry>>().await
        }
        .await;

        match result {
            Ok(entries) => {
                self.breaker.record_success();
                Ok(entries
                    .into_iter()
                    .map(|e| CatalogSourceCount {
                        source: Source::new(e.source_name),
                        image_count: e.image_count,
                    })
                    .collect())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(CrawlError::Fetch {
                    url: self.sources_url.clone(),
                    source: e,
                })
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct CrawlHaltedEvent {
    event: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    source: String,
    timestamp: f64,
}

/// Per-source deferred-refill bookkeeping for `rate(source) < 1`: the next
/// instant at which a single token should be issued.
#[derive(Default)]
struct DeferredRefill {
    deadlines: HashMap<Source, Instant>,
}

impl DeferredRefill {
    /// Returns the token to write this tick for a sub-1-rps source, per
    /// §4.2: first tick at this rate arms a deadline and yields 0; once the
    /// deadline passes, yields 1 and clears the deadline.
    fn token_for(&mut self, source: &Source, rate: f64, now: Instant) -> i64 {
        match self.deadlines.get(source) {
            None => {
                self.deadlines
                    .insert(source.clone(), now + Duration::from_secs_f64(1.0 / rate));
                0
            }
            Some(deadline) => {
                if now >= *deadline {
                    self.deadlines.remove(source);
                    1
                } else {
                    0
                }
            }
        }
    }

    /// Drops deadline state for sources no longer at a sub-1 rate, so a
    /// source that crosses back above 1 rps doesn't carry stale state.
    fn retain_only(&mut self, sources: &std::collections::HashSet<Source>) {
        self.deadlines.retain(|s, _| sources.contains(s));
    }
}

/// The regulator's in-process state across ticks: the computed rate table,
/// the catalog/override scheduling clocks, and deferred sub-1-rps refill
/// deadlines. Never shared across tasks; owned entirely by `run`.
pub struct Regulator {
    store: Arc<dyn CoordinationStore>,
    catalog: Arc<dyn CatalogClient>,
    rate_table: HashMap<Source, f64>,
    merged_rates: HashMap<Source, f64>,
    next_catalog_check: Instant,
    next_override_check: Instant,
    deferred: DeferredRefill,
    shared_rates: Option<crate::logger::RateSnapshot>,
}

impl Regulator {
    pub fn new(store: Arc<dyn CoordinationStore>, catalog: Arc<dyn CatalogClient>) -> Self {
        let now = Instant::now();
        Self {
            store,
            catalog,
            rate_table: HashMap::new(),
            merged_rates: HashMap::new(),
            // Force both the catalog and override checks to fire on the
            // very first tick, seeding the rate table before anything else
            // depends on it.
            next_catalog_check: now,
            next_override_check: now,
            deferred: DeferredRefill::default(),
            shared_rates: None,
        }
    }

    /// Publishes the merged rate table into `snapshot` after every tick, so
    /// the structured logger can report `rate_limit` without racing the
    /// regulator's own coordination-store writes.
    pub fn with_shared_rates(mut self, snapshot: crate::logger::RateSnapshot) -> Self {
        self.shared_rates = Some(snapshot);
        self
    }

    pub async fn run(&mut self) -> Result<(), CrawlError> {
        loop {
            self.tick().await?;
            tokio::time::sleep(REGULATOR_TICK).await;
        }
    }

    /// Runs exactly one regulator tick: recompute → override-merge →
    /// error-check → replenish, per §4.2's ordering contract.
    pub async fn tick(&mut self) -> Result<(), CrawlError> {
        let now_instant = Instant::now();
        let known = self.store.known_sources().await?;

        if now_instant >= self.next_catalog_check {
            self.recompute_from_catalog().await;
            self.merge_overrides(&known).await?;
            self.next_catalog_check = now_instant + CATALOG_REFRESH_PERIOD;
            self.next_override_check = now_instant + OVERRIDE_CHECK_PERIOD;
        } else if now_instant >= self.next_override_check {
            self.merge_overrides(&known).await?;
            self.next_override_check = now_instant + OVERRIDE_CHECK_PERIOD;
        }

        if let Some(snapshot) = &self.shared_rates {
            *snapshot.write().await = self.merged_rates.clone();
        }

        self.error_threshold_check(&known).await?;
        self.replenish(&known, now_instant).await?;

        let known_set: std::collections::HashSet<Source> = known.into_iter().collect();
        self.deferred.retain_only(&known_set);

        Ok(())
    }

    async fn recompute_from_catalog(&mut self) {
        match self.catalog.fetch_sources().await {
            Ok(entries) => {
                for entry in entries {
                    let rate = compute_crawl_rate(entry.image_count);
                    self.rate_table.insert(entry.source, rate);
                }
            }
            Err(e) => {
                warn!(error = %e, "catalog api unreachable, retaining previous rate table");
            }
        }
    }

    async fn merge_overrides(&mut self, known: &[Source]) -> Result<(), CrawlError> {
        let overrides = self.store.get_overrides(known).await?;
        self.merged_rates = self.rate_table.clone();
        for (source, rate) in overrides {
            self.merged_rates.insert(source, rate);
        }
        Ok(())
    }

    async fn error_threshold_check(&mut self, known: &[Source]) -> Result<(), CrawlError> {
        let now = now_seconds();
        for source in known {
            let window = self.store.reap_window_60s(source, now).await?;
            let successes = window.iter().filter(|o| o.is_expected()).count();
            let errors = window.iter().filter(|o| !o.is_expected()).count();

            let over_threshold = if window.len() > ERROR_WINDOW_MIN_SAMPLES {
                let fraction = if successes == 0 {
                    f64::INFINITY
                } else {
                    errors as f64 / successes as f64
                };
                fraction > ERROR_WINDOW_THRESHOLD
            } else {
                false
            };

            if over_threshold {
                self.store.add_temp_halted(source).await?;
            } else {
                self.store.remove_temp_halted(source).await?;
            }

            let last_50 = self.store.last_50(source).await?;
            if last_50.len() >= LAST_50_SIZE && last_50.iter().all(|o| !o.is_expected()) {
                self.store.add_halted(source).await?;
                telemetry::emit(&CrawlHaltedEvent {
                    event: "crawl_halted",
                    kind: "permanent",
                    source: source.to_string(),
                    timestamp: now,
                });
                info!(source = %source, "source permanently halted: 50 consecutive non-expected outcomes");
            }
        }
        Ok(())
    }

    async fn replenish(&mut self, known: &[Source], now_instant: Instant) -> Result<(), CrawlError> {
        let halted = self.store.halted().await?;
        let temp_halted = self.store.temp_halted().await?;

        let mut batch = Vec::with_capacity(known.len());
        for source in known {
            let rate = self
                .merged_rates
                .get(source)
                .copied()
                .unwrap_or(crate::types::MIN_CRAWL_RPS);

            let mut tokens = if rate < 1.0 {
                self.deferred.token_for(source, rate, now_instant)
            } else {
                rate.floor() as i64
            };

            if halted.contains(source) || temp_halted.contains(source) {
                tokens = 0;
            }

            batch.push((source.clone(), tokens));
        }

        self.store.set_tokens(&batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    struct FixedCatalog(Vec<CatalogSourceCount>);

    #[async_trait]
    impl CatalogClient for FixedCatalog {
        async fn fetch_sources(&self) -> Result<Vec<CatalogSourceCount>, CrawlError> {
            Ok(self.0.clone())
        }
    }

    struct DownCatalog;

    #[async_trait]
    impl CatalogClient for DownCatalog {
        async fn fetch_sources(&self) -> Result<Vec<CatalogSourceCount>, CrawlError> {
            Err(CrawlError::Configuration("catalog unreachable".into()))
        }
    }

    #[tokio::test]
    async fn catalog_down_retains_previous_rate() {
        let store = Arc::new(InMemoryStore::new());
        let example = Source::new("example");
        store.register_source(&example).await.unwrap();

        let mut regulator = Regulator::new(
            store.clone() as Arc<dyn CoordinationStore>,
            Arc::new(FixedCatalog(vec![])),
        );
        regulator.rate_table.insert(example.clone(), 5.0);
        regulator.merged_rates.insert(example.clone(), 5.0);
        regulator.catalog = Arc::new(DownCatalog);
        // Force the catalog branch to run without waiting a real 30 minutes.
        regulator.next_catalog_check = Instant::now();

        regulator.tick().await.unwrap();

        assert_eq!(store.tokens(&example).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn override_wins_over_computed_rate() {
        let store = Arc::new(InMemoryStore::new());
        let example = Source::new("example");
        store.register_source(&example).await.unwrap();
        store.set_override(&example, 10.0).await;

        let mut regulator = Regulator::new(
            store.clone() as Arc<dyn CoordinationStore>,
            Arc::new(FixedCatalog(vec![CatalogSourceCount {
                source: example.clone(),
                image_count: 5_000_000.0,
            }])),
        );

        regulator.tick().await.unwrap();

        assert_eq!(store.tokens(&example).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn permanent_halt_on_50_consecutive_non_expected() {
        let store = Arc::new(InMemoryStore::new());
        let example = Source::new("example");
        let another = Source::new("another");
        store.register_source(&example).await.unwrap();
        store.register_source(&another).await.unwrap();
        store
            .seed_last_50(&example, vec![OutcomeCode::Status(500); 50])
            .await;
        store
            .seed_last_50(&another, vec![OutcomeCode::Status(200); 50])
            .await;

        let mut regulator = Regulator::new(
            store.clone() as Arc<dyn CoordinationStore>,
            Arc::new(FixedCatalog(vec![])),
        );
        regulator.tick().await.unwrap();

        let halted = store.halted().await.unwrap();
        assert!(halted.contains(&example));
        assert!(!halted.contains(&another));
    }

    #[tokio::test]
    async fn temporary_halt_trips_on_error_fraction_over_successes() {
        let store = Arc::new(InMemoryStore::new());
        let example = Source::new("example");
        let another = Source::new("another");
        store.register_source(&example).await.unwrap();
        store.register_source(&another).await.unwrap();

        let now = now_seconds();
        let mut example_window = vec![OutcomeCode::Status(200); 3];
        example_window.extend(vec![OutcomeCode::Status(500); 8]);
        store.seed_window_60s(&example, now, example_window).await;

        let mut another_window = vec![OutcomeCode::Status(200); 10];
        another_window.extend(vec![OutcomeCode::Status(500); 1]);
        store.seed_window_60s(&another, now, another_window).await;

        let mut regulator = Regulator::new(
            store.clone() as Arc<dyn CoordinationStore>,
            Arc::new(FixedCatalog(vec![])),
        );
        regulator.tick().await.unwrap();

        let temp_halted = store.temp_halted().await.unwrap();
        assert!(temp_halted.contains(&example));
        assert!(!temp_halted.contains(&another));
    }

    #[tokio::test]
    async fn halted_source_forced_to_zero_tokens() {
        let store = Arc::new(InMemoryStore::new());
        let example = Source::new("example");
        store.register_source(&example).await.unwrap();
        store.add_halted(&example).await.unwrap();

        let mut regulator = Regulator::new(
            store.clone() as Arc<dyn CoordinationStore>,
            Arc::new(FixedCatalog(vec![CatalogSourceCount {
                source: example.clone(),
                image_count: 500_000_000.0,
            }])),
        );
        regulator.tick().await.unwrap();

        assert_eq!(store.tokens(&example).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sub_one_rps_defers_then_issues_single_token() {
        let mut deferred = DeferredRefill::default();
        let source = Source::new("slow");
        let t0 = Instant::now();

        assert_eq!(deferred.token_for(&source, 0.5, t0), 0);
        assert_eq!(deferred.token_for(&source, 0.5, t0 + Duration::from_millis(500)), 0);
        assert_eq!(
            deferred.token_for(&source, 0.5, t0 + Duration::from_millis(2100)),
            1
        );
        // Cleared after firing; immediately re-arms for the next window.
        assert_eq!(deferred.token_for(&source, 0.5, t0 + Duration::from_millis(2100)), 0);
    }

    #[tokio::test]
    async fn fairness_share_is_not_regulator_concern_but_merge_overrides_is_batched() {
        let store = Arc::new(InMemoryStore::new());
        let a = Source::new("a");
        let b = Source::new("b");
        store.register_source(&a).await.unwrap();
        store.register_source(&b).await.unwrap();
        store.set_override(&a, 3.0).await;

        let mut regulator = Regulator::new(
            store.clone() as Arc<dyn CoordinationStore>,
            Arc::new(FixedCatalog(vec![])),
        );
        regulator.tick().await.unwrap();

        assert_eq!(store.tokens(&a).await.unwrap(), 3);
        // b has no catalog entry and no override: falls back to the floor rate.
        assert_eq!(store.tokens(&b).await.unwrap(), 0);
    }
}
