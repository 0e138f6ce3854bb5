//! The coordination store (C1): token buckets, halt sets, sliding status
//! windows, and the counters the structured logger aggregates. Every other
//! control-plane component is a client of this trait, never of Redis
//! directly, so tests can substitute [`InMemoryStore`] for a live instance.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::CrawlError;
use crate::types::{OutcomeCode, Source};

const CURRTOKEN_PREFIX: &str = "currtokens:";
const OVERRIDE_PREFIX: &str = "override_rate:";
const HALTED_SET: &str = "halted";
const TEMP_HALTED_SET: &str = "temp_halted";
const STATUS_60S_PREFIX: &str = "status60s:";
const STATUS_1HR_PREFIX: &str = "status1hr:";
const STATUS_12HR_PREFIX: &str = "status12hr:";
const LAST_50_PREFIX: &str = "statuslast50req:";
const NUM_RESIZED: &str = "num_resized";
const RESIZE_ERRORS: &str = "resize_errors";
const NUM_SPLIT: &str = "num_split";
const SPECIFIC_SUCCESS_PREFIX: &str = "num_resized:";
const SPECIFIC_ERRORS_PREFIX: &str = "resize_errors:";
const KNOWN_SOURCES_SET: &str = "inbound_sources";

/// Cumulative counters the structured logger differences against its
/// previous tick to derive per-second rates (§4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct CumulativeCounters {
    pub num_resized: i64,
    pub resize_errors: i64,
    pub num_split: i64,
}

/// Per-source success/error totals, as read by the structured logger.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceCounters {
    pub successes: i64,
    pub errors: i64,
}

/// The coordination-store client contract shared by C3 (splitter), C4
/// (regulator), C5 (scheduler), C6 (fetcher), and C7 (logger). Every
/// operation maps to exactly one key schema documented in the external
/// interfaces table.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// The set of sources the splitter has ever observed (`inbound_sources`).
    async fn known_sources(&self) -> Result<Vec<Source>, CrawlError>;

    /// Adds `source` to the known-sources set. Returns `true` if the source
    /// was not already a member.
    async fn register_source(&self, source: &Source) -> Result<bool, CrawlError>;

    /// Batched read of `override_rate:{source}` for every source supplied.
    /// Sources with no override are absent from the returned map.
    async fn get_overrides(
        &self,
        sources: &[Source],
    ) -> Result<HashMap<Source, f64>, CrawlError>;

    async fn halted(&self) -> Result<HashSet<Source>, CrawlError>;
    async fn temp_halted(&self) -> Result<HashSet<Source>, CrawlError>;
    async fn add_halted(&self, source: &Source) -> Result<(), CrawlError>;
    async fn add_temp_halted(&self, source: &Source) -> Result<(), CrawlError>;
    async fn remove_temp_halted(&self, source: &Source) -> Result<(), CrawlError>;

    /// Reaps entries older than `now - 60s` from `status60s:{source}` and
    /// returns what remains, in the order the store happens to hold them.
    async fn reap_window_60s(
        &self,
        source: &Source,
        now: f64,
    ) -> Result<Vec<OutcomeCode>, CrawlError>;

    /// The bounded `statuslast50req:{source}` list, oldest first.
    async fn last_50(&self, source: &Source) -> Result<Vec<OutcomeCode>, CrawlError>;

    /// Overwrites `currtokens:{source}` for every `(source, tokens)` pair in
    /// a single batched transaction (the regulator's per-tick replenishment).
    async fn set_tokens(&self, values: &[(Source, i64)]) -> Result<(), CrawlError>;

    /// Atomically decrements `currtokens:{source}` and returns the resulting
    /// value. A fetcher proceeds iff the result is `>= 0`.
    async fn decrement_token(&self, source: &Source) -> Result<i64, CrawlError>;

    async fn tokens(&self, source: &Source) -> Result<i64, CrawlError>;

    /// The full "Status recording" batch from §4.4: global and per-source
    /// success/error counters, the three sliding windows, and the last-50
    /// list, all against the outcome's classification.
    async fn record_outcome(
        &self,
        source: &Source,
        outcome: &OutcomeCode,
        now: f64,
    ) -> Result<(), CrawlError>;

    /// Increments `num_split` by `by` (the splitter's batch-level counter).
    async fn incr_num_split(&self, by: i64) -> Result<(), CrawlError>;

    async fn counters(&self) -> Result<CumulativeCounters, CrawlError>;

    async fn source_counters(&self, source: &Source) -> Result<SourceCounters, CrawlError>;
}

fn window_key(prefix: &str, source: &Source) -> String {
    format!("{prefix}{source}")
}

/// `CoordinationStore` backed by a live Redis instance via a shared,
/// auto-reconnecting [`ConnectionManager`]. Cheap to clone: every clone
/// shares the same underlying connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_host: &str) -> Result<Self, CrawlError> {
        let url = if redis_host.starts_with("redis://") {
            redis_host.to_string()
        } else {
            format!("redis://{redis_host}")
        };
        let client = redis::Client::open(url).map_err(|e| CrawlError::Store(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))?;
        Ok(Self { conn })
    }

    async fn reap_and_read(
        &self,
        key: &str,
        now: f64,
        interval_secs: f64,
    ) -> Result<Vec<OutcomeCode>, CrawlError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrembyscore(key, f64::NEG_INFINITY, now - interval_secs)
            .await
            .map_err(CrawlError::from)?;
        let members: Vec<String> = conn.zrange(key, 0, -1).await.map_err(CrawlError::from)?;
        Ok(members
            .iter()
            .filter_map(|m| m.split(':').next())
            .map(OutcomeCode::parse)
            .collect())
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn known_sources(&self) -> Result<Vec<Source>, CrawlError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.smembers(KNOWN_SOURCES_SET).await.map_err(CrawlError::from)?;
        Ok(raw.into_iter().map(Source::from).collect())
    }

    async fn register_source(&self, source: &Source) -> Result<bool, CrawlError> {
        let mut conn = self.conn.clone();
        let added: i64 = conn
            .sadd(KNOWN_SOURCES_SET, source.as_str())
            .await
            .map_err(CrawlError::from)?;
        Ok(added > 0)
    }

    async fn get_overrides(
        &self,
        sources: &[Source],
    ) -> Result<HashMap<Source, f64>, CrawlError> {
        if sources.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for source in sources {
            pipe.get(format!("{OVERRIDE_PREFIX}{source}"));
        }
        let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await.map_err(CrawlError::from)?;
        let mut overrides = HashMap::new();
        for (source, value) in sources.iter().zip(raw.into_iter()) {
            if let Some(v) = value.and_then(|s| s.parse::<f64>().ok()) {
                overrides.insert(source.clone(), v);
            }
        }
        Ok(overrides)
    }

    async fn halted(&self) -> Result<HashSet<Source>, CrawlError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.smembers(HALTED_SET).await.map_err(CrawlError::from)?;
        Ok(raw.into_iter().map(Source::from).collect())
    }

    async fn temp_halted(&self) -> Result<HashSet<Source>, CrawlError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.smembers(TEMP_HALTED_SET).await.map_err(CrawlError::from)?;
        Ok(raw.into_iter().map(Source::from).collect())
    }

    async fn add_halted(&self, source: &Source) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(HALTED_SET, source.as_str()).await.map_err(CrawlError::from)?;
        Ok(())
    }

    async fn add_temp_halted(&self, source: &Source) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .sadd(TEMP_HALTED_SET, source.as_str())
            .await
            .map_err(CrawlError::from)?;
        Ok(())
    }

    async fn remove_temp_halted(&self, source: &Source) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .srem(TEMP_HALTED_SET, source.as_str())
            .await
            .map_err(CrawlError::from)?;
        Ok(())
    }

    async fn reap_window_60s(
        &self,
        source: &Source,
        now: f64,
    ) -> Result<Vec<OutcomeCode>, CrawlError> {
        let key = window_key(STATUS_60S_PREFIX, source);
        self.reap_and_read(&key, now, crate::types::WINDOW_60S_SECS as f64).await
    }

    async fn last_50(&self, source: &Source) -> Result<Vec<OutcomeCode>, CrawlError> {
        let mut conn = self.conn.clone();
        let key = window_key(LAST_50_PREFIX, source);
        let raw: Vec<String> = conn.lrange(key, 0, -1).await.map_err(CrawlError::from)?;
        Ok(raw.iter().map(|s| OutcomeCode::parse(s)).collect())
    }

    async fn set_tokens(&self, values: &[(Source, i64)]) -> Result<(), CrawlError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (source, tokens) in values {
            pipe.set(format!("{CURRTOKEN_PREFIX}{source}"), *tokens);
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(CrawlError::from)?;
        Ok(())
    }

    async fn decrement_token(&self, source: &Source) -> Result<i64, CrawlError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn
            .decr(format!("{CURRTOKEN_PREFIX}{source}"), 1)
            .await
            .map_err(CrawlError::from)?;
        Ok(value)
    }

    async fn tokens(&self, source: &Source) -> Result<i64, CrawlError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn
            .get(format!("{CURRTOKEN_PREFIX}{source}"))
            .await
            .map_err(CrawlError::from)?;
        Ok(value.unwrap_or(0))
    }

    async fn record_outcome(
        &self,
        source: &Source,
        outcome: &OutcomeCode,
        now: f64,
    ) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        let code = outcome.as_wire_str();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if outcome.is_success() {
            pipe.incr(NUM_RESIZED, 1);
            pipe.incr(format!("{SPECIFIC_SUCCESS_PREFIX}{source}"), 1);
        } else {
            pipe.incr(RESIZE_ERRORS, 1);
            pipe.incr(format!("{SPECIFIC_ERRORS_PREFIX}{source}"), 1);
            pipe.incr(format!("{SPECIFIC_ERRORS_PREFIX}{source}:{code}"), 1);
        }
        for (prefix, interval) in [
            (STATUS_60S_PREFIX, crate::types::WINDOW_60S_SECS as f64),
            (STATUS_1HR_PREFIX, crate::types::WINDOW_1HR_SECS as f64),
            (STATUS_12HR_PREFIX, crate::types::WINDOW_12HR_SECS as f64),
        ] {
            let key = window_key(prefix, source);
            pipe.zadd(&key, format!("{code}:{now}"), now);
            pipe.zrembyscore(&key, f64::NEG_INFINITY, now - interval);
        }
        let last_50_key = window_key(LAST_50_PREFIX, source);
        pipe.rpush(&last_50_key, &code);
        pipe.ltrim(&last_50_key, -(crate::types::LAST_50_SIZE as isize), -1);
        let _: () = pipe.query_async(&mut conn).await.map_err(CrawlError::from)?;
        Ok(())
    }

    async fn incr_num_split(&self, by: i64) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        let _: () = conn.incr(NUM_SPLIT, by).await.map_err(CrawlError::from)?;
        Ok(())
    }

    async fn counters(&self) -> Result<CumulativeCounters, CrawlError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.get(NUM_RESIZED).get(RESIZE_ERRORS).get(NUM_SPLIT);
        let (num_resized, resize_errors, num_split): (
            Option<i64>,
            Option<i64>,
            Option<i64>,
        ) = pipe.query_async(&mut conn).await.map_err(CrawlError::from)?;
        Ok(CumulativeCounters {
            num_resized: num_resized.unwrap_or(0),
            resize_errors: resize_errors.unwrap_or(0),
            num_split: num_split.unwrap_or(0),
        })
    }

    async fn source_counters(&self, source: &Source) -> Result<SourceCounters, CrawlError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.get(format!("{SPECIFIC_SUCCESS_PREFIX}{source}"))
            .get(format!("{SPECIFIC_ERRORS_PREFIX}{source}"));
        let (successes, errors): (Option<i64>, Option<i64>) =
            pipe.query_async(&mut conn).await.map_err(CrawlError::from)?;
        Ok(SourceCounters {
            successes: successes.unwrap_or(0),
            errors: errors.unwrap_or(0),
        })
    }
}

/// In-memory fake of [`CoordinationStore`], used by unit and integration
/// tests in place of a live Redis instance. Mirrors Redis key semantics
/// (sets, sorted sets, lists, counters) closely enough that tests exercising
/// the regulator, scheduler, and fetcher against it also exercise the real
/// key schema.
#[derive(Default)]
pub struct InMemoryStore {
    inner: tokio::sync::Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    known_sources: HashSet<Source>,
    overrides: HashMap<Source, f64>,
    halted: HashSet<Source>,
    temp_halted: HashSet<Source>,
    tokens: HashMap<Source, i64>,
    window_60s: HashMap<Source, Vec<(f64, OutcomeCode)>>,
    window_1hr: HashMap<Source, Vec<(f64, OutcomeCode)>>,
    window_12hr: HashMap<Source, Vec<(f64, OutcomeCode)>>,
    last_50: HashMap<Source, Vec<OutcomeCode>>,
    num_resized: i64,
    resize_errors: i64,
    num_split: i64,
    per_source_success: HashMap<Source, i64>,
    per_source_error: HashMap<Source, i64>,
    per_source_error_code: HashMap<(Source, String), i64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seeds `last_50(source)` directly, as the scenario
    /// fixtures in §8 do ("seed last_50 with 50 b\"500\" entries").
    pub async fn seed_last_50(&self, source: &Source, outcomes: Vec<OutcomeCode>) {
        let mut state = self.inner.lock().await;
        state.last_50.insert(source.clone(), outcomes);
    }

    /// Test helper: seeds `window_60s(source)` with outcomes timestamped at
    /// `now`, bypassing the normal record_outcome path.
    pub async fn seed_window_60s(&self, source: &Source, now: f64, outcomes: Vec<OutcomeCode>) {
        let mut state = self.inner.lock().await;
        let entry = state.window_60s.entry(source.clone()).or_default();
        for outcome in outcomes {
            entry.push((now, outcome));
        }
    }

    pub async fn set_override(&self, source: &Source, rate: f64) {
        let mut state = self.inner.lock().await;
        state.overrides.insert(source.clone(), rate);
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn known_sources(&self) -> Result<Vec<Source>, CrawlError> {
        let state = self.inner.lock().await;
        Ok(state.known_sources.iter().cloned().collect())
    }

    async fn register_source(&self, source: &Source) -> Result<bool, CrawlError> {
        let mut state = self.inner.lock().await;
        Ok(state.known_sources.insert(source.clone()))
    }

    async fn get_overrides(
        &self,
        sources: &[Source],
    ) -> Result<HashMap<Source, f64>, CrawlError> {
        let state = self.inner.lock().await;
        Ok(sources
            .iter()
            .filter_map(|s| state.overrides.get(s).map(|v| (s.clone(), *v)))
            .collect())
    }

    async fn halted(&self) -> Result<HashSet<Source>, CrawlError> {
        Ok(self.inner.lock().await.halted.clone())
    }

    async fn temp_halted(&self) -> Result<HashSet<Source>, CrawlError> {
        Ok(self.inner.lock().await.temp_halted.clone())
    }

    async fn add_halted(&self, source: &Source) -> Result<(), CrawlError> {
        self.inner.lock().await.halted.insert(source.clone());
        Ok(())
    }

    async fn add_temp_halted(&self, source: &Source) -> Result<(), CrawlError> {
        self.inner.lock().await.temp_halted.insert(source.clone());
        Ok(())
    }

    async fn remove_temp_halted(&self, source: &Source) -> Result<(), CrawlError> {
        self.inner.lock().await.temp_halted.remove(source);
        Ok(())
    }

    async fn reap_window_60s(
        &self,
        source: &Source,
        now: f64,
    ) -> Result<Vec<OutcomeCode>, CrawlError> {
        let mut state = self.inner.lock().await;
        let cutoff = now - crate::types::WINDOW_60S_SECS as f64;
        let entry = state.window_60s.entry(source.clone()).or_default();
        entry.retain(|(score, _)| *score > cutoff);
        Ok(entry.iter().map(|(_, o)| o.clone()).collect())
    }

    async fn last_50(&self, source: &Source) -> Result<Vec<OutcomeCode>, CrawlError> {
        let state = self.inner.lock().await;
        Ok(state.last_50.get(source).cloned().unwrap_or_default())
    }

    async fn set_tokens(&self, values: &[(Source, i64)]) -> Result<(), CrawlError> {
        let mut state = self.inner.lock().await;
        for (source, tokens) in values {
            state.tokens.insert(source.clone(), *tokens);
        }
        Ok(())
    }

    async fn decrement_token(&self, source: &Source) -> Result<i64, CrawlError> {
        let mut state = self.inner.lock().await;
        let entry = state.tokens.entry(source.clone()).or_insert(0);
        *entry -= 1;
        Ok(*entry)
    }

    async fn tokens(&self, source: &Source) -> Result<i64, CrawlError> {
        let state = self.inner.lock().await;
        Ok(*state.tokens.get(source).unwrap_or(&0))
    }

    async fn record_outcome(
        &self,
        source: &Source,
        outcome: &OutcomeCode,
        now: f64,
    ) -> Result<(), CrawlError> {
        let mut state = self.inner.lock().await;
        if outcome.is_success() {
            state.num_resized += 1;
            *state.per_source_success.entry(source.clone()).or_insert(0) += 1;
        } else {
            state.resize_errors += 1;
            *state.per_source_error.entry(source.clone()).or_insert(0) += 1;
            *state
                .per_source_error_code
                .entry((source.clone(), outcome.as_wire_str()))
                .or_insert(0) += 1;
        }
        for (window, interval) in [
            (&mut state.window_60s, crate::types::WINDOW_60S_SECS as f64),
            (&mut state.window_1hr, crate::types::WINDOW_1HR_SECS as f64),
            (&mut state.window_12hr, crate::types::WINDOW_12HR_SECS as f64),
        ] {
            let entry = window.entry(source.clone()).or_default();
            entry.push((now, outcome.clone()));
            let cutoff = now - interval;
            entry.retain(|(score, _)| *score > cutoff);
        }
        let last_50 = state.last_50.entry(source.clone()).or_default();
        last_50.push(outcome.clone());
        let overflow = last_50.len().saturating_sub(crate::types::LAST_50_SIZE);
        if overflow > 0 {
            last_50.drain(0..overflow);
        }
        Ok(())
    }

    async fn incr_num_split(&self, by: i64) -> Result<(), CrawlError> {
        self.inner.lock().await.num_split += by;
        Ok(())
    }

    async fn counters(&self) -> Result<CumulativeCounters, CrawlError> {
        let state = self.inner.lock().await;
        Ok(CumulativeCounters {
            num_resized: state.num_resized,
            resize_errors: state.resize_errors,
            num_split: state.num_split,
        })
    }

    async fn source_counters(&self, source: &Source) -> Result<SourceCounters, CrawlError> {
        let state = self.inner.lock().await;
        Ok(SourceCounters {
            successes: *state.per_source_success.get(source).unwrap_or(&0),
            errors: *state.per_source_error.get(source).unwrap_or(&0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_source_reports_novelty() {
        let store = InMemoryStore::new();
        let flickr = Source::new("flickr");
        assert!(store.register_source(&flickr).await.unwrap());
        assert!(!store.register_source(&flickr).await.unwrap());
        assert_eq!(store.known_sources().await.unwrap(), vec![flickr]);
    }

    #[tokio::test]
    async fn decrement_token_goes_negative_without_panicking() {
        let store = InMemoryStore::new();
        let src = Source::new("example");
        store.set_tokens(&[(src.clone(), 1)]).await.unwrap();
        assert_eq!(store.decrement_token(&src).await.unwrap(), 0);
        assert_eq!(store.decrement_token(&src).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn record_outcome_trims_last_50_to_bound() {
        let store = InMemoryStore::new();
        let src = Source::new("example");
        for i in 0..60 {
            store
                .record_outcome(&src, &OutcomeCode::Status(200), i as f64)
                .await
                .unwrap();
        }
        assert_eq!(store.last_50(&src).await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn reap_window_60s_drops_stale_entries() {
        let store = InMemoryStore::new();
        let src = Source::new("example");
        store
            .seed_window_60s(&src, 0.0, vec![OutcomeCode::Status(200)])
            .await;
        store
            .seed_window_60s(&src, 100.0, vec![OutcomeCode::Status(200)])
            .await;
        let remaining = store.reap_window_60s(&src, 100.0).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn record_outcome_double_counts_duplicate_delivery() {
        let store = InMemoryStore::new();
        let src = Source::new("example");
        store
            .record_outcome(&src, &OutcomeCode::Status(200), 0.0)
            .await
            .unwrap();
        store
            .record_outcome(&src, &OutcomeCode::Status(200), 0.0)
            .await
            .unwrap();
        assert_eq!(store.counters().await.unwrap().num_resized, 2);
        assert_eq!(store.source_counters(&src).await.unwrap().successes, 2);
    }
}
