use thiserror::Error;

use crate::types::OutcomeCode;

/// Crate-wide error taxonomy. Each variant is one of the categories from the
/// error handling design: some are fatal (the supervising process restarts
/// the loop), some are recorded as outcomes and continued past.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Coordination-store round trip failed. Fatal: the caller's loop should
    /// propagate this out so the process restarts.
    #[error("coordination store error: {0}")]
    Store(String),

    /// Message-bus producer/consumer operation failed. Fatal for the same
    /// reason as `Store`.
    #[error("message bus error: {0}")]
    Bus(String),

    /// A fetch's HTTP layer failed (connection reset, timeout, transport
    /// error) or returned a non-2xx status. Transient; recorded as an
    /// outcome, never retried at this layer.
    #[error("fetch error for {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The downstream processor could not decode the fetched payload as an
    /// image. Recorded under `UnidentifiedImageError`.
    #[error("payload decode failure: {0}")]
    Decode(String),

    /// A bus message failed to parse as the expected JSON shape. Discarded,
    /// not propagated.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Configuration failed validation at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CrawlError {
    /// True for errors that should terminate the owning loop and let the
    /// supervisor restart the process, per the propagation policy in §7.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CrawlError::Store(_) | CrawlError::Bus(_))
    }

    /// The outcome code this error should be recorded under in the
    /// coordination store, if any. `Fetch` errors without an HTTP status
    /// (connection-level failures) are recorded as a synthetic 599; decode
    /// failures use the reserved code.
    pub fn outcome_code(&self) -> Option<OutcomeCode> {
        match self {
            CrawlError::Fetch { source, .. } => {
                let status = source.status().map(|s| s.as_u16()).unwrap_or(599);
                Some(OutcomeCode::Status(status))
            }
            CrawlError::Decode(_) => Some(OutcomeCode::UnidentifiedImage),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(err: serde_json::Error) -> Self {
        CrawlError::MalformedMessage(err.to_string())
    }
}

impl From<redis::RedisError> for CrawlError {
    fn from(err: redis::RedisError) -> Self {
        CrawlError::Store(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for CrawlError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        CrawlError::Bus(err.to_string())
    }
}

/// A simple failure-count circuit breaker for the regulator's outbound call
/// to the external catalog API. Distinct from the coordination store's
/// `halted`/`temp_halted` sets (§3), which gate crawl traffic rather than
/// the regulator's own catalog polling.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: std::sync::Arc<std::sync::Mutex<CircuitState>>,
    failure_threshold: usize,
    recovery_timeout: std::time::Duration,
    failure_count: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    last_failure_time: std::sync::Arc<std::sync::Mutex<Option<std::time::Instant>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, recovery_timeout: std::time::Duration) -> Self {
        Self {
            state: std::sync::Arc::new(std::sync::Mutex::new(CircuitState::Closed)),
            failure_threshold,
            recovery_timeout,
            failure_count: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            last_failure_time: std::sync::Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn can_execute(&self) -> bool {
        let state = *self.state.lock().unwrap();
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last_failure) = *self.last_failure_time.lock().unwrap() {
                    if last_failure.elapsed() > self.recovery_timeout {
                        *self.state.lock().unwrap() = CircuitState::HalfOpen;
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        self.failure_count
            .store(0, std::sync::atomic::Ordering::Relaxed);
        *self.state.lock().unwrap() = CircuitState::Closed;
        *self.last_failure_time.lock().unwrap() = None;
    }

    pub fn record_failure(&self) {
        let failures = self
            .failure_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        *self.last_failure_time.lock().unwrap() = Some(std::time::Instant::now());

        if failures >= self.failure_threshold {
            *self.state.lock().unwrap() = CircuitState::Open;
        }
    }

    pub fn get_state(&self) -> CircuitState {
        *self.state.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_are_store_and_bus() {
        assert!(CrawlError::Store("down".into()).is_fatal());
        assert!(CrawlError::Bus("down".into()).is_fatal());
        assert!(!CrawlError::Decode("bad".into()).is_fatal());
        assert!(!CrawlError::MalformedMessage("bad".into()).is_fatal());
    }

    #[test]
    fn decode_failure_maps_to_reserved_outcome() {
        let err = CrawlError::Decode("not an image".into());
        assert_eq!(err.outcome_code(), Some(OutcomeCode::UnidentifiedImage));
    }

    #[test]
    fn circuit_breaker_opens_after_threshold() {
        let cb = CircuitBreaker::new(3, std::time::Duration::from_secs(60));
        assert!(cb.can_execute());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.can_execute());
        cb.record_failure();
        assert!(!cb.can_execute());
        assert_eq!(cb.get_state(), CircuitState::Open);
    }

    #[test]
    fn circuit_breaker_resets_on_success() {
        let cb = CircuitBreaker::new(2, std::time::Duration::from_secs(60));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(cb.can_execute());
    }
}
