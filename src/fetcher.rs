//! Rate-limited fetcher (C6): the inner loop that turns one per-source URL
//! event into a token acquisition, an HTTP GET, a status recording in the
//! coordination store, and (on success) a hand-off to the downstream
//! processor. Spawned per-message by the scheduler under a shared
//! concurrency semaphore.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::CrawlError;
use crate::processor::DownstreamProcessor;
use crate::store::CoordinationStore;
use crate::types::{now_seconds, OutcomeCode, Source, SourceUrlEvent};

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Runs the full lifecycle for one URL: semaphore acquisition, token
/// acquisition busy-wait, the HTTP GET, status recording, and the
/// downstream hand-off. Only coordination-store/message-bus failures are
/// returned as `Err`; everything else (HTTP failure, decode failure) is
/// recorded as an outcome and swallowed, per §4.4/§7.
pub async fn fetch_one(
    store: Arc<dyn CoordinationStore>,
    http: reqwest::Client,
    semaphore: Arc<tokio::sync::Semaphore>,
    processor: Arc<dyn DownstreamProcessor>,
    source: Source,
    event: SourceUrlEvent,
) -> Result<(), CrawlError> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .expect("fetch semaphore is never closed");

    acquire_token(&store, &source).await?;

    let response = http
        .get(&event.url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await;

    let response = match response {
        Ok(resp) => resp,
        Err(e) => {
            let outcome = CrawlError::Fetch {
                url: event.url.clone(),
                source: e,
            }
            .outcome_code()
            .unwrap_or(OutcomeCode::Status(599));
            store.record_outcome(&source, &outcome, now_seconds()).await?;
            return Ok(());
        }
    };

    let status = response.status().as_u16();
    if status >= 400 {
        store
            .record_outcome(&source, &OutcomeCode::Status(status), now_seconds())
            .await?;
        return Ok(());
    }

    let body = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            let outcome = CrawlError::Fetch {
                url: event.url.clone(),
                source: e,
            }
            .outcome_code()
            .unwrap_or(OutcomeCode::Status(599));
            store.record_outcome(&source, &outcome, now_seconds()).await?;
            return Ok(());
        }
    };

    match processor.process(event.uuid, &source, body.to_vec()).await {
        Ok(()) => {
            store
                .record_outcome(&source, &OutcomeCode::Status(status), now_seconds())
                .await?;
            Ok(())
        }
        Err(CrawlError::Decode(reason)) => {
            warn!(url = %event.url, reason = %reason, "payload did not decode as an image");
            store
                .record_outcome(&source, &OutcomeCode::UnidentifiedImage, now_seconds())
                .await?;
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(url = %event.url, error = %e, "downstream processor rejected payload");
            Ok(())
        }
    }
}

/// Decrements the source's token bucket until it succeeds, sleeping one
/// regulator tick between attempts. No timeout: the worker blocks until a
/// token is available, per §4.4.
async fn acquire_token(store: &Arc<dyn CoordinationStore>, source: &Source) -> Result<(), CrawlError> {
    loop {
        let remaining = store.decrement_token(source).await?;
        if remaining >= 0 {
            return Ok(());
        }
        tokio::time::sleep(TOKEN_RETRY_INTERVAL).await;
    }
}
