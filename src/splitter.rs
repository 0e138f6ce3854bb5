//! Source splitter (C3): demultiplexes the unified inbound topic into one
//! topic per source, registering newly seen sources as it goes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::{publish_json, MessageBus};
use crate::error::CrawlError;
use crate::store::CoordinationStore;
use crate::types::{InboundUrlEvent, Source, SourceUrlEvent};

pub const INBOUND_TOPIC: &str = "inbound_images";
pub const CONSUMER_GROUP: &str = "splitter";
const POLL_BATCH: usize = 500;
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const SPLIT_COUNTER_BATCH: i64 = 1_000;

/// Runs the splitter loop forever. Store/bus errors propagate so the
/// supervising process can restart; malformed individual messages are
/// dropped and logged, never propagated.
pub async fn run(
    store: Arc<dyn CoordinationStore>,
    bus: Arc<dyn MessageBus>,
) -> Result<(), CrawlError> {
    let mut since_last_counter_flush: i64 = 0;
    loop {
        let batch = bus
            .poll(INBOUND_TOPIC, CONSUMER_GROUP, POLL_BATCH, POLL_TIMEOUT)
            .await?;
        if batch.is_empty() {
            continue;
        }

        let mut processed = 0usize;
        for message in &batch {
            match serde_json::from_str::<InboundUrlEvent>(&message.payload) {
                Ok(event) => {
                    if let Err(e) = split_one(&store, &bus, event).await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(error = %e, "failed to split inbound url event");
                    }
                }
                Err(e) => {
                    warn!(error = %e, payload = %message.payload, "dropping malformed inbound message");
                }
            }
            processed += 1;
            since_last_counter_flush += 1;
            if since_last_counter_flush >= SPLIT_COUNTER_BATCH {
                store.incr_num_split(since_last_counter_flush).await?;
                since_last_counter_flush = 0;
            }
        }

        bus.commit(INBOUND_TOPIC, CONSUMER_GROUP, processed).await?;
    }
}

async fn split_one(
    store: &Arc<dyn CoordinationStore>,
    bus: &Arc<dyn MessageBus>,
    event: InboundUrlEvent,
) -> Result<(), CrawlError> {
    let source = Source::new(&event.source);
    if store.register_source(&source).await? {
        info!(source = %source, "observed new source");
    }

    let out = SourceUrlEvent {
        uuid: event.uuid,
        url: event.url,
    };
    publish_json(bus.as_ref(), &source.urls_topic(), &out).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn splits_and_registers_new_source() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let bus_concrete = bus.clone();

        let event = InboundUrlEvent {
            source: "FLICKR".to_string(),
            uuid: uuid::Uuid::nil(),
            url: "x".to_string(),
        };
        split_one(&store, &bus_concrete, event).await.unwrap();

        let known = store.known_sources().await.unwrap();
        assert_eq!(known, vec![Source::new("flickr")]);

        let published = bus.publish("flickr_urls", String::new()).await;
        assert!(published.is_ok());
    }

    #[tokio::test]
    async fn malformed_message_is_logged_not_propagated() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let bus = InMemoryBus::new();
        bus.seed(INBOUND_TOPIC, "{not valid json").await;
        bus.seed(
            INBOUND_TOPIC,
            serde_json::to_string(&InboundUrlEvent {
                source: "met".to_string(),
                uuid: uuid::Uuid::nil(),
                url: "https://example.com/a.jpg".to_string(),
            })
            .unwrap(),
        )
        .await;

        let batch = bus
            .poll(INBOUND_TOPIC, CONSUMER_GROUP, POLL_BATCH, POLL_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);

        let mut good = 0;
        for message in &batch {
            if let Ok(event) = serde_json::from_str::<InboundUrlEvent>(&message.payload) {
                let bus_arc: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
                split_one(&store, &bus_arc, event).await.unwrap();
                good += 1;
            }
        }
        assert_eq!(good, 1);
    }

    #[tokio::test]
    async fn exact_source_url_event_shape_on_per_source_topic() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let bus_dyn: Arc<dyn MessageBus> = bus.clone();

        let event = InboundUrlEvent {
            source: "FLICKR".to_string(),
            uuid: uuid::Uuid::nil(),
            url: "x".to_string(),
        };
        split_one(&store, &bus_dyn, event).await.unwrap();

        let published = bus.published("flickr_urls").await;
        assert_eq!(published.len(), 1);
        let decoded: SourceUrlEvent = serde_json::from_str(&published[0]).unwrap();
        assert_eq!(decoded.url, "x");
        assert_eq!(decoded.uuid, uuid::Uuid::nil());
        assert!(!published[0].contains("source"));
    }
}
