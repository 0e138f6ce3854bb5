//! Crawl scheduler (C5): watches the set of known sources, maintains one
//! consumer per per-source topic, and spawns fetch tasks fairly under a
//! global concurrency cap. Never blocks on token availability; pacing is
//! entirely the fetcher's job (§4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::error::CrawlError;
use crate::fetcher;
use crate::processor::DownstreamProcessor;
use crate::store::CoordinationStore;
use crate::types::{Source, SourceUrlEvent};

pub const CONSUMER_GROUP: &str = "image_handlers";
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Computes the per-source fair share: `min(floor(MAX_TASKS / N), MAX_TASKS
/// / 4)`. The `/4` ceiling keeps an early-discovered source from starving
/// sources registered later, once enough of them exist for `MAX_TASKS / N`
/// to exceed a quarter of total capacity.
pub fn fair_share(max_tasks: usize, known_sources: usize) -> usize {
    if known_sources == 0 {
        return 0;
    }
    (max_tasks / known_sources).min(max_tasks / 4)
}

/// Scheduler state: one fetch-task list per source, a bounded global
/// semaphore, and handles to the dependencies it hands each fetch task.
pub struct Scheduler {
    store: Arc<dyn CoordinationStore>,
    bus: Arc<dyn MessageBus>,
    http: reqwest::Client,
    processor: Arc<dyn DownstreamProcessor>,
    semaphore: Arc<Semaphore>,
    max_tasks: usize,
    tasks: HashMap<Source, Vec<JoinHandle<Result<(), CrawlError>>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        bus: Arc<dyn MessageBus>,
        processor: Arc<dyn DownstreamProcessor>,
        max_tasks: usize,
    ) -> Self {
        Self {
            store,
            bus,
            http: reqwest::Client::new(),
            processor,
            semaphore: Arc::new(Semaphore::new(max_tasks)),
            max_tasks,
            tasks: HashMap::new(),
        }
    }

    pub async fn run(&mut self, period: Duration) -> Result<(), CrawlError> {
        loop {
            self.pass().await?;
            tokio::time::sleep(period).await;
        }
    }

    /// Runs exactly one scheduling pass: read known sources, compute the
    /// fair share, drain and dispatch up to that share per source, then
    /// sweep finished tasks.
    pub async fn pass(&mut self) -> Result<(), CrawlError> {
        let known = self.store.known_sources().await?;
        let share = fair_share(self.max_tasks, known.len());

        for source in &known {
            let in_flight = self.tasks.get(source).map(Vec::len).unwrap_or(0);
            let budget = share.saturating_sub(in_flight);
            if budget == 0 {
                continue;
            }
            self.dispatch(source, budget).await?;
        }

        self.sweep().await
    }

    async fn dispatch(&mut self, source: &Source, budget: usize) -> Result<(), CrawlError> {
        let topic = source.urls_topic();
        let batch = self
            .bus
            .poll(&topic, CONSUMER_GROUP, budget, DRAIN_TIMEOUT)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }

        let handles = self.tasks.entry(source.clone()).or_default();
        let mut committed = 0usize;
        for message in &batch {
            match serde_json::from_str::<SourceUrlEvent>(&message.payload) {
                Ok(event) => {
                    handles.push(tokio::spawn(fetcher::fetch_one(
                        self.store.clone(),
                        self.http.clone(),
                        self.semaphore.clone(),
                        self.processor.clone(),
                        source.clone(),
                        event,
                    )));
                }
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "dropping malformed per-source url event");
                }
            }
            committed += 1;
        }
        self.bus.commit(&topic, CONSUMER_GROUP, committed).await
    }

    /// Removes completed task handles and propagates the first fatal error
    /// seen among them, if any. Non-fatal per-fetch failures are already
    /// recorded as outcomes inside `fetch_one` and surface here as `Ok(())`.
    async fn sweep(&mut self) -> Result<(), CrawlError> {
        for handles in self.tasks.values_mut() {
            let mut still_running = Vec::with_capacity(handles.len());
            for handle in handles.drain(..) {
                if handle.is_finished() {
                    match handle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(e),
                        Err(join_err) => {
                            tracing::warn!(error = %join_err, "fetch task panicked");
                        }
                    }
                } else {
                    still_running.push(handle);
                }
            }
            *handles = still_running;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::processor::{FilesystemSink, ImageThumbnailProcessor};
    use crate::store::InMemoryStore;

    #[test]
    fn fair_share_matches_worked_example() {
        assert_eq!(fair_share(3000, 8), 375);
        assert_eq!(fair_share(12, 3), 4);
    }

    #[test]
    fn fair_share_quarter_ceiling_caps_few_sources() {
        // With very few sources MAX_TASKS/N would exceed MAX_TASKS/4; the
        // ceiling keeps any single source from claiming the whole pool.
        assert_eq!(fair_share(3000, 1), 750);
    }

    #[tokio::test]
    async fn dispatch_drains_up_to_share_and_spawns_tasks() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let a = Source::new("a");
        store.register_source(&a).await.unwrap();
        store.set_tokens(&[(a.clone(), 100)]).await.unwrap();

        let bus = Arc::new(InMemoryBus::new());
        for i in 0..5 {
            bus.seed(
                &a.urls_topic(),
                serde_json::to_string(&SourceUrlEvent {
                    uuid: uuid::Uuid::nil(),
                    url: format!("https://example.com/{i}.jpg"),
                })
                .unwrap(),
            )
            .await;
        }

        let bus_dyn: Arc<dyn MessageBus> = bus.clone();
        let processor: Arc<dyn DownstreamProcessor> = Arc::new(ImageThumbnailProcessor::new(
            bus_dyn.clone(),
            "metadata",
            Arc::new(FilesystemSink::new(std::env::temp_dir())),
            640,
            480,
        ));

        let mut scheduler = Scheduler::new(store.clone(), bus_dyn, processor, 12);
        scheduler.pass().await.unwrap();

        let in_flight = scheduler.tasks.get(&a).map(Vec::len).unwrap_or(0);
        assert!(in_flight > 0, "expected dispatch to spawn fetch tasks");
    }

    #[tokio::test]
    async fn fairness_bounds_in_flight_per_source_and_total() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        for name in ["a", "b", "c"] {
            let source = Source::new(name);
            store.register_source(&source).await.unwrap();
            store.set_tokens(&[(source.clone(), 0)]).await.unwrap();
            for i in 0..20 {
                bus.seed(
                    &source.urls_topic(),
                    serde_json::to_string(&SourceUrlEvent {
                        uuid: uuid::Uuid::nil(),
                        url: format!("https://example.com/{name}/{i}.jpg"),
                    })
                    .unwrap(),
                )
                .await;
            }
        }

        let bus_dyn: Arc<dyn MessageBus> = bus.clone();
        let processor: Arc<dyn DownstreamProcessor> = Arc::new(ImageThumbnailProcessor::new(
            bus_dyn.clone(),
            "metadata",
            Arc::new(FilesystemSink::new(std::env::temp_dir())),
            640,
            480,
        ));
        let mut scheduler = Scheduler::new(store, bus_dyn, processor, 12);
        scheduler.pass().await.unwrap();

        let mut total = 0;
        for handles in scheduler.tasks.values() {
            assert!(handles.len() <= 4);
            total += handles.len();
        }
        assert!(total <= 12);
    }
}
