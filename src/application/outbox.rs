use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::Context;
use crate::domain::errors::{OutboxError, OutboxResult};
use crate::domain::ports::{EventStore, Publisher, Transaction};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    /// Records whose failure count reached the ceiling during this cycle.
    pub stuck: Vec<Uuid>,
    /// Batch-transaction mode only: the cycle's updates were discarded.
    pub rolled_back: bool,
}

/// Records events next to business writes and drains them to a publisher.
pub struct Outbox<S: EventStore> {
    store: Arc<S>,
    publisher: Arc<dyn Publisher>,
    poll_interval: Duration,
    batch_transactions: bool,
}

impl<S: EventStore> Clone for Outbox<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            publisher: Arc::clone(&self.publisher),
            poll_interval: self.poll_interval,
            batch_transactions: self.batch_transactions,
        }
    }
}

pub struct OutboxBuilder<S: EventStore> {
    store: Option<Arc<S>>,
    publisher: Option<Arc<dyn Publisher>>,
    poll_interval: Duration,
    batch_transactions: bool,
}

impl<S: EventStore> Default for OutboxBuilder<S> {
    fn default() -> Self {
        Self {
            store: None,
            publisher: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_transactions: false,
        }
    }
}

impl<S: EventStore> OutboxBuilder<S> {
    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run each poll cycle's status updates in one transaction.
    pub fn batch_transactions(mut self, enabled: bool) -> Self {
        self.batch_transactions = enabled;
        self
    }

    pub fn build(self) -> OutboxResult<Outbox<S>> {
        let store = self
            .store
            .ok_or_else(|| OutboxError::Config("an event store must be provided to the outbox".to_string()))?;
        let publisher = self
            .publisher
            .ok_or_else(|| OutboxError::Config("a publisher must be provided to the outbox".to_string()))?;
        if self.poll_interval.is_zero() {
            return Err(OutboxError::Config("poll interval must be greater than zero".to_string()));
        }
        Ok(Outbox {
            store,
            publisher,
            poll_interval: self.poll_interval,
            batch_transactions: self.batch_transactions,
        })
    }
}

/// Running poll loop.
pub struct DispatcherHandle {
    handle: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Wait for the loop to exit after the shutdown token fires.
    pub async fn join(self) -> OutboxResult<()> {
        self.handle.await?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn report(errors: &UnboundedSender<OutboxError>, err: OutboxError) {
    if let Err(unsent) = errors.send(err) {
        log::error!("Outbox error channel closed, error not delivered: {}", unsent.0);
    }
}

impl<S: EventStore> Outbox<S> {
    pub fn builder() -> OutboxBuilder<S> {
        OutboxBuilder::default()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Serialize `payload` to JSON and record it as an outbox event.
    ///
    /// Pass the business transaction so the event commits or rolls back with
    /// the write it describes.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        tx: Option<&mut S::Tx>,
        topic: &str,
        event_name: &str,
        payload: &T,
    ) -> OutboxResult<Uuid> {
        let payload = serde_json::to_string(payload)?;
        self.store.add_event(ctx, tx, topic, event_name, payload)
    }

    /// Prepare the store and start the poll loop on the current runtime.
    ///
    /// Returns as soon as the loop is spawned. Every failure the loop meets is
    /// sent on `errors`; cancelling `shutdown` stops the loop after the
    /// current cycle and shuts the publisher down.
    pub fn init(
        &self,
        shutdown: CancellationToken,
        errors: UnboundedSender<OutboxError>,
    ) -> OutboxResult<DispatcherHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| OutboxError::Config(format!("outbox needs a tokio runtime: {}", e)))?;
        self.store.init()?;

        let outbox = self.clone();
        let handle = runtime.spawn(async move { outbox.poll_messages(shutdown, errors).await });
        Ok(DispatcherHandle { handle })
    }

    async fn poll_messages(self, shutdown: CancellationToken, errors: UnboundedSender<OutboxError>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!(
            "Outbox dispatcher started (interval {:?}, batch transactions: {})",
            self.poll_interval,
            self.batch_transactions
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cycle = self.poll_once(&errors).await;
                    if cycle.fetched > 0 {
                        log::debug!(
                            "Outbox cycle: fetched {}, published {}, failed {}, rolled back {}",
                            cycle.fetched,
                            cycle.published,
                            cycle.failed,
                            cycle.rolled_back
                        );
                    }
                }
            }
        }

        self.publisher.shutdown().await;
        log::info!("Outbox dispatcher stopped");
    }

    /// Run one store call on the blocking pool, moving the cycle's
    /// transaction in and back out.
    async fn blocking<T, F>(&self, tx: Option<S::Tx>, op: F) -> (Option<S::Tx>, OutboxResult<T>)
    where
        T: Send + 'static,
        F: FnOnce(&S, Option<&mut S::Tx>) -> OutboxResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || {
            let mut tx = tx;
            let result = op(&store, tx.as_mut());
            (tx, result)
        });
        match task.await {
            Ok(out) => out,
            Err(e) => (None, Err(e.into())),
        }
    }

    /// Commit the cycle's transaction, or roll it back after a store failure.
    /// Returns whether the cycle's updates were kept.
    async fn finish_batch(
        &self,
        tx: Option<S::Tx>,
        store_failed: bool,
        errors: &UnboundedSender<OutboxError>,
    ) -> bool {
        // Lost when a store call panicked; dropping it rolled it back.
        let Some(tx) = tx else {
            return false;
        };
        if store_failed {
            let (_, rolled_back) = self.blocking(None, move |_, _| tx.rollback()).await;
            if let Err(e) = rolled_back {
                report(errors, e);
            }
            return false;
        }
        let (_, committed) = self.blocking(None, move |_, _| tx.commit()).await;
        match committed {
            Ok(()) => true,
            Err(e) => {
                log::error!("Outbox could not commit batch: {}", e);
                report(errors, e);
                false
            }
        }
    }

    /// One fetch-publish-update pass over the pending batch.
    pub async fn poll_once(&self, errors: &UnboundedSender<OutboxError>) -> CycleReport {
        // Independent of any request: an aborted caller must not stop delivery.
        let ctx = Context::background();
        let mut cycle = CycleReport::default();

        let mut tx = None;
        if self.batch_transactions {
            let c = ctx.clone();
            match self.blocking(None, move |store, _| store.create_transaction(&c)).await {
                (_, Ok(opened)) => tx = Some(opened),
                (_, Err(e)) => {
                    log::error!("Outbox could not open a batch transaction: {}", e);
                    report(errors, e);
                    return cycle;
                }
            }
        }

        let c = ctx.clone();
        let (returned, fetched) = self
            .blocking(tx, move |store, tx| store.get_pending_messages(&c, tx))
            .await;
        tx = returned;
        let messages = match fetched {
            Ok(messages) => messages,
            Err(e) => {
                log::error!("Outbox could not fetch pending events: {}", e);
                report(errors, e);
                if self.batch_transactions {
                    self.finish_batch(tx, true, errors).await;
                    cycle.rolled_back = true;
                }
                return cycle;
            }
        };
        if messages.is_empty() {
            // Ended on the blocking pool; dropping it would roll back on this thread.
            if self.batch_transactions {
                self.finish_batch(tx, false, errors).await;
            }
            return cycle;
        }
        cycle.fetched = messages.len();

        let ceiling = self.store.error_ceiling();
        let mut newly_stuck = Vec::new();
        let mut store_failed = false;

        for message in messages {
            let id = message.id;
            let c = ctx.clone();
            match self.publisher.publish_to_queue(&ctx, &message).await {
                Ok(()) => {
                    let (returned, cleared) =
                        self.blocking(tx, move |store, tx| store.clear_event(&c, tx, id)).await;
                    tx = returned;
                    match cleared {
                        Ok(()) => cycle.published += 1,
                        Err(e) => {
                            log::error!("Outbox could not mark event {} published: {}", id, e);
                            store_failed = true;
                            report(errors, e);
                        }
                    }
                }
                Err(publish_err) => {
                    log::warn!("Outbox delivery of event {} failed: {}", id, publish_err);
                    cycle.failed += 1;
                    let reason = publish_err.to_string();
                    report(errors, publish_err);

                    let (returned, errored) = self
                        .blocking(tx, move |store, tx| store.errored_event(&c, tx, id, &reason))
                        .await;
                    tx = returned;
                    match errored {
                        Ok(error_count) if error_count >= ceiling => newly_stuck.push((id, error_count)),
                        Ok(_) => {}
                        Err(e) => {
                            log::error!("Outbox could not record failure of event {}: {}", id, e);
                            store_failed = true;
                            report(errors, e);
                        }
                    }
                }
            }

            // A failed statement poisons the batch transaction; retry it all next tick.
            if store_failed && self.batch_transactions {
                break;
            }
        }

        if self.batch_transactions && !self.finish_batch(tx, store_failed, errors).await {
            log::warn!("Outbox batch of {} events rolled back for retry", cycle.fetched);
            cycle.rolled_back = true;
            return cycle;
        }

        for (id, error_count) in newly_stuck {
            log::error!(
                "Outbox event {} failed {} times and will no longer be polled",
                id,
                error_count
            );
            cycle.stuck.push(id);
            report(errors, OutboxError::RetriesExhausted { id, error_count });
        }

        cycle
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::domain::outbox::{Message, StoreOptions};
    use crate::infrastructure::memory_store::MemoryEventStore;

    struct NoopPublisher;

    #[async_trait]
    impl Publisher for NoopPublisher {
        async fn publish_to_queue(&self, _ctx: &Context, _message: &Message) -> OutboxResult<()> {
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    #[test]
    fn builder_requires_store() {
        let result = Outbox::<MemoryEventStore>::builder()
            .publisher(Arc::new(NoopPublisher))
            .build();
        assert!(matches!(result, Err(OutboxError::Config(_))));
    }

    #[test]
    fn builder_requires_publisher() {
        let result = Outbox::builder()
            .store(Arc::new(MemoryEventStore::new(StoreOptions::default())))
            .build();
        assert!(matches!(result, Err(OutboxError::Config(_))));
    }

    #[test]
    fn builder_rejects_zero_interval() {
        let result = Outbox::builder()
            .store(Arc::new(MemoryEventStore::new(StoreOptions::default())))
            .publisher(Arc::new(NoopPublisher))
            .poll_interval(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(OutboxError::Config(_))));
    }

    #[test]
    fn init_outside_runtime_is_an_error() {
        let outbox = Outbox::builder()
            .store(Arc::new(MemoryEventStore::new(StoreOptions::default())))
            .publisher(Arc::new(NoopPublisher))
            .build()
            .expect("build failed");
        let (errors, _rx) = tokio::sync::mpsc::unbounded_channel();

        let result = outbox.init(CancellationToken::new(), errors);
        assert!(matches!(result, Err(OutboxError::Config(_))));
    }

    #[test]
    fn publish_serializes_payload_as_json() {
        let store = Arc::new(MemoryEventStore::new(StoreOptions::default()));
        let outbox = Outbox::builder()
            .store(Arc::clone(&store))
            .publisher(Arc::new(NoopPublisher))
            .build()
            .expect("build failed");

        let id = outbox
            .publish(
                &Context::background(),
                None,
                "PersonTopic",
                "PersonAdded",
                &serde_json::json!({ "firstName": "A" }),
            )
            .expect("publish failed");

        let record = store
            .get_record(&Context::background(), id)
            .expect("lookup failed")
            .expect("record exists");
        assert_eq!(record.payload, r#"{"firstName":"A"}"#);
        assert_eq!(record.event_name, "PersonAdded");
    }
}
