use async_trait::async_trait;
use uuid::Uuid;

use super::errors::OutboxResult;
use super::outbox::{Message, OutboxRecord, OutboxStats};
use crate::context::Context;

/// A unit of work spanning several store calls.
///
/// Dropping a transaction without committing rolls it back.
pub trait Transaction: Send + 'static {
    fn commit(self) -> OutboxResult<()>;
    fn rollback(self) -> OutboxResult<()>;
}

/// Durable outbox table.
///
/// Every call that takes `tx: Option<&mut Self::Tx>` runs inside the given
/// transaction, or opens and finishes its own when `None` is passed.
pub trait EventStore: Send + Sync + 'static {
    type Tx: Transaction;

    /// Prepare the store; safe to call repeatedly.
    fn init(&self) -> OutboxResult<()>;

    fn create_transaction(&self, ctx: &Context) -> OutboxResult<Self::Tx>;

    /// Insert an Unpublished record and return its id.
    fn add_event(
        &self,
        ctx: &Context,
        tx: Option<&mut Self::Tx>,
        topic: &str,
        event_name: &str,
        payload: String,
    ) -> OutboxResult<Uuid>;

    /// Oldest-first batch of rows that are neither published nor stuck.
    fn get_pending_messages(
        &self,
        ctx: &Context,
        tx: Option<&mut Self::Tx>,
    ) -> OutboxResult<Vec<Message>>;

    fn clear_event(&self, ctx: &Context, tx: Option<&mut Self::Tx>, id: Uuid) -> OutboxResult<()>;

    /// Record a failed delivery and return the new error count.
    fn errored_event(
        &self,
        ctx: &Context,
        tx: Option<&mut Self::Tx>,
        id: Uuid,
        reason: &str,
    ) -> OutboxResult<i32>;

    fn get_record(&self, ctx: &Context, id: Uuid) -> OutboxResult<Option<OutboxRecord>>;

    fn get_stuck_messages(&self, ctx: &Context, limit: i64) -> OutboxResult<Vec<OutboxRecord>>;

    fn stats(&self, ctx: &Context) -> OutboxResult<OutboxStats>;

    fn error_ceiling(&self) -> i32;
}

/// Message transport the dispatcher delivers to.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    /// Any error means the message was not delivered.
    async fn publish_to_queue(&self, ctx: &Context, message: &Message) -> OutboxResult<()>;

    /// Release broker resources. Idempotent.
    async fn shutdown(&self);
}
