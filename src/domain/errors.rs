use thiserror::Error;
use uuid::Uuid;

use crate::context::ContextError;
use crate::retry::RetryError;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] rdkafka::error::KafkaError),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Publisher is shut down")]
    PublisherClosed,

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("Event store is not initialized")]
    NotInitialized,

    #[error("Outbox event not found or already published: {0}")]
    EventNotFound(Uuid),

    #[error("Unexpected state: {0}")]
    UnexpectedState(String),

    #[error("Event {id} reached {error_count} failed deliveries and will no longer be polled")]
    RetriesExhausted { id: Uuid, error_count: i32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Join(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OutboxError {
    /// True when the call was aborted by its context rather than failing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, OutboxError::Context(_))
    }
}

impl From<RetryError<diesel::result::Error>> for OutboxError {
    fn from(e: RetryError<diesel::result::Error>) -> Self {
        match e {
            RetryError::Context(c) => OutboxError::Context(c),
            RetryError::Failed(d) => OutboxError::Database(d),
        }
    }
}

impl From<tokio::task::JoinError> for OutboxError {
    fn from(e: tokio::task::JoinError) -> Self {
        OutboxError::Join(e.to_string())
    }
}

pub type OutboxResult<T> = Result<T, OutboxError>;
