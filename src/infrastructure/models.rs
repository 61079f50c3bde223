use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::domain::errors::OutboxError;
use crate::domain::outbox::{Message, OutboxRecord};
use crate::schema::outbox;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = outbox)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OutboxRow {
    pub id: Uuid,
    pub topic: String,
    pub event_name: String,
    pub payload: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub error_count: i32,
    pub error_message: Option<String>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxRecord {
            status: row.status.parse().map_err(OutboxError::UnexpectedState)?,
            id: row.id,
            topic: row.topic,
            event_name: row.event_name,
            payload: row.payload,
            created_at: row.created_at,
            published_at: row.published_at,
            error_count: row.error_count,
            error_message: row.error_message,
        })
    }
}

/// Columns the dispatcher needs from a pending row.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = outbox)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PendingRow {
    pub id: Uuid,
    pub topic: String,
    pub event_name: String,
    pub created_at: DateTime<Utc>,
    pub payload: String,
}

impl From<PendingRow> for Message {
    fn from(row: PendingRow) -> Self {
        Message {
            id: row.id,
            topic: row.topic,
            event_name: row.event_name,
            event_date_time: row.created_at,
            payload: row.payload,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = outbox)]
pub struct NewOutboxRow<'a> {
    pub id: Uuid,
    pub topic: &'a str,
    pub event_name: &'a str,
    pub payload: &'a str,
    pub status: &'a str,
    pub created_at: DateTime<Utc>,
    pub error_count: i32,
}
