use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Width of the `error_message` column.
pub const MAX_ERROR_MESSAGE_LEN: usize = 255;

/// Content type stamped on every delivered message.
pub const CONTENT_TYPE: &str = "text/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum OutboxStatus {
    Unpublished,
    Published,
    Error,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Unpublished => "Unpublished",
            OutboxStatus::Published => "Published",
            OutboxStatus::Error => "Error",
        }
    }

    /// Published is terminal; everything else may move to Published or Error.
    pub fn can_transition_to(&self, next: OutboxStatus) -> bool {
        match self {
            OutboxStatus::Published => false,
            OutboxStatus::Unpublished | OutboxStatus::Error => {
                matches!(next, OutboxStatus::Published | OutboxStatus::Error)
            }
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unpublished" => Ok(OutboxStatus::Unpublished),
            "Published" => Ok(OutboxStatus::Published),
            "Error" => Ok(OutboxStatus::Error),
            other => Err(format!("unknown outbox status '{}'", other)),
        }
    }
}

/// Full audit view of one outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub topic: String,
    pub event_name: String,
    pub payload: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub error_count: i32,
    pub error_message: Option<String>,
}

impl OutboxRecord {
    pub fn is_stuck(&self, error_ceiling: i32) -> bool {
        self.published_at.is_none() && self.error_count >= error_ceiling
    }

    pub fn to_message(&self) -> Message {
        Message {
            id: self.id,
            topic: self.topic.clone(),
            event_name: self.event_name.clone(),
            event_date_time: self.created_at,
            payload: self.payload.clone(),
        }
    }
}

/// What the dispatcher hands to a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub event_name: String,
    pub event_date_time: DateTime<Utc>,
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct OutboxStats {
    pub unpublished: i64,
    pub published: i64,
    pub errored: i64,
    /// Errored rows at or above the ceiling; no longer polled.
    pub stuck: i64,
}

/// Limits applied by a store when selecting pending rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub batch_size: i64,
    pub error_ceiling: i32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            error_ceiling: 10,
        }
    }
}

/// Cut a failure reason down to what the column can hold, on a char boundary.
pub fn truncate_error_message(reason: &str) -> String {
    if reason.len() <= MAX_ERROR_MESSAGE_LEN {
        return reason.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
