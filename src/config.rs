use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::domain::outbox::StoreOptions;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Process settings, read from the environment (and `.env` via dotenvy in `main`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub kafka_brokers: String,
    pub kafka_topic_prefix: String,
    pub poll_interval: Duration,
    pub batch_transactions: bool,
    pub store: StoreOptions,
    pub db_retry_count: u32,
    pub db_retry_delay: Duration,
    pub host: String,
    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any name → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let defaults = StoreOptions::default();

        Ok(Settings {
            database_url,
            kafka_brokers: lookup("KAFKA_BROKERS").unwrap_or_else(|| "localhost:9092".to_string()),
            kafka_topic_prefix: lookup("KAFKA_TOPIC_PREFIX").unwrap_or_default(),
            poll_interval: Duration::from_millis(parse(&lookup, "OUTBOX_POLL_INTERVAL_MS", 1000u64)?),
            batch_transactions: parse(&lookup, "OUTBOX_BATCH_TRANSACTIONS", false)?,
            store: StoreOptions {
                batch_size: parse(&lookup, "OUTBOX_BATCH_SIZE", defaults.batch_size)?,
                error_ceiling: parse(&lookup, "OUTBOX_ERROR_CEILING", defaults.error_ceiling)?,
            },
            db_retry_count: parse(&lookup, "DB_RETRY_COUNT", 3u32)?,
            db_retry_delay: Duration::from_millis(parse(&lookup, "DB_RETRY_DELAY_MS", 5u64)?),
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse(&lookup, "PORT", 8080u16)?,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
