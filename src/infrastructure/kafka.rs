use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use crate::context::{Context, ContextError};
use crate::domain::errors::{OutboxError, OutboxResult};
use crate::domain::outbox::{Message, CONTENT_TYPE};
use crate::domain::ports::Publisher;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivers outbox messages to Kafka.
///
/// Each outbox topic maps to one Kafka topic, so any number of consumer
/// groups can subscribe independently. The record id is the message key.
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic_prefix: String,
    send_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaPublisher {
    pub fn new(brokers: &str, topic_prefix: &str) -> OutboxResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "30000")
            .create()?;

        log::info!("Kafka publisher connected to {}", brokers);
        Ok(Self {
            producer,
            topic_prefix: topic_prefix.to_string(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn topic_for(&self, topic: &str) -> String {
        format!("{}{}", self.topic_prefix, topic)
    }
}

fn message_headers(message: &Message) -> OwnedHeaders {
    let id = message.id.to_string();
    let timestamp = message.event_date_time.to_rfc3339();
    OwnedHeaders::new()
        .insert(Header {
            key: "message_id",
            value: Some(id.as_str()),
        })
        .insert(Header {
            key: "event_name",
            value: Some(message.event_name.as_str()),
        })
        .insert(Header {
            key: "timestamp",
            value: Some(timestamp.as_str()),
        })
        .insert(Header {
            key: "content_type",
            value: Some(CONTENT_TYPE),
        })
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish_to_queue(&self, ctx: &Context, message: &Message) -> OutboxResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OutboxError::PublisherClosed);
        }
        ctx.check()?;

        let topic = self.topic_for(&message.topic);
        let key = message.id.to_string();
        let record = FutureRecord::to(&topic)
            .key(key.as_str())
            .payload(message.payload.as_str())
            .headers(message_headers(message))
            .timestamp(message.event_date_time.timestamp_millis());
        let queue_timeout = ctx.remaining().unwrap_or(self.send_timeout);

        tokio::select! {
            _ = ctx.token().cancelled() => Err(ContextError::Cancelled.into()),
            delivery = self.producer.send(record, Timeout::After(queue_timeout)) => match delivery {
                Ok((partition, offset)) => {
                    log::debug!(
                        "Delivered event {} to {} [{}] at offset {}",
                        message.id,
                        topic,
                        partition,
                        offset
                    );
                    Ok(())
                }
                Err((err, _)) => Err(OutboxError::Broker(err)),
            },
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let producer = self.producer.clone();
        let timeout = self.send_timeout;
        match tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await {
            Ok(Ok(())) => log::info!("Kafka publisher flushed and closed"),
            Ok(Err(e)) => log::warn!("Kafka publisher closed with undelivered messages: {}", e),
            Err(e) => log::warn!("Kafka flush task failed: {}", e),
        }
    }
}
