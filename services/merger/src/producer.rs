//! Kafka producer wrapper for result and dead-letter publishing

use crate::config::KafkaConfig;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer flush timed out after {0:?}")]
    Timeout(Duration),
}

/// Keyed message publisher bound to one topic
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), ProducerError>;
}

/// Serialize `value` as JSON and publish it under `key`
pub async fn publish_json<T: Serialize + ?Sized>(
    sink: &dyn EventSink,
    key: &str,
    value: &T,
) -> Result<(), ProducerError> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
    sink.publish(key, &payload).await
}

/// Create the process-wide producer
pub fn create_producer(config: &KafkaConfig) -> Result<Arc<FutureProducer>, ProducerError> {
    info!("Creating Kafka producer for {}", config.brokers);

    let producer: FutureProducer = config
        .build_producer_config()
        .create()
        .map_err(|e| ProducerError::CreationError(e.to_string()))?;

    Ok(Arc::new(producer))
}

/// Flush all pending messages
pub fn flush(producer: &FutureProducer, timeout: Duration) -> Result<(), ProducerError> {
    producer
        .flush(Timeout::After(timeout))
        .map_err(|_| ProducerError::Timeout(timeout))
}

/// Publishes to a single topic through a shared `FutureProducer`
pub struct KafkaEventSink {
    producer: Arc<FutureProducer>,
    topic: String,
    timeout: Duration,
}

impl KafkaEventSink {
    pub fn new(producer: Arc<FutureProducer>, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            producer,
            topic: topic.into(),
            timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl EventSink for KafkaEventSink {
    #[instrument(skip(self, payload), fields(topic = %self.topic, size = payload.len()))]
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), ProducerError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: self.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(
            "Message delivered to partition {} at offset {}",
            partition, offset
        );

        Ok(())
    }
}
