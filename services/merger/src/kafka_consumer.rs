use crate::config::KafkaConfig;
use crate::consumer::{ConsumerError, IncomingMessage, MessageMetadata, MessageSource};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

/// Kafka-backed message source with manual offset commits
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSource {
    /// Create a consumer and subscribe it to the input topic
    pub fn new(config: &KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.brokers,
            group_id = %config.group_id,
            topic = %config.input_topic,
            start_offset = config.start_offset.as_auto_offset_reset(),
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.input_topic.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        Ok(Self {
            consumer,
            topic: config.input_topic.clone(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Convert a borrowed Kafka message to an owned incoming message
    fn convert_message(msg: &BorrowedMessage<'_>) -> IncomingMessage {
        IncomingMessage {
            payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(|k| k.to_vec()),
                timestamp: msg.timestamp().to_millis(),
            },
        }
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn fetch(&self) -> Result<Option<IncomingMessage>, ConsumerError> {
        match self.consumer.recv().await {
            Ok(msg) => {
                let incoming = Self::convert_message(&msg);
                debug!(
                    "Received message from topic={}, partition={}, offset={}",
                    incoming.metadata.topic, incoming.metadata.partition, incoming.metadata.offset
                );
                Ok(Some(incoming))
            }
            Err(KafkaError::Canceled) => Err(ConsumerError::Cancelled),
            Err(e) => Err(ConsumerError::PollError(e.to_string())),
        }
    }

    async fn commit(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.metadata.topic,
                message.metadata.partition,
                Offset::Offset(message.metadata.offset + 1),
            )
            .map_err(|e| ConsumerError::CommitError(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }
}
