//! Idempotent topic provisioning

use crate::config::KafkaConfig;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication, TopicResult};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Failed to create admin client: {0}")]
    CreationError(String),

    #[error("invalid topic spec: {0}")]
    InvalidSpec(String),

    #[error("metadata lookup for {topic}: {message}")]
    Metadata { topic: String, message: String },

    #[error("create topic {topic}: {message}")]
    Create { topic: String, message: String },

    #[error("topic {topic} not ready after {attempts} attempts: {last}")]
    Exhausted {
        topic: String,
        attempts: u32,
        last: Box<ProvisionError>,
    },

    #[error("topic provisioning cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: i32, replication: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication,
        }
    }

    fn validate(&self) -> Result<(), ProvisionError> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::InvalidSpec("topic name is empty".to_string()));
        }
        if self.partitions <= 0 || self.replication <= 0 {
            return Err(ProvisionError::InvalidSpec(format!(
                "{}: partitions and replication must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Broker administration used by the provisioner
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn topic_exists(&self, name: &str) -> Result<bool, ProvisionError>;

    /// Create the topic; a topic that already exists counts as created
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), ProvisionError>;
}

/// rdkafka `AdminClient` binding
pub struct KafkaTopicAdmin {
    admin: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &KafkaConfig) -> Result<Self, ProvisionError> {
        let admin: AdminClient<DefaultClientContext> = config
            .build_admin_config()
            .create()
            .map_err(|e| ProvisionError::CreationError(e.to_string()))?;

        Ok(Self {
            admin: Arc::new(admin),
            timeout: config.request_timeout(),
        })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn topic_exists(&self, name: &str) -> Result<bool, ProvisionError> {
        let admin = Arc::clone(&self.admin);
        let topic = name.to_string();
        let timeout = self.timeout;

        // fetch_metadata blocks the calling thread
        let metadata = tokio::task::spawn_blocking(move || {
            admin
                .inner()
                .fetch_metadata(Some(topic.as_str()), Timeout::After(timeout))
        })
        .await
        .map_err(|e| ProvisionError::Metadata {
            topic: name.to_string(),
            message: e.to_string(),
        })?
        .map_err(|e| ProvisionError::Metadata {
            topic: name.to_string(),
            message: e.to_string(),
        })?;

        Ok(metadata
            .topics()
            .iter()
            .any(|t| t.name() == name && t.error().is_none() && !t.partitions().is_empty()))
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), ProvisionError> {
        let new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication),
        );
        let options = AdminOptions::new().operation_timeout(Some(Timeout::After(self.timeout)));

        let results = self
            .admin
            .create_topics(&[new_topic], &options)
            .await
            .map_err(|e| ProvisionError::Create {
                topic: spec.name.clone(),
                message: e.to_string(),
            })?;

        check_create_results(results)
    }
}

/// A concurrent creator winning the race is still success
fn check_create_results(results: Vec<TopicResult>) -> Result<(), ProvisionError> {
    for result in results {
        match result {
            Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
            Err((topic, code)) => {
                return Err(ProvisionError::Create {
                    topic,
                    message: code.to_string(),
                })
            }
        }
    }

    Ok(())
}

/// Make sure `spec.name` exists, creating it if needed.
///
/// The existence check and create are retried together up to `attempts`
/// times, waiting `initial_backoff`, then twice that, and so on between
/// attempts. Cancellation stops immediately.
pub async fn ensure_topic(
    admin: &dyn TopicAdmin,
    spec: &TopicSpec,
    attempts: u32,
    initial_backoff: Duration,
    cancel: &CancellationToken,
) -> Result<(), ProvisionError> {
    spec.validate()?;

    let attempts = attempts.max(1);
    let mut backoff = ExponentialBackoff {
        initial_interval: initial_backoff,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();

    let mut attempt = 0;
    loop {
        attempt += 1;

        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }

        let err = match try_ensure(admin, spec).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if attempt >= attempts {
            return Err(ProvisionError::Exhausted {
                topic: spec.name.clone(),
                attempts,
                last: Box::new(err),
            });
        }

        let delay = backoff.next_backoff().unwrap_or(initial_backoff);
        warn!(
            topic = %spec.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Topic provisioning attempt failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn try_ensure(admin: &dyn TopicAdmin, spec: &TopicSpec) -> Result<(), ProvisionError> {
    if admin.topic_exists(&spec.name).await? {
        debug!(topic = %spec.name, "Topic already exists");
        return Ok(());
    }

    admin.create_topic(spec).await?;
    info!(
        topic = %spec.name,
        partitions = spec.partitions,
        replication = spec.replication,
        "Topic created"
    );
    Ok(())
}

/// Topics the worker publishes to, when configured
pub fn output_topics(config: &KafkaConfig) -> Vec<TopicSpec> {
    [config.output_topic(), config.dead_letter_topic()]
        .into_iter()
        .flatten()
        .map(|name| {
            TopicSpec::new(
                name,
                config.output_topic_partitions,
                config.output_topic_replication,
            )
        })
        .collect()
}
