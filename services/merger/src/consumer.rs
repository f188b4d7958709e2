//! Consumption loop: fetch, handle with bounded retries, commit.
//!
//! Messages are processed strictly one at a time in fetch order. Every
//! fetched message is committed exactly once whether its handler succeeded or
//! exhausted its attempts, so a poison message never blocks its partition.
//! Only cancellation stops the loop early, and a message interrupted by
//! cancellation is left uncommitted for redelivery.

use crate::config::WorkerConfig;
use async_trait::async_trait;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer cancelled")]
    Cancelled,
}

/// Metadata about a received message
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds
    pub timestamp: Option<i64>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    pub fn key(&self) -> Option<&[u8]> {
        self.metadata.key.as_deref()
    }

    /// Get the message key as a string
    pub fn key_str(&self) -> Option<String> {
        self.key().and_then(|k| String::from_utf8(k.to_vec()).ok())
    }
}

/// Where messages come from and where their offsets go
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Next message, or `None` once the source is exhausted
    async fn fetch(&self) -> Result<Option<IncomingMessage>, ConsumerError>;

    /// Mark the message as consumed
    async fn commit(&self, message: &IncomingMessage) -> Result<(), ConsumerError>;
}

/// Handler trait for processing messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Error: Display + Send + Sync;

    /// Process a single message
    async fn handle(
        &self,
        message: &IncomingMessage,
        cancel: &CancellationToken,
    ) -> Result<(), Self::Error>;

    /// Called once when every attempt for a message has failed, before commit
    async fn on_exhausted(&self, message: &IncomingMessage, error: &Self::Error, attempts: u32) {
        let _ = (message, error, attempts);
    }
}

/// Attempt budget and delays for the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `n * backoff_step`
    pub backoff_step: Duration,
    pub fetch_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(300),
            fetch_retry_delay: Duration::from_millis(300),
        }
    }
}

impl From<&WorkerConfig> for RetryPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_step: config.retry_backoff(),
            fetch_retry_delay: config.fetch_retry_delay(),
        }
    }
}

/// How one message left the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled { attempts: u32 },
    Dropped { attempts: u32 },
}

/// Sequential fetch → handle → commit driver
pub struct ConsumptionLoop<S, H> {
    source: S,
    handler: H,
    policy: RetryPolicy,
}

impl<S, H> ConsumptionLoop<S, H>
where
    S: MessageSource,
    H: MessageHandler,
{
    pub fn new(source: S, handler: H, policy: RetryPolicy) -> Self {
        Self {
            source,
            handler,
            policy,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Run until the source is exhausted or `cancel` fires.
    ///
    /// Returns `Ok(())` at end of stream and `Err(ConsumerError::Cancelled)`
    /// on cancellation. Fetch errors are retried indefinitely.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ConsumerError> {
        info!(
            max_attempts = self.policy.max_attempts,
            "Starting message consumption loop"
        );

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Received shutdown signal");
                    return Err(ConsumerError::Cancelled);
                }
                fetched = self.source.fetch() => fetched,
            };

            let message = match fetched {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!("Message source exhausted, stopping");
                    return Ok(());
                }
                Err(ConsumerError::Cancelled) => return Err(ConsumerError::Cancelled),
                Err(e) => {
                    warn!(error = %e, "Fetch failed, retrying");
                    metrics::counter!("merger.fetch.errors").increment(1);
                    sleep_or_cancel(self.policy.fetch_retry_delay, cancel).await?;
                    continue;
                }
            };

            self.process(&message, cancel).await?;
        }
    }

    #[instrument(
        skip_all,
        fields(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            timestamp_ms = tracing::field::Empty,
        )
    )]
    async fn process(
        &self,
        message: &IncomingMessage,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ConsumerError> {
        if let Some(timestamp) = message.metadata.timestamp {
            tracing::Span::current().record("timestamp_ms", timestamp);
        }

        let outcome = self.handle_with_retry(message, cancel).await?;

        if let Err(e) = self.source.commit(message).await {
            warn!(error = %e, "Commit failed");
            metrics::counter!("merger.commits.failed").increment(1);
        } else {
            debug!(?outcome, "Offset committed");
        }

        Ok(outcome)
    }

    async fn handle_with_retry(
        &self,
        message: &IncomingMessage,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ConsumerError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self.handler.handle(message, cancel).await {
                Ok(()) => return Ok(Outcome::Handled { attempts: attempt }),
                Err(err) => err,
            };

            metrics::counter!("merger.attempts.failed").increment(1);

            if cancel.is_cancelled() {
                info!(attempt, "Handler interrupted by shutdown, leaving message uncommitted");
                return Err(ConsumerError::Cancelled);
            }

            if attempt >= max_attempts {
                error!(
                    attempts = attempt,
                    error = %err,
                    "Handler exhausted retries, dropping message"
                );
                metrics::counter!("merger.jobs.dropped").increment(1);
                self.handler.on_exhausted(message, &err, attempt).await;
                return Ok(Outcome::Dropped { attempts: attempt });
            }

            let backoff = self.policy.backoff_step * attempt;
            warn!(
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Handler attempt failed, backing off"
            );
            sleep_or_cancel(backoff, cancel).await?;
        }
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), ConsumerError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ConsumerError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
