//! Media Merge Worker
//!
//! Kafka-driven worker that combines a video-only object and an audio-only
//! object from S3-compatible storage into one MP4 and uploads the result.
//! Each job message names both inputs; the worker downloads them into a
//! job-scoped scratch directory, runs ffmpeg to copy the video stream and
//! encode the audio stream, probes the output, uploads it and publishes a
//! result message.
//!
//! ## Architecture
//!
//! ```text
//! Kafka                                  S3
//! ┌──────────────┐   fetch   ┌─────────────────┐  get   ┌──────────────┐
//! │ merge        │──────────▶│ Consumption     │◀──────▶│ video/audio  │
//! │ requests     │◀──────────│ Loop            │  put   │ merged       │
//! └──────────────┘   commit  └─────────────────┘        └──────────────┘
//!                                   │    ▲
//!                            handle │    │ retry ×3
//!                                   ▼    │
//!                            ┌─────────────────┐        ┌──────────────┐
//!                            │ Job Handler     │───────▶│ ffmpeg       │
//!                            └─────────────────┘        │ ffprobe      │
//!                                   │                   └──────────────┘
//!                                   ▼
//!                            ┌─────────────────┐
//!                            │ results / DLQ   │
//!                            └─────────────────┘
//! ```
//!
//! Jobs run one at a time in fetch order. Every fetched message is committed
//! once, after success or after its retries are exhausted.

pub mod config;
pub mod consumer;
pub mod handler;
pub mod job;
pub mod kafka_consumer;
pub mod media;
pub mod producer;
pub mod storage;
pub mod topics;

pub use config::Config;
pub use consumer::{ConsumptionLoop, IncomingMessage, MessageHandler, MessageSource, RetryPolicy};
pub use handler::{FailureClass, HandlerSettings, JobError, MergeJobHandler};
pub use job::{derive_output_key, DeadLetterRecord, MergeJob, MergeResult, ResultStatus};
pub use kafka_consumer::KafkaSource;
pub use media::{CallContext, Ffmpeg, MediaError, MediaTool, StreamInfo};
pub use producer::{EventSink, KafkaEventSink};
pub use storage::{ObjectStore, S3ObjectStore, UploadReceipt};
pub use topics::{ensure_topic, KafkaTopicAdmin, TopicAdmin, TopicSpec};
