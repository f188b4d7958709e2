//! Merge job handler
//!
//! One call handles one job end to end, strictly in order: decode, resolve
//! region and output location, create a work directory, download video then
//! audio, merge, probe, upload, emit the result. The work directory is removed
//! on every path out of the handler.

use crate::config::Config;
use crate::consumer::{IncomingMessage, MessageHandler};
use crate::job::{DeadLetterRecord, MergeJob, MergeResult, OutputLocation};
use crate::media::{CallContext, MediaError, MediaTool};
use crate::producer::{publish_json, EventSink};
use crate::storage::{ObjectStore, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const VIDEO_INPUT: &str = "video_in.mp4";
pub const AUDIO_INPUT: &str = "audio_in.m4a";
pub const MERGED_OUTPUT: &str = "merged_out.mp4";
pub const OUTPUT_CONTENT_TYPE: &str = "video/mp4";

/// Whether retrying a failed job can change its outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The job itself is unusable
    Permanent,
    /// Infrastructure or tooling
    Transient,
    /// Merge succeeded but the upload did not
    PartialFailure,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("decode job: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("region is required but missing on the job and no default region is configured")]
    MissingRegion,

    #[error("create work directory under {root}: {source}")]
    WorkDir {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("create {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("download {role} s3://{bucket}/{key}: {source}")]
    Download {
        role: &'static str,
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("merge: {0}")]
    Merge(#[source] MediaError),

    #[error("upload s3://{bucket}/{key}: {source}")]
    Upload {
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },
}

impl JobError {
    pub fn class(&self) -> FailureClass {
        match self {
            JobError::Decode(_) | JobError::MissingRegion => FailureClass::Permanent,
            JobError::Merge(e) if e.is_validation() => FailureClass::Permanent,
            JobError::Upload { .. } => FailureClass::PartialFailure,
            _ => FailureClass::Transient,
        }
    }
}

/// Job-scoped scratch directory `merge-<random>` under the scratch root
#[derive(Debug)]
pub struct WorkDirectory {
    dir: TempDir,
}

impl WorkDirectory {
    /// Create the directory, creating the scratch root first if needed
    pub async fn create(root: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let dir = tempfile::Builder::new().prefix("merge-").tempdir_in(root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn video_path(&self) -> PathBuf {
        self.path().join(VIDEO_INPUT)
    }

    pub fn audio_path(&self) -> PathBuf {
        self.path().join(AUDIO_INPUT)
    }

    pub fn output_path(&self) -> PathBuf {
        self.path().join(MERGED_OUTPUT)
    }

    /// Remove the directory and everything in it; failures are only logged
    pub fn close(self) {
        let path = self.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "Work directory removed"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove work directory"),
        }
    }
}

/// Settings the handler reads on every job
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub default_region: Option<String>,
    pub scratch_root: PathBuf,
    pub audio_codec: String,
    pub job_timeout: Option<Duration>,
}

impl HandlerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_region: config.default_region().map(String::from),
            scratch_root: config.worker.scratch_dir.clone(),
            audio_codec: config.media.audio_codec.clone(),
            job_timeout: config.worker.job_timeout(),
        }
    }
}

/// Handles merge jobs from the input topic
pub struct MergeJobHandler {
    store: Arc<dyn ObjectStore>,
    media: Arc<dyn MediaTool>,
    results: Option<Arc<dyn EventSink>>,
    dead_letters: Option<Arc<dyn EventSink>>,
    settings: HandlerSettings,
}

impl MergeJobHandler {
    pub fn new(store: Arc<dyn ObjectStore>, media: Arc<dyn MediaTool>, settings: HandlerSettings) -> Self {
        Self {
            store,
            media,
            results: None,
            dead_letters: None,
            settings,
        }
    }

    /// Publish merge results to this sink
    pub fn with_results(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.results = Some(sink);
        self
    }

    /// Publish dead-letter records to this sink
    pub fn with_dead_letters(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Run one job from its raw payload
    pub async fn process(&self, payload: &[u8], cancel: &CancellationToken) -> Result<MergeResult, JobError> {
        let job = MergeJob::decode(payload)?;

        let region = non_blank(job.region())
            .or_else(|| non_blank(self.settings.default_region.as_deref()))
            .ok_or(JobError::MissingRegion)?
            .to_string();

        let output = job.output_location();

        self.run_job(&job, &region, &output, cancel).await
    }

    #[instrument(
        skip_all,
        fields(
            video_id = %job.video_id,
            media_id = job.media_id().unwrap_or_default(),
            correlation_id = job.correlation_id().unwrap_or_default(),
            region = %region,
        )
    )]
    async fn run_job(
        &self,
        job: &MergeJob,
        region: &str,
        output: &OutputLocation,
        cancel: &CancellationToken,
    ) -> Result<MergeResult, JobError> {
        let root = &self.settings.scratch_root;
        let workdir = WorkDirectory::create(root)
            .await
            .map_err(|source| JobError::WorkDir {
                root: root.clone(),
                source,
            })?;

        debug!(workdir = %workdir.path().display(), "Created work directory");

        let result = self.run_in(&workdir, job, region, output, cancel).await;
        workdir.close();
        result
    }

    async fn run_in(
        &self,
        workdir: &WorkDirectory,
        job: &MergeJob,
        region: &str,
        output: &OutputLocation,
        cancel: &CancellationToken,
    ) -> Result<MergeResult, JobError> {
        let video_path = workdir.video_path();
        let audio_path = workdir.audio_path();
        let merged_path = workdir.output_path();

        self.download("video", region, &job.video_bucket, &job.video_key, &video_path)
            .await?;
        self.download("audio", region, &job.audio_bucket, &job.audio_key, &audio_path)
            .await?;

        let mut ctx = CallContext::new(cancel.child_token());
        if let Some(timeout) = self.settings.job_timeout {
            ctx = ctx.with_timeout(timeout);
        }

        let started = Instant::now();
        self.media
            .merge(&video_path, &audio_path, &merged_path, &self.settings.audio_codec, &ctx)
            .await
            .map_err(JobError::Merge)?;
        let merge_secs = started.elapsed().as_secs_f64();
        metrics::histogram!("merger.merge.duration_seconds").record(merge_secs);

        let duration_sec = match self.media.probe(&merged_path, &ctx).await {
            Ok(info) => info.duration_sec,
            Err(e) => {
                warn!(error = %e, "Probe of merged output failed, reporting zero duration");
                0.0
            }
        };

        let receipt = self
            .store
            .upload_from_file(region, &output.bucket, &output.key, &merged_path, OUTPUT_CONTENT_TYPE)
            .await
            .map_err(|source| JobError::Upload {
                bucket: output.bucket.clone(),
                key: output.key.clone(),
                source,
            })?;

        let result = MergeResult::merged(job, output, &receipt, duration_sec);

        info!(
            output_bucket = %output.bucket,
            output_key = %output.key,
            size_bytes = receipt.size_bytes,
            duration_sec,
            merge_secs,
            "Merge job completed"
        );
        metrics::counter!("merger.jobs.merged").increment(1);

        self.emit(&job.video_id, &result).await;

        Ok(result)
    }

    async fn download(
        &self,
        role: &'static str,
        region: &str,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<u64, JobError> {
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|source| JobError::Stage {
                path: dest.to_path_buf(),
                source,
            })?;

        let bytes = self
            .store
            .download_to_writer(region, bucket, key, &mut file)
            .await
            .map_err(|source| JobError::Download {
                role,
                bucket: bucket.to_string(),
                key: key.to_string(),
                source,
            })?;

        debug!(role, bucket, key, bytes, "Downloaded input");
        Ok(bytes)
    }

    async fn emit(&self, video_id: &str, result: &MergeResult) {
        let Some(sink) = self.results.as_deref() else {
            debug!("No output topic configured, skipping result");
            return;
        };

        if let Err(e) = publish_json(sink, video_id, result).await {
            warn!(error = %e, status = ?result.status, "Failed to publish merge result");
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[async_trait]
impl MessageHandler for MergeJobHandler {
    type Error = JobError;

    async fn handle(&self, message: &IncomingMessage, cancel: &CancellationToken) -> Result<(), JobError> {
        match self.process(&message.payload, cancel).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, class = ?e.class(), "Merge job attempt failed");
                Err(e)
            }
        }
    }

    async fn on_exhausted(&self, message: &IncomingMessage, error: &JobError, attempts: u32) {
        metrics::counter!("merger.jobs.failed").increment(1);

        let job = MergeJob::decode(&message.payload).ok();

        if let Some(ref job) = job {
            self.emit(&job.video_id, &MergeResult::failed(job, error.to_string()))
                .await;
        }

        let Some(sink) = self.dead_letters.as_deref() else {
            return;
        };

        let meta = &message.metadata;
        let record = DeadLetterRecord::new(
            &meta.topic,
            meta.partition,
            meta.offset,
            message.key(),
            &message.payload,
            error.to_string(),
            error.class(),
            attempts,
        );

        let key = message
            .key_str()
            .or_else(|| job.map(|j| j.video_id))
            .unwrap_or_else(|| format!("{}-{}-{}", meta.topic, meta.partition, meta.offset));

        match publish_json(sink, &key, &record).await {
            Ok(()) => info!(key = %key, "Dead-lettered exhausted message"),
            Err(e) => warn!(error = %e, "Failed to publish dead-letter record"),
        }
    }
}
