//! Job, result and dead-letter message types

use crate::handler::FailureClass;
use crate::storage::UploadReceipt;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix appended to the video stem when the job names no output key
pub const MERGED_SUFFIX: &str = "_merged.mp4";

/// Stem used when the video key has no usable base name
const FALLBACK_STEM: &str = "video";

/// A merge request read from the input topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeJob {
    pub video_bucket: String,
    pub video_key: String,
    pub audio_bucket: String,
    pub audio_key: String,
    pub video_id: String,
    pub audio_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_bucket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,

    /// Carried through for log correlation only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
}

/// Where the merged object is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLocation {
    pub bucket: String,
    pub key: String,
}

impl MergeJob {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn region(&self) -> Option<&str> {
        non_empty(&self.region)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        non_empty(&self.correlation_id)
    }

    pub fn media_id(&self) -> Option<&str> {
        non_empty(&self.media_id)
    }

    /// Output bucket and key, falling back to the video bucket and a key
    /// derived from the video key
    pub fn output_location(&self) -> OutputLocation {
        let bucket = non_empty(&self.output_bucket)
            .unwrap_or(&self.video_bucket)
            .to_string();
        let key = match non_empty(&self.output_key) {
            Some(key) => key.to_string(),
            None => derive_output_key(&self.video_key),
        };

        OutputLocation { bucket, key }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// `a/b/video.mp4` becomes `a/b/video_merged.mp4`.
///
/// Keys are `/`-separated object names, never OS paths. The stem is the base
/// name up to its last `.`; an empty stem becomes `video`.
pub fn derive_output_key(video_key: &str) -> String {
    let (dir, base) = match video_key.rfind('/') {
        Some(idx) => (Some(&video_key[..idx]), &video_key[idx + 1..]),
        None => (None, video_key),
    };

    let stem = match base.rfind('.') {
        Some(idx) => &base[..idx],
        None => base,
    };
    let stem = if stem.is_empty() { FALLBACK_STEM } else { stem };

    match dir {
        Some(dir) if !dir.is_empty() => format!("{}/{}{}", dir, stem, MERGED_SUFFIX),
        Some(_) => format!("/{}{}", stem, MERGED_SUFFIX),
        None => format!("{}{}", stem, MERGED_SUFFIX),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Merged,
    Failed,
}

/// Outcome published to the output topic, keyed by video id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub status: ResultStatus,
    pub video_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_bucket: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size_bytes: u64,

    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub duration_sec: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

impl MergeResult {
    pub fn merged(
        job: &MergeJob,
        output: &OutputLocation,
        receipt: &UploadReceipt,
        duration_sec: f64,
    ) -> Self {
        Self {
            status: ResultStatus::Merged,
            video_id: job.video_id.clone(),
            output_bucket: output.bucket.clone(),
            output_key: output.key.clone(),
            etag: receipt.etag.clone().filter(|e| !e.is_empty()),
            size_bytes: receipt.size_bytes,
            duration_sec: duration_sec.max(0.0),
            correlation_id: job.correlation_id().map(String::from),
            err: None,
        }
    }

    pub fn failed(job: &MergeJob, error: impl Into<String>) -> Self {
        let output = job.output_location();
        Self {
            status: ResultStatus::Failed,
            video_id: job.video_id.clone(),
            output_bucket: output.bucket,
            output_key: output.key,
            etag: None,
            size_bytes: 0,
            duration_sec: 0.0,
            correlation_id: job.correlation_id().map(String::from),
            err: Some(error.into()),
        }
    }
}

/// Record of an input message dropped after exhausting its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub source_topic: String,
    pub partition: i32,
    pub offset: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    pub payload_base64: String,
    pub error: String,
    pub failure_class: FailureClass,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<&[u8]>,
        payload: &[u8],
        error: impl Into<String>,
        failure_class: FailureClass,
        attempts: u32,
    ) -> Self {
        Self {
            source_topic: source_topic.into(),
            partition,
            offset,
            key: key.map(|k| String::from_utf8_lossy(k).into_owned()),
            payload_base64: BASE64.encode(payload),
            error: error.into(),
            failure_class,
            attempts,
            failed_at: Utc::now(),
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.payload_base64)
    }
}
