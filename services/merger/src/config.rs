//! Configuration for the merge worker.
//!
//! Settings are layered: built-in defaults, then optional config files
//! (`config/merger.*`, `/etc/merger/merger.*`), then `MERGER__SECTION__KEY`
//! environment variables, then the legacy single-name variables `AWS_REGION`,
//! `FFMPEG_BIN` and `FFPROBE_BIN`.

use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating a loaded configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Main configuration for the merge worker
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// ffmpeg/ffprobe configuration
    #[serde(default)]
    pub media: MediaConfig,
    /// Consumption loop and job handler tuning
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; the exporter is disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Where a consumer group with no committed offset starts reading
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    #[serde(alias = "earliest")]
    First,
    #[default]
    #[serde(alias = "latest")]
    Last,
}

impl StartOffset {
    pub fn as_auto_offset_reset(&self) -> &'static str {
        match self {
            StartOffset::First => "earliest",
            StartOffset::Last => "latest",
        }
    }
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// Kafka configuration shared by the consumer, producers and admin client
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated broker addresses
    pub brokers: String,
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Client ID reported to the brokers
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic carrying merge jobs
    pub input_topic: String,
    /// Topic receiving merge results; results are not published when unset
    #[serde(default)]
    pub output_topic: Option<String>,
    /// Topic receiving jobs dropped after exhausting retries
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
    /// Start offset policy for a group without committed offsets
    #[serde(default)]
    pub start_offset: StartOffset,
    /// Minimum bytes the broker accumulates before answering a fetch
    #[serde(default = "default_fetch_min_bytes")]
    pub fetch_min_bytes: u32,
    /// Maximum bytes returned by one fetch
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: u32,
    /// Maximum time the broker waits to fill `fetch_min_bytes`
    #[serde(default = "default_fetch_max_wait_ms")]
    pub fetch_max_wait_ms: u32,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds; must exceed the slowest job
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Producer request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Security protocol
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    #[serde(default = "default_sasl_mechanism")]
    pub sasl_mechanism: String,
    /// SASL username
    #[serde(default)]
    pub sasl_username: Option<String>,
    /// SASL password
    #[serde(default)]
    pub sasl_password: Option<String>,
    /// Create the output and dead-letter topics at startup if missing
    #[serde(default)]
    pub auto_create_topics: bool,
    /// Partition count for provisioned topics
    #[serde(default = "default_partitions")]
    pub output_topic_partitions: i32,
    /// Replication factor for provisioned topics
    #[serde(default = "default_replication")]
    pub output_topic_replication: i32,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Region used when a job carries none
    #[serde(default)]
    pub default_region: Option<String>,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Timeout applied to each download or upload
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
}

/// External media tool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// ffmpeg executable name or path
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,
    /// ffprobe executable name or path
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: String,
    /// Audio codec for the merged output
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Ceiling for one tool invocation when the caller sets no deadline
    #[serde(default = "default_media_timeout_secs")]
    pub timeout_secs: u64,
}

/// Consumption loop and job handler tuning
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Root under which per-job work directories are created
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Handler attempts per message
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff step between attempts; attempt N waits N * step
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Delay before fetching again after a fetch error
    #[serde(default = "default_fetch_retry_delay_ms")]
    pub fetch_retry_delay_ms: u64,
    /// Optional deadline for each merge invocation
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
}

// Default value functions
fn default_service_name() -> String {
    "media-merger".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_group_id() -> String {
    "media-merger".to_string()
}

fn default_client_id() -> String {
    "media-merger".to_string()
}

fn default_fetch_min_bytes() -> u32 {
    1
}

fn default_fetch_max_bytes() -> u32 {
    1024 * 1024 // 1MB
}

fn default_fetch_max_wait_ms() -> u32 {
    250
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    3_600_000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

fn default_partitions() -> i32 {
    1
}

fn default_replication() -> i32 {
    1
}

fn default_transfer_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_ffmpeg_bin() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_bin() -> String {
    "ffprobe".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_media_timeout_secs() -> u64 {
    600 // 10 minutes
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("./tmp")
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    300
}

fn default_fetch_retry_delay_ms() -> u64 {
    300
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_region: None,
            endpoint_url: None,
            force_path_style: false,
            transfer_timeout_secs: default_transfer_timeout_secs(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
            audio_codec: default_audio_codec(),
            timeout_secs: default_media_timeout_secs(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fetch_retry_delay_ms: default_fetch_retry_delay_ms(),
            job_timeout_secs: None,
        }
    }
}

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/merger").required(false))
            .add_source(config::File::with_name("/etc/merger/merger").required(false))
            // MERGER__KAFKA__BROKERS -> kafka.brokers
            .add_source(
                config::Environment::with_prefix("MERGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("storage.default_region", non_empty_env("AWS_REGION"))?
            .set_override_option("media.ffmpeg_bin", non_empty_env("FFMPEG_BIN"))?
            .set_override_option("media.ffprobe_bin", non_empty_env("FFPROBE_BIN"))?
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.broker_list().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.brokers".to_string()));
        }

        if self.kafka.group_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.group_id".to_string()));
        }

        if self.kafka.input_topic.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.input_topic".to_string()));
        }

        if self.kafka.security_protocol.uses_sasl() && self.kafka.sasl_username.is_none() {
            return Err(ConfigError::MissingRequired(
                "kafka.sasl_username (required for SASL)".to_string(),
            ));
        }

        if self.kafka.output_topic_partitions < 1 || self.kafka.output_topic_replication < 1 {
            return Err(ConfigError::InvalidValue {
                key: "kafka.output_topic_partitions/replication".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.worker.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.media.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "media.timeout_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Region used when a job does not name one
    pub fn default_region(&self) -> Option<&str> {
        self.storage
            .default_region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

impl KafkaConfig {
    /// Broker addresses with whitespace and empty entries removed
    pub fn broker_list(&self) -> Vec<String> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect()
    }

    /// Output topic, treating an empty name as unset
    pub fn output_topic(&self) -> Option<&str> {
        self.output_topic.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Dead-letter topic, treating an empty name as unset
    pub fn dead_letter_topic(&self) -> Option<&str> {
        self.dead_letter_topic
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }

    /// Build a base rdkafka ClientConfig from this configuration
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", self.broker_list().join(","));
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", &self.sasl_mechanism);
            if let Some(ref username) = self.sasl_username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl_password {
                config.set("sasl.password", password);
            }
        }

        config
    }

    /// Build a consumer ClientConfig; offsets are committed manually
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", self.start_offset.as_auto_offset_reset())
            .set("fetch.min.bytes", self.fetch_min_bytes.to_string())
            .set("fetch.max.bytes", self.fetch_max_bytes.to_string())
            .set("fetch.wait.max.ms", self.fetch_max_wait_ms.to_string())
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", self.max_poll_interval_ms.to_string());

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("request.timeout.ms", self.request_timeout_ms.to_string())
            .set("message.timeout.ms", (self.request_timeout_ms * 2).to_string());

        config
    }

    /// Build an admin ClientConfig
    pub fn build_admin_config(&self) -> ClientConfig {
        self.build_base_config()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl StorageConfig {
    /// Get per-transfer timeout as Duration
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

impl MediaConfig {
    /// Get the default tool deadline as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl WorkerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn fetch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    const MINIMAL: &str = r#"
        [kafka]
        brokers = "kafka-1:9092, kafka-2:9092,"
        input_topic = "merge.requests"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse(MINIMAL);

        assert_eq!(config.kafka.group_id, "media-merger");
        assert_eq!(config.kafka.start_offset, StartOffset::Last);
        assert_eq!(config.kafka.output_topic(), None);
        assert_eq!(config.media.audio_codec, "aac");
        assert_eq!(config.media.timeout(), Duration::from_secs(600));
        assert_eq!(config.storage.transfer_timeout(), Duration::from_secs(300));
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.worker.retry_backoff(), Duration::from_millis(300));
        assert_eq!(config.worker.scratch_dir, PathBuf::from("./tmp"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_broker_list_is_trimmed() {
        let config = parse(MINIMAL);
        assert_eq!(config.kafka.broker_list(), vec!["kafka-1:9092", "kafka-2:9092"]);

        let consumer = config.kafka.build_consumer_config();
        assert_eq!(consumer.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(consumer.get("enable.auto.commit"), Some("false"));
        assert_eq!(consumer.get("auto.offset.reset"), Some("latest"));
    }

    #[test]
    fn test_start_offset_first() {
        let config = parse(
            r#"
            [kafka]
            brokers = "localhost:9092"
            input_topic = "merge.requests"
            start_offset = "first"
            output_topic = ""
            "#,
        );

        assert_eq!(config.kafka.start_offset, StartOffset::First);
        assert_eq!(config.kafka.output_topic(), None);
        let consumer = config.kafka.build_consumer_config();
        assert_eq!(consumer.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_unknown_start_offset_is_rejected() {
        let result = config::Config::builder()
            .add_source(File::from_str(
                r#"
                [kafka]
                brokers = "localhost:9092"
                input_topic = "merge.requests"
                start_offset = "middle"
                "#,
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize::<Config>();

        assert!(result.is_err());
    }

    #[test]
    fn test_missing_brokers() {
        let mut config = parse(MINIMAL);
        config.kafka.brokers = " , ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = parse(MINIMAL);
        config.worker.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_sasl_requires_username() {
        let mut config = parse(MINIMAL);
        config.kafka.security_protocol = SecurityProtocol::SaslSsl;
        assert!(config.validate().is_err());

        config.kafka.sasl_username = Some("merger".to_string());
        assert!(config.validate().is_ok());
        let producer = config.kafka.build_producer_config();
        assert_eq!(producer.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(producer.get("security.protocol"), Some("sasl_ssl"));
    }

    #[test]
    fn test_blank_default_region_is_unset() {
        let mut config = parse(MINIMAL);
        assert_eq!(config.default_region(), None);

        config.storage.default_region = Some("  ".to_string());
        assert_eq!(config.default_region(), None);

        config.storage.default_region = Some("ap-southeast-1".to_string());
        assert_eq!(config.default_region(), Some("ap-southeast-1"));
    }
}
