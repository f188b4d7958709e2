use anyhow::{Context, Result};
use merger::config::Config;
use merger::consumer::{ConsumerError, ConsumptionLoop, RetryPolicy};
use merger::handler::{HandlerSettings, MergeJobHandler};
use merger::kafka_consumer::KafkaSource;
use merger::media::Ffmpeg;
use merger::producer::{self, KafkaEventSink};
use merger::storage::S3ObjectStore;
use merger::topics::{self, KafkaTopicAdmin};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PROVISION_ATTEMPTS: u32 = 5;
const PROVISION_BACKOFF: Duration = Duration::from_millis(300);
const PROVISION_BUDGET: Duration = Duration::from_secs(15);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        input_topic = %config.kafka.input_topic,
        "Starting media merge worker"
    );

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    if config.kafka.auto_create_topics {
        provision_topics(&config, &cancel).await;
    }

    // Initialize components
    let store = Arc::new(S3ObjectStore::new(&config.storage));

    let ffmpeg = Ffmpeg::new(&config.media);
    match ffmpeg.ensure_binaries() {
        Ok((ffmpeg_path, ffprobe_path)) => info!(
            ffmpeg = %ffmpeg_path.display(),
            ffprobe = %ffprobe_path.display(),
            "Media tools resolved"
        ),
        Err(e) => warn!(error = %e, "Media tools not available, merges will fail until installed"),
    }

    let kafka_producer =
        producer::create_producer(&config.kafka).context("Failed to create Kafka producer")?;
    let send_timeout = config.kafka.request_timeout();

    let mut handler = MergeJobHandler::new(
        store,
        Arc::new(ffmpeg),
        HandlerSettings::from_config(&config),
    );
    if let Some(topic) = config.kafka.output_topic() {
        handler = handler.with_results(Arc::new(KafkaEventSink::new(
            kafka_producer.clone(),
            topic,
            send_timeout,
        )));
    } else {
        warn!("No output topic configured, merge results will not be published");
    }
    if let Some(topic) = config.kafka.dead_letter_topic() {
        handler = handler.with_dead_letters(Arc::new(KafkaEventSink::new(
            kafka_producer.clone(),
            topic,
            send_timeout,
        )));
    }

    let source = KafkaSource::new(&config.kafka).context("Failed to initialize Kafka consumer")?;
    let consumption = ConsumptionLoop::new(source, handler, RetryPolicy::from(&config.worker));

    info!("Merge worker started successfully");

    match consumption.run(&cancel).await {
        Ok(()) | Err(ConsumerError::Cancelled) => info!("Consumption loop stopped"),
        Err(e) => error!(error = %e, "Consumption loop failed"),
    }

    info!("Shutting down merge worker");

    if let Err(e) = producer::flush(&kafka_producer, FLUSH_TIMEOUT) {
        warn!("Failed to flush producer on shutdown: {}", e);
    }

    info!("Merge worker stopped");

    Ok(())
}

/// Ensure the output and dead-letter topics exist; failures only warn
async fn provision_topics(config: &Config, cancel: &CancellationToken) {
    let specs = topics::output_topics(&config.kafka);
    if specs.is_empty() {
        return;
    }

    let admin = match KafkaTopicAdmin::new(&config.kafka) {
        Ok(admin) => admin,
        Err(e) => {
            warn!(error = %e, "Skipping topic provisioning");
            return;
        }
    };

    let provision = async {
        for spec in &specs {
            if let Err(e) =
                topics::ensure_topic(&admin, spec, PROVISION_ATTEMPTS, PROVISION_BACKOFF, cancel)
                    .await
            {
                warn!(topic = %spec.name, error = %e, "Could not ensure topic");
            }
        }
    };

    if tokio::time::timeout(PROVISION_BUDGET, provision).await.is_err() {
        warn!(
            budget_secs = PROVISION_BUDGET.as_secs(),
            "Topic provisioning timed out, continuing startup"
        );
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
