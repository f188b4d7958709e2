//! Publish one merge job to the input topic.
//!
//! ```text
//! enqueue-job <job.json>
//! enqueue-job -            # read the job from stdin
//! ```
//!
//! Uses the same configuration sources as the worker.

use anyhow::{bail, Context, Result};
use merger::config::Config;
use merger::job::MergeJob;
use merger::producer::{self, EventSink, KafkaEventSink};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::info;

const USAGE: &str = "usage: enqueue-job <job.json | ->";

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let source = match (args.next(), args.next()) {
        (Some(arg), None) if arg == "-h" || arg == "--help" => {
            println!("{}", USAGE);
            return Ok(());
        }
        (Some(source), None) => source,
        _ => bail!(USAGE),
    };

    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let payload = read_job(&source).await?;
    let job = MergeJob::decode(&payload).context("Job file is not a valid merge job")?;

    let kafka_producer =
        producer::create_producer(&config.kafka).context("Failed to create Kafka producer")?;
    let sink = KafkaEventSink::new(
        kafka_producer.clone(),
        &config.kafka.input_topic,
        config.kafka.request_timeout(),
    );

    sink.publish(&job.video_id, &payload)
        .await
        .context("Failed to publish job")?;
    producer::flush(&kafka_producer, Duration::from_secs(10))?;

    info!(
        topic = %sink.topic(),
        video_id = %job.video_id,
        "Job enqueued"
    );

    Ok(())
}

async fn read_job(source: &str) -> Result<Vec<u8>> {
    if source == "-" {
        let mut payload = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut payload)
            .await
            .context("Failed to read job from stdin")?;
        return Ok(payload);
    }

    tokio::fs::read(source)
        .await
        .with_context(|| format!("Failed to read {}", source))
}
