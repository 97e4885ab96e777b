//! Chargeback Archiver
//!
//! Consumes chargeback events from Kafka and writes each one to S3 as a JSON
//! object.
//!
//! # Environment Variables
//!
//! - `KAFKA_BOOTSTRAP_SERVERS`: Kafka brokers (required)
//! - `KAFKA_GROUP_ID`: Consumer group (required)
//! - `KAFKA_TOPIC`: Topic to archive (default: chargebacks)
//! - `KAFKA_AUTO_OFFSET_RESET`: `earliest` or `latest` (default: earliest)
//! - `KAFKA_SECURITY_PROTOCOL`, `KAFKA_SASL_MECHANISM`, `KAFKA_SASL_USERNAME`,
//!   `KAFKA_SASL_PASSWORD`: broker authentication (optional)
//! - `PARTITION_BUFFER_SIZE`: Records prefetched per partition (default: 256)
//! - `REDELIVERY_PAUSE_MS`: Pause before redelivering a failed record (default: 1000)
//! - `SEEK_TIMEOUT_MS`: Seek timeout (default: 5000)
//! - `S3_BUCKET`: Archive bucket (default: chargebacks)
//! - `AWS_REGION`: AWS region (default: us-east-1)
//! - `S3_ENDPOINT`: MinIO/S3 endpoint (optional)
//! - `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`: S3 credentials
//! - `ARCHIVE_WRITE_TIMEOUT_MS`: Per-object put timeout (default: 10000)
//! - `ARCHIVE_FALLBACK_ID`: File name for events without an id (default: unknown)
//! - `METRICS_ADDR`: Serve Prometheus metrics on this address (optional)
//! - `RUST_LOG`: Log filter (default: info)
//!
//! # Example
//!
//! ```bash
//! export KAFKA_BOOTSTRAP_SERVERS=localhost:9092
//! export KAFKA_GROUP_ID=chargeback-archiver
//! export S3_ENDPOINT=http://localhost:9000
//! export AWS_ACCESS_KEY_ID=minioadmin
//! export AWS_SECRET_ACCESS_KEY=minioadmin
//! export METRICS_ADDR=0.0.0.0:9102
//! cargo run --bin chargeback-archiver
//! ```

use std::sync::Arc;

use chargeback_connectors::{ArchiveRuntime, ArchiverConfig, KafkaSource, S3ArchiveSink};
use chargeback_observability::exporter;
use tokio::sync::watch;
use tracing::{error, info};

const SERVICE_NAME: &str = "chargeback-archiver";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ArchiverConfig::from_env(SERVICE_NAME)?;
    info!(
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        bucket = %config.s3.bucket,
        "Chargeback archiver starting"
    );

    chargeback_observability::init();
    if let Some(addr) = config.metrics_addr {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "Metrics server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, exporter::create_metrics_router()).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let sink = Arc::new(S3ArchiveSink::connect(SERVICE_NAME, config.s3.clone())?);
    let mut source = KafkaSource::connect(SERVICE_NAME, config.kafka.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
    }

    let mut runtime = ArchiveRuntime::new(sink, shutdown_rx.clone());
    let result = source.run(&mut runtime, shutdown_rx).await;
    if let Err(e) = &result {
        error!(error = %e, "Dispatcher failed, stopping partition workers");
    }

    // Workers finish their current record and commit before exiting.
    let _ = shutdown_tx.send(true);
    let summary = runtime.join().await;
    let totals = summary.totals();
    info!(
        partitions = summary.partitions.len(),
        received = totals.received,
        archived = totals.archived,
        skipped = totals.skipped,
        not_acknowledged = totals.not_acknowledged,
        "Chargeback archiver stopped"
    );

    result.map_err(Into::into)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
