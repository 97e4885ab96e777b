//! Configuration for an archiver process.
//!
//! Components parse their own settings from a flat string map, the same
//! `from_config_map` convention every source and sink follows. The service
//! builds that map from environment variables via [`ArchiverConfig::from_env`].

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::{ConnectorError, Result};
use crate::sinks::s3::S3SinkConfig;
use crate::sources::kafka::KafkaSourceConfig;

/// Environment variable backing each config key.
pub const ENV_KEYS: &[(&str, &str)] = &[
    ("KAFKA_BOOTSTRAP_SERVERS", "bootstrap.servers"),
    ("KAFKA_GROUP_ID", "group.id"),
    ("KAFKA_TOPIC", "topic"),
    ("KAFKA_AUTO_OFFSET_RESET", "auto.offset.reset"),
    ("KAFKA_SECURITY_PROTOCOL", "security.protocol"),
    ("KAFKA_SASL_MECHANISM", "sasl.mechanism"),
    ("KAFKA_SASL_USERNAME", "sasl.username"),
    ("KAFKA_SASL_PASSWORD", "sasl.password"),
    ("PARTITION_BUFFER_SIZE", "partition.buffer.size"),
    ("REDELIVERY_PAUSE_MS", "redelivery.pause.ms"),
    ("SEEK_TIMEOUT_MS", "seek.timeout.ms"),
    ("S3_BUCKET", "s3.bucket"),
    ("AWS_REGION", "s3.region"),
    ("S3_ENDPOINT", "s3.endpoint"),
    ("ARCHIVE_WRITE_TIMEOUT_MS", "write.timeout.ms"),
    ("ARCHIVE_FALLBACK_ID", "archive.fallback.id"),
    ("METRICS_ADDR", "metrics.addr"),
];

/// Everything needed to run one archiver.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Instance name used in logs.
    pub name: String,
    pub kafka: KafkaSourceConfig,
    pub s3: S3SinkConfig,
    /// Address for the `/metrics` endpoint. No server when unset.
    pub metrics_addr: Option<SocketAddr>,
}

impl ArchiverConfig {
    pub fn from_config_map(name: &str, config: &HashMap<String, String>) -> Result<Self> {
        let kafka = KafkaSourceConfig::from_config_map(config)?;
        let s3 = S3SinkConfig::from_config_map(config)?;

        let metrics_addr = config
            .get("metrics.addr")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<SocketAddr>().map_err(|e| {
                    ConnectorError::ConfigError(format!("invalid metrics.addr '{}': {}", s, e))
                })
            })
            .transpose()?;

        Ok(Self {
            name: name.to_string(),
            kafka,
            s3,
            metrics_addr,
        })
    }

    /// Read configuration from the process environment.
    pub fn from_env(name: &str) -> Result<Self> {
        Self::from_config_map(name, &config_map_from(|var| std::env::var(var).ok()))
    }
}

/// Build a config map from any variable lookup, skipping unset variables.
pub fn config_map_from<F>(lookup: F) -> HashMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    ENV_KEYS
        .iter()
        .filter_map(|&(var, key)| lookup(var).map(|value| (key.to_string(), value)))
        .collect()
}
