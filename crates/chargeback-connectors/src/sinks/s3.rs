//! S3 Archive Sink
//!
//! Writes each chargeback event as its own JSON object, keyed by
//! [`ArchiveKeyGenerator`]. Every put is synchronous from the caller's point
//! of view and bounded by `write.timeout.ms`; a timeout is reported exactly
//! like any other store failure.
//!
//! ## Configuration
//!
//! | Key                   | Description                                  | Default       |
//! |-----------------------|----------------------------------------------|---------------|
//! | `s3.bucket`           | Bucket name                                  | `chargebacks` |
//! | `s3.region`           | AWS region                                   | `us-east-1`   |
//! | `s3.endpoint`         | Custom endpoint (MinIO, localstack)          | (none)        |
//! | `write.timeout.ms`    | Upper bound for a single put (ms)            | `10000`       |
//! | `archive.fallback.id` | File name used when `chargeback_id` is absent | `unknown`     |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use object_store::aws::AmazonS3Builder;
use object_store::{Attribute, Attributes, ClientOptions, ObjectStore, PutOptions, PutPayload};

use chargeback_observability::metrics::WRITE_LATENCY;

use crate::error::{ConnectorError, PipelineFault, RecordContext, Result};
use crate::event::ChargebackEvent;
use crate::sinks::archive_key::{ArchiveKey, ArchiveKeyGenerator, DEFAULT_FALLBACK_ID};
use crate::traits::ArchiveSink;

pub const DEFAULT_BUCKET: &str = "chargebacks";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Configuration parsed from the archiver's config map.
#[derive(Debug, Clone)]
pub struct S3SinkConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub write_timeout_ms: u64,
    pub fallback_id: String,
}

impl Default for S3SinkConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            write_timeout_ms: 10_000,
            fallback_id: DEFAULT_FALLBACK_ID.to_string(),
        }
    }
}

impl S3SinkConfig {
    /// Parse an S3SinkConfig from a string key-value map.
    pub fn from_config_map(config: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let bucket = non_blank(config.get("s3.bucket")).unwrap_or(defaults.bucket);
        let region = non_blank(config.get("s3.region")).unwrap_or(defaults.region);
        let endpoint = non_blank(config.get("s3.endpoint"));

        let write_timeout_ms = config
            .get("write.timeout.ms")
            .map(|s| {
                s.parse::<u64>().map_err(|e| {
                    ConnectorError::ConfigError(format!("invalid write.timeout.ms: {}", e))
                })
            })
            .transpose()?
            .unwrap_or(defaults.write_timeout_ms);

        if write_timeout_ms == 0 {
            return Err(ConnectorError::ConfigError(
                "'write.timeout.ms' must be greater than zero".to_string(),
            ));
        }

        let fallback_id =
            non_blank(config.get("archive.fallback.id")).unwrap_or(defaults.fallback_id);

        Ok(S3SinkConfig {
            bucket,
            region,
            endpoint,
            write_timeout_ms,
            fallback_id,
        })
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Archive sink backed by any [`ObjectStore`], normally S3.
pub struct S3ArchiveSink {
    name: String,
    config: S3SinkConfig,
    store: Arc<dyn ObjectStore>,
    keys: ArchiveKeyGenerator,
}

impl S3ArchiveSink {
    /// Build an S3 client from the environment plus `config`.
    ///
    /// Credentials come from the usual `AWS_*` variables; bucket, region and
    /// endpoint from `config` take precedence.
    pub fn connect(name: &str, config: S3SinkConfig) -> Result<Self> {
        let client_options = ClientOptions::new().with_timeout(config.write_timeout());

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_client_options(client_options);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build()?;

        tracing::info!(
            sink = %name,
            bucket = %config.bucket,
            region = %config.region,
            "S3 archive sink connected"
        );

        Ok(Self::with_store(name, config, Arc::new(store)))
    }

    /// Create with an injected ObjectStore (useful for testing).
    pub fn with_store(name: &str, config: S3SinkConfig, store: Arc<dyn ObjectStore>) -> Self {
        let keys = ArchiveKeyGenerator::new(config.fallback_id.clone());
        Self {
            name: name.to_string(),
            config,
            store,
            keys,
        }
    }

    pub fn config(&self) -> &S3SinkConfig {
        &self.config
    }

    pub fn key_generator(&self) -> &ArchiveKeyGenerator {
        &self.keys
    }

    /// Serialize `event` and put it under `key`.
    ///
    /// Serialization problems are processing faults; anything the store or
    /// the network does wrong, including hitting the timeout, is a write fault.
    pub async fn write_event(
        &self,
        event: &ChargebackEvent,
        key: &ArchiveKey,
        context: &RecordContext,
    ) -> std::result::Result<(), PipelineFault> {
        let body = event.to_json_bytes().map_err(|e| PipelineFault::Processing {
            context: context.clone(),
            chargeback_id: event.chargeback_id.clone(),
            reason: e.to_string(),
        })?;

        let write_fault = |reason: String| PipelineFault::Write {
            context: context.clone(),
            chargeback_id: event.chargeback_id.clone(),
            key: key.to_string(),
            reason,
        };

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, CONTENT_TYPE_JSON.into());
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        let path = key.to_object_path();
        let started = Instant::now();
        let put = self
            .store
            .put_opts(&path, PutPayload::from_bytes(body), options);

        match tokio::time::timeout(self.config.write_timeout(), put).await {
            Ok(Ok(_)) => {
                WRITE_LATENCY
                    .with_label_values(&["ok"])
                    .observe(started.elapsed().as_secs_f64());
                Ok(())
            }
            Ok(Err(e)) => {
                WRITE_LATENCY
                    .with_label_values(&["error"])
                    .observe(started.elapsed().as_secs_f64());
                Err(write_fault(format!("put to bucket '{}' failed: {}", self.config.bucket, e)))
            }
            Err(_) => {
                WRITE_LATENCY
                    .with_label_values(&["timeout"])
                    .observe(started.elapsed().as_secs_f64());
                Err(write_fault(format!(
                    "put to bucket '{}' timed out after {}ms",
                    self.config.bucket, self.config.write_timeout_ms
                )))
            }
        }
    }
}

#[async_trait]
impl ArchiveSink for S3ArchiveSink {
    async fn archive(
        &self,
        event: &ChargebackEvent,
        context: &RecordContext,
    ) -> std::result::Result<String, PipelineFault> {
        // One clock reading per write attempt.
        let write_time = Utc::now().naive_utc();
        let key = self.keys.generate(event, write_time);

        self.write_event(event, &key, context).await?;

        tracing::info!(
            sink = %self.name,
            chargeback_id = event.chargeback_id.as_deref().unwrap_or(self.keys.fallback_id()),
            key = %key,
            "archived chargeback"
        );
        Ok(key.to_string())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
