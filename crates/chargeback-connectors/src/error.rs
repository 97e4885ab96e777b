//! Error types for the chargeback archive pipeline.
//!
//! `ConnectorError` covers configuration, connectivity and runtime failures
//! outside the per-record path. Per-record failures are [`PipelineFault`]s so
//! the consumption loop can branch on the fault kind rather than on the
//! concrete error type that produced it.

use std::fmt;

use thiserror::Error;

/// Errors that can occur while configuring or running the pipeline.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Failed to connect to an external system.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error raised by the archive sink.
    #[error("Sink error: {0}")]
    SinkError(String),

    /// Error raised by the record source (broker client).
    #[error("Source error: {0}")]
    SourceError(String),

    /// Error in the partition runtime.
    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

impl From<serde_json::Error> for ConnectorError {
    fn from(e: serde_json::Error) -> Self {
        ConnectorError::SerializationError(e.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for ConnectorError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        ConnectorError::SourceError(e.to_string())
    }
}

impl From<object_store::Error> for ConnectorError {
    fn from(e: object_store::Error) -> Self {
        ConnectorError::SinkError(e.to_string())
    }
}

/// Where a record came from: topic, partition and offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordContext {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl RecordContext {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for RecordContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// Outcome of a failed decode-to-write pass over a single record.
///
/// - `Decode` is terminal for the record: the same bytes never decode
///   differently, so the record is acknowledged and skipped.
/// - `Write` and `Processing` leave the offset where it is and the record is
///   redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineFault {
    #[error("decode fault at {context}: {reason}")]
    Decode {
        context: RecordContext,
        reason: String,
    },

    #[error(
        "write fault for chargeback {} at {context} (key {key}): {reason}",
        .chargeback_id.as_deref().unwrap_or("<none>")
    )]
    Write {
        context: RecordContext,
        chargeback_id: Option<String>,
        key: String,
        reason: String,
    },

    #[error(
        "processing fault for chargeback {} at {context}: {reason}",
        .chargeback_id.as_deref().unwrap_or("<none>")
    )]
    Processing {
        context: RecordContext,
        chargeback_id: Option<String>,
        reason: String,
    },
}

impl PipelineFault {
    /// Whether redelivering the record can change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PipelineFault::Decode { .. })
    }

    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineFault::Decode { .. } => "decode",
            PipelineFault::Write { .. } => "write",
            PipelineFault::Processing { .. } => "processing",
        }
    }

    pub fn context(&self) -> &RecordContext {
        match self {
            PipelineFault::Decode { context, .. }
            | PipelineFault::Write { context, .. }
            | PipelineFault::Processing { context, .. } => context,
        }
    }

    /// Chargeback id of the event involved, when the record got far enough
    /// to have one.
    pub fn chargeback_id(&self) -> Option<&str> {
        match self {
            PipelineFault::Decode { .. } => None,
            PipelineFault::Write { chargeback_id, .. }
            | PipelineFault::Processing { chargeback_id, .. } => chargeback_id.as_deref(),
        }
    }
}
