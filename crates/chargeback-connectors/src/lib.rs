//! Chargeback Archive Pipeline
//!
//! Consumes chargeback events from a Kafka topic and archives each one as a
//! JSON object in S3 under an hourly-partitioned key.
//!
//! ## Architecture
//!
//! - **Event**: `ChargebackEvent` decoding and canonical JSON encoding.
//! - **Sinks**: archive key generation and the S3 archive writer.
//! - **Sources**: the Kafka dispatcher and an in-memory partition source.
//! - **Runtime**: per-partition workers that decide, record by record, whether
//!   to acknowledge, skip or rewind.
//!
//! ## Delivery
//!
//! At least once. Undecodable records are acknowledged and skipped; any other
//! failure leaves the offset where it is and the record is redelivered.

pub mod config;
pub mod error;
pub mod event;
pub mod runtime;
pub mod sinks;
pub mod sources;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use config::ArchiverConfig;
pub use error::{ConnectorError, PipelineFault, RecordContext, Result};
pub use event::ChargebackEvent;
pub use runtime::{ArchiveRuntime, PartitionCursor, PartitionWorker, RecordOutcome, WorkerStats};
pub use sinks::{ArchiveKey, ArchiveKeyGenerator, S3ArchiveSink, S3SinkConfig};
pub use sources::{KafkaSource, KafkaSourceConfig, MemoryPartitionSource};
pub use traits::{ArchiveSink, PartitionSource, SourceRecord};
