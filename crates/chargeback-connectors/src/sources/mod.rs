//! Partition sources.
//!
//! [`kafka`] consumes the chargeback topic; [`memory`] replays a fixed record
//! log and is what the pipeline tests run against.

pub mod kafka;
pub mod memory;

pub use kafka::{KafkaPartitionSource, KafkaSource, KafkaSourceConfig, PartitionAssignments};
pub use memory::MemoryPartitionSource;
