//! Archive sinks.
//!
//! [`archive_key`] derives where an event is stored; [`s3`] stores it.

pub mod archive_key;
pub mod s3;

pub use archive_key::{ArchiveKey, ArchiveKeyGenerator};
pub use s3::{S3ArchiveSink, S3SinkConfig};
