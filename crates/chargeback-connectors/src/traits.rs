//! Seams between the consumption loop and its collaborators.
//!
//! A [`PartitionSource`] hands out records from exactly one partition and owns
//! the broker-side acknowledgment for it. An [`ArchiveSink`] persists a decoded
//! event. The loop in [`crate::runtime`] only talks to these traits, which keeps
//! it independent of the concrete broker client and object store.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{PipelineFault, RecordContext, Result};
use crate::event::ChargebackEvent;

/// A record pulled from one partition of the inbound topic.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Topic the record was consumed from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Broker timestamp in milliseconds since epoch, if any.
    pub timestamp: Option<i64>,
    /// Optional record key.
    pub key: Option<Bytes>,
    /// Record value. `None` for tombstones.
    pub payload: Option<Bytes>,
}

impl SourceRecord {
    pub fn context(&self) -> RecordContext {
        RecordContext::new(self.topic.clone(), self.partition, self.offset)
    }
}

/// One partition's worth of records plus its offset controls.
///
/// Implementations are driven by a single worker, so no method is ever called
/// concurrently for the same partition.
#[async_trait]
pub trait PartitionSource: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Wait for the next record. `None` means the partition is closed and
    /// the worker should stop.
    async fn next_record(&mut self) -> Option<SourceRecord>;

    /// Durably record that every offset below `next_offset` is processed.
    async fn commit(&mut self, next_offset: i64) -> Result<()>;

    /// Arrange for the record at `offset` to be delivered again.
    async fn rewind(&mut self, offset: i64) -> Result<()>;

    /// Called once when the worker stops. `committed` is the last offset
    /// passed to [`commit`](Self::commit), if any.
    async fn close(&mut self, _committed: Option<i64>) -> Result<()> {
        Ok(())
    }
}

/// Durable destination for decoded events.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Persist `event` and return the key it was stored under.
    ///
    /// Every failure is a [`PipelineFault`]; the caller only needs to know
    /// whether to acknowledge.
    async fn archive(
        &self,
        event: &ChargebackEvent,
        context: &RecordContext,
    ) -> std::result::Result<String, PipelineFault>;

    /// Return the unique name of this sink instance.
    fn name(&self) -> &str;
}
