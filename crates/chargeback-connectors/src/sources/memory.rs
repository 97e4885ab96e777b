//! In-memory partition source.
//!
//! Serves a fixed log of records for one partition and records every commit,
//! rewind and close it receives. Rewinds reposition the read cursor, so a
//! record that was not acknowledged is delivered again on the next pull, the
//! same way a broker seek behaves.
//!
//! The source closes (returns `None`) once the log is drained or the pull
//! budget set with [`MemoryPartitionSource::with_pull_limit`] is spent.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::error::{ConnectorError, Result};
use crate::traits::{PartitionSource, SourceRecord};

/// Everything the consumption loop told the source.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OffsetLog {
    /// `next_offset` values passed to `commit`, in call order.
    pub commits: Vec<i64>,
    /// Offsets passed to `rewind`, in call order.
    pub rewinds: Vec<i64>,
    /// Offsets of every record handed out, in delivery order.
    pub delivered: Vec<i64>,
    /// Set once `close` has been called, holding its argument.
    pub closed_with: Option<Option<i64>>,
}

impl OffsetLog {
    /// The most recent commit, if any.
    pub fn last_commit(&self) -> Option<i64> {
        self.commits.last().copied()
    }
}

/// Cloneable view of a source's [`OffsetLog`], kept by tests after the source
/// has been moved into a worker.
#[derive(Debug, Clone, Default)]
pub struct OffsetLogHandle(Arc<Mutex<OffsetLog>>);

impl OffsetLogHandle {
    pub async fn snapshot(&self) -> OffsetLog {
        self.0.lock().await.clone()
    }
}

pub struct MemoryPartitionSource {
    topic: String,
    partition: i32,
    records: Vec<SourceRecord>,
    position: usize,
    pulls_left: Option<usize>,
    fail_commits: usize,
    rewind_lag: usize,
    pending_rewind: Option<(usize, usize)>,
    log: OffsetLogHandle,
}

impl MemoryPartitionSource {
    /// Build a source whose records start at `base_offset` and carry the
    /// given payloads in order. `None` payloads are tombstones.
    pub fn new<P>(topic: &str, partition: i32, base_offset: i64, payloads: P) -> Self
    where
        P: IntoIterator<Item = Option<Vec<u8>>>,
    {
        let records = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| SourceRecord {
                topic: topic.to_string(),
                partition,
                offset: base_offset + i as i64,
                timestamp: None,
                key: None,
                payload: payload.map(Bytes::from),
            })
            .collect();

        Self {
            topic: topic.to_string(),
            partition,
            records,
            position: 0,
            pulls_left: None,
            fail_commits: 0,
            rewind_lag: 0,
            pending_rewind: None,
            log: OffsetLogHandle::default(),
        }
    }

    /// Shorthand for string payloads starting at offset 0.
    pub fn from_json(topic: &str, partition: i32, payloads: &[&str]) -> Self {
        Self::new(
            topic,
            partition,
            0,
            payloads.iter().map(|p| Some(p.as_bytes().to_vec())),
        )
    }

    /// Close after `limit` pulls, even if records remain.
    pub fn with_pull_limit(mut self, limit: usize) -> Self {
        self.pulls_left = Some(limit);
        self
    }

    /// Reject the first `count` commits.
    pub fn with_failing_commits(mut self, count: usize) -> Self {
        self.fail_commits = count;
        self
    }

    /// Keep delivering `lag` records from the old position after a rewind,
    /// like a consumer that already had them buffered.
    pub fn with_rewind_lag(mut self, lag: usize) -> Self {
        self.rewind_lag = lag;
        self
    }

    pub fn log_handle(&self) -> OffsetLogHandle {
        self.log.clone()
    }

    fn index_of(&self, offset: i64) -> Option<usize> {
        let base = self.records.first()?.offset;
        let idx = usize::try_from(offset - base).ok()?;
        (idx <= self.records.len()).then_some(idx)
    }
}

#[async_trait]
impl PartitionSource for MemoryPartitionSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_record(&mut self) -> Option<SourceRecord> {
        if let Some(left) = self.pulls_left.as_mut() {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }

        if let Some((target, lag)) = self.pending_rewind.take() {
            if lag > 0 && self.position < self.records.len() {
                self.pending_rewind = Some((target, lag - 1));
            } else {
                self.position = target;
            }
        }

        let record = self.records.get(self.position)?.clone();
        self.position += 1;
        self.log.0.lock().await.delivered.push(record.offset);
        Some(record)
    }

    async fn commit(&mut self, next_offset: i64) -> Result<()> {
        if self.fail_commits > 0 {
            self.fail_commits -= 1;
            return Err(ConnectorError::SourceError(format!(
                "commit of offset {} rejected",
                next_offset
            )));
        }
        self.log.0.lock().await.commits.push(next_offset);
        Ok(())
    }

    async fn rewind(&mut self, offset: i64) -> Result<()> {
        let target = self.index_of(offset).ok_or_else(|| {
            ConnectorError::SourceError(format!(
                "offset {} is outside {}[{}]",
                offset, self.topic, self.partition
            ))
        })?;
        self.log.0.lock().await.rewinds.push(offset);
        self.pending_rewind = Some((target, self.rewind_lag));
        Ok(())
    }

    async fn close(&mut self, committed: Option<i64>) -> Result<()> {
        self.log.0.lock().await.closed_with = Some(committed);
        Ok(())
    }
}
