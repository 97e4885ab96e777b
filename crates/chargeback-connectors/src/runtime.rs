//! Consumption loop and offset controller.
//!
//! Every assigned partition gets one [`PartitionWorker`] running as a tokio
//! task. A worker resolves one record completely before pulling the next:
//!
//! ```text
//! RECEIVED -> DECODED -> ARCHIVED -> ACKNOWLEDGED
//!     |            |
//!     |            +-> ARCHIVE_FAILED -> NOT_ACKED (rewind, redeliver)
//!     +-> DECODE_FAILED -> SKIPPED (ack)
//! ```
//!
//! Offsets only move through [`PartitionCursor::advance`], which runs after
//! the source accepted the commit. A record that is not acknowledged is
//! rewound to; records the source had already buffered past it are dropped as
//! stale until it comes around again.
//!
//! Cursors live exactly as long as their worker. When a partition is revoked
//! the worker is retired through [`ArchiveRuntime::retire`], and a later
//! assignment starts a new worker whose cursor admits whatever the source
//! delivers first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use chargeback_observability::metrics::{
    COMMITTED_OFFSET, FAULTS_TOTAL, PARTITION_WORKERS_ACTIVE, RECORDS_TOTAL, STALE_RECORDS_TOTAL,
};

use crate::error::{ConnectorError, PipelineFault, RecordContext, Result};
use crate::event::ChargebackEvent;
use crate::traits::{ArchiveSink, PartitionSource, SourceRecord};

/// Per-partition offset state.
///
/// `committed` is the next offset to consume (Kafka convention), so after
/// acknowledging offset 57 it is 58.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionCursor {
    committed: Option<i64>,
    rewind_to: Option<i64>,
    seek_pending: bool,
}

impl PartitionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> Option<i64> {
        self.committed
    }

    /// Offset the partition was rewound to and has not yet been acknowledged.
    pub fn rewind_target(&self) -> Option<i64> {
        self.rewind_to
    }

    /// Whether the last rewind still has to reach the source.
    pub fn seek_pending(&self) -> bool {
        self.seek_pending
    }

    /// Whether a pulled record should be processed.
    ///
    /// Records below the committed offset are duplicates. While a rewind is
    /// outstanding, records past the rewind target are stale leftovers.
    pub fn admit(&self, offset: i64) -> bool {
        let unprocessed = self.committed.map_or(true, |c| offset >= c);
        match self.rewind_to {
            Some(target) => unprocessed && offset <= target,
            None => unprocessed,
        }
    }

    /// Record that `offset` was acknowledged. Returns the new committed offset.
    pub fn advance(&mut self, offset: i64) -> i64 {
        let next = offset + 1;
        let committed = self.committed.map_or(next, |c| c.max(next));
        self.committed = Some(committed);
        self.rewind_to = None;
        self.seek_pending = false;
        committed
    }

    /// Enter the rewind state for `offset`.
    pub fn rewind(&mut self, offset: i64) {
        self.rewind_to = Some(offset);
        self.seek_pending = true;
    }

    pub fn seek_done(&mut self) {
        self.seek_pending = false;
    }
}

/// How a single admitted record was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Written and acknowledged.
    Archived { key: String },
    /// Undecodable; acknowledged without a write.
    Skipped { fault: PipelineFault },
    /// Left unacknowledged for redelivery.
    NotAcknowledged { fault: PipelineFault },
}

impl RecordOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RecordOutcome::Archived { .. } => "archived",
            RecordOutcome::Skipped { .. } => "skipped",
            RecordOutcome::NotAcknowledged { .. } => "not_acknowledged",
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, RecordOutcome::NotAcknowledged { .. })
    }
}

/// Counters kept by a worker over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub archived: u64,
    pub skipped: u64,
    pub not_acknowledged: u64,
    pub stale: u64,
    pub last_committed: Option<i64>,
}

impl WorkerStats {
    /// Fold the counters of a later worker for the same partition into `self`.
    pub fn absorb(&mut self, later: &WorkerStats) {
        self.received += later.received;
        self.archived += later.archived;
        self.skipped += later.skipped;
        self.not_acknowledged += later.not_acknowledged;
        self.stale += later.stale;
        if later.last_committed.is_some() {
            self.last_committed = later.last_committed;
        }
    }
}

/// Sequential consumer for one partition.
pub struct PartitionWorker<S> {
    source: S,
    sink: Arc<dyn ArchiveSink>,
    cursor: PartitionCursor,
    stats: WorkerStats,
    topic: String,
    partition: i32,
    partition_label: String,
}

impl<S: PartitionSource> PartitionWorker<S> {
    pub fn new(source: S, sink: Arc<dyn ArchiveSink>) -> Self {
        let topic = source.topic().to_string();
        let partition = source.partition();
        Self {
            source,
            sink,
            cursor: PartitionCursor::new(),
            stats: WorkerStats::default(),
            topic,
            partition,
            partition_label: partition.to_string(),
        }
    }

    pub fn cursor(&self) -> &PartitionCursor {
        &self.cursor
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Pull and resolve records until the source closes or `shutdown` flips
    /// to `true`. Dropping the sender also stops the worker.
    ///
    /// Shutdown is observed between records only; a write in progress
    /// finishes and is acknowledged as usual.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        PARTITION_WORKERS_ACTIVE.inc();
        tracing::info!(
            topic = %self.topic,
            partition = self.partition,
            sink = %self.sink.name(),
            "partition worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.cursor.seek_pending() {
                self.retry_rewind().await;
            }

            let record = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                record = self.source.next_record() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            self.step(record).await;
        }

        if let Err(e) = self.source.close(self.cursor.committed()).await {
            tracing::warn!(
                topic = %self.topic,
                partition = self.partition,
                error = %e,
                "failed to close partition source"
            );
        }

        PARTITION_WORKERS_ACTIVE.dec();
        tracing::info!(
            topic = %self.topic,
            partition = self.partition,
            received = self.stats.received,
            archived = self.stats.archived,
            skipped = self.stats.skipped,
            not_acknowledged = self.stats.not_acknowledged,
            stale = self.stats.stale,
            committed = ?self.cursor.committed(),
            "partition worker stopped"
        );
        self.stats
    }

    /// Resolve one pulled record. Returns `None` when the record was stale.
    pub async fn step(&mut self, record: SourceRecord) -> Option<RecordOutcome> {
        self.stats.received += 1;

        if !self.cursor.admit(record.offset) {
            self.stats.stale += 1;
            STALE_RECORDS_TOTAL.with_label_values(&[&self.topic]).inc();
            tracing::debug!(
                topic = %self.topic,
                partition = self.partition,
                offset = record.offset,
                committed = ?self.cursor.committed(),
                rewind_to = ?self.cursor.rewind_target(),
                "dropping stale record"
            );
            return None;
        }

        let outcome = self.process(&record).await;

        match &outcome {
            RecordOutcome::Archived { .. } => self.stats.archived += 1,
            RecordOutcome::Skipped { .. } => self.stats.skipped += 1,
            RecordOutcome::NotAcknowledged { .. } => {
                self.stats.not_acknowledged += 1;
                self.request_redelivery(record.offset).await;
            }
        }
        RECORDS_TOTAL
            .with_label_values(&[&self.topic, outcome.label()])
            .inc();

        Some(outcome)
    }

    async fn process(&mut self, record: &SourceRecord) -> RecordOutcome {
        let context = record.context();

        let event = match ChargebackEvent::decode(record.payload.as_deref(), &context) {
            Ok(event) => event,
            Err(fault) => {
                self.report(&fault);
                return match self.acknowledge(record.offset, None).await {
                    Ok(()) => RecordOutcome::Skipped { fault },
                    Err(commit_fault) => {
                        self.report(&commit_fault);
                        RecordOutcome::NotAcknowledged {
                            fault: commit_fault,
                        }
                    }
                };
            }
        };

        match self.sink.archive(&event, &context).await {
            Ok(key) => match self
                .acknowledge(record.offset, event.chargeback_id.as_deref())
                .await
            {
                Ok(()) => RecordOutcome::Archived { key },
                Err(fault) => {
                    self.report(&fault);
                    RecordOutcome::NotAcknowledged { fault }
                }
            },
            Err(fault) => {
                self.report(&fault);
                RecordOutcome::NotAcknowledged { fault }
            }
        }
    }

    async fn acknowledge(
        &mut self,
        offset: i64,
        chargeback_id: Option<&str>,
    ) -> std::result::Result<(), PipelineFault> {
        let next = offset + 1;
        self.source
            .commit(next)
            .await
            .map_err(|e| PipelineFault::Processing {
                context: RecordContext::new(self.topic.clone(), self.partition, offset),
                chargeback_id: chargeback_id.map(str::to_string),
                reason: format!("failed to commit offset {}: {}", next, e),
            })?;

        let committed = self.cursor.advance(offset);
        self.stats.last_committed = Some(committed);
        COMMITTED_OFFSET
            .with_label_values(&[&self.topic, &self.partition_label])
            .set(committed);
        Ok(())
    }

    async fn request_redelivery(&mut self, offset: i64) {
        self.cursor.rewind(offset);
        self.retry_rewind().await;
    }

    async fn retry_rewind(&mut self) {
        let Some(target) = self.cursor.rewind_target() else {
            self.cursor.seek_done();
            return;
        };
        match self.source.rewind(target).await {
            Ok(()) => self.cursor.seek_done(),
            Err(e) => tracing::warn!(
                topic = %self.topic,
                partition = self.partition,
                offset = target,
                error = %e,
                "rewind failed, retrying before next pull"
            ),
        }
    }

    fn report(&self, fault: &PipelineFault) {
        FAULTS_TOTAL
            .with_label_values(&[&self.topic, fault.kind()])
            .inc();

        let context = fault.context();
        match fault {
            PipelineFault::Decode { .. } => tracing::error!(
                topic = %context.topic,
                partition = context.partition,
                offset = context.offset,
                error = %fault,
                "undecodable record, skipping"
            ),
            PipelineFault::Write { key, .. } => tracing::error!(
                topic = %context.topic,
                partition = context.partition,
                offset = context.offset,
                chargeback_id = fault.chargeback_id().unwrap_or_default(),
                key = %key,
                error = %fault,
                "archive write failed, record will be redelivered"
            ),
            PipelineFault::Processing { .. } => tracing::error!(
                topic = %context.topic,
                partition = context.partition,
                offset = context.offset,
                chargeback_id = fault.chargeback_id().unwrap_or_default(),
                error = %fault,
                "processing failed, record will be redelivered"
            ),
        }
    }
}

/// Final per-partition statistics collected by [`ArchiveRuntime::join`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeSummary {
    pub partitions: BTreeMap<(String, i32), WorkerStats>,
}

impl RuntimeSummary {
    /// Counters summed across partitions. `last_committed` is left unset.
    pub fn totals(&self) -> WorkerStats {
        let mut totals = self
            .partitions
            .values()
            .fold(WorkerStats::default(), |mut acc, s| {
                acc.absorb(s);
                acc
            });
        totals.last_committed = None;
        totals
    }

    fn record(&mut self, id: (String, i32), stats: WorkerStats) {
        self.partitions.entry(id).or_default().absorb(&stats);
    }
}

/// Owns the partition workers of one archiver process.
///
/// A partition has at most one live worker. Retiring it frees the slot for a
/// new worker; the stats of every worker a partition had are merged into the
/// final [`RuntimeSummary`].
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// let mut runtime = ArchiveRuntime::new(sink, shutdown_rx);
/// runtime.spawn_partition(source)?;
/// shutdown_tx.send(true)?;
/// let summary = runtime.join().await;
/// ```
pub struct ArchiveRuntime {
    sink: Arc<dyn ArchiveSink>,
    shutdown: watch::Receiver<bool>,
    workers: HashMap<(String, i32), JoinHandle<WorkerStats>>,
    retired: RuntimeSummary,
}

impl ArchiveRuntime {
    pub fn new(sink: Arc<dyn ArchiveSink>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            sink,
            shutdown,
            workers: HashMap::new(),
            retired: RuntimeSummary::default(),
        }
    }

    /// Start a worker for the source's partition.
    pub fn spawn_partition<S>(&mut self, source: S) -> Result<()>
    where
        S: PartitionSource + 'static,
    {
        let id = (source.topic().to_string(), source.partition());
        if self.workers.contains_key(&id) {
            return Err(ConnectorError::RuntimeError(format!(
                "partition {}[{}] already has a worker",
                id.0, id.1
            )));
        }

        let worker = PartitionWorker::new(source, Arc::clone(&self.sink));
        let join_handle = tokio::spawn(worker.run(self.shutdown.clone()));
        self.workers.insert(id, join_handle);
        Ok(())
    }

    /// Partitions that have a worker, sorted.
    pub fn partitions(&self) -> Vec<(String, i32)> {
        let mut ids: Vec<_> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the partition has a worker that has not stopped yet.
    pub fn is_running(&self, topic: &str, partition: i32) -> bool {
        self.workers
            .get(&(topic.to_string(), partition))
            .map_or(false, |h| !h.is_finished())
    }

    /// Wait for the partition's worker to stop and release its slot.
    ///
    /// The caller must already have made the worker's source close, e.g. by
    /// revoking the partition. Returns `None` when the partition had no worker.
    pub async fn retire(&mut self, topic: &str, partition: i32) -> Option<WorkerStats> {
        let id = (topic.to_string(), partition);
        let handle = self.workers.remove(&id)?;
        let stats = await_worker(&id, handle).await?;
        self.retired.record(id, stats.clone());
        Some(stats)
    }

    /// Wait for every worker to stop.
    pub async fn join(self) -> RuntimeSummary {
        let mut summary = self.retired;
        for (id, handle) in self.workers {
            if let Some(stats) = await_worker(&id, handle).await {
                summary.record(id, stats);
            }
        }
        summary
    }
}

async fn await_worker(id: &(String, i32), handle: JoinHandle<WorkerStats>) -> Option<WorkerStats> {
    match handle.await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::error!(
                topic = %id.0,
                partition = id.1,
                error = %e,
                "partition worker aborted"
            );
            None
        }
    }
}
