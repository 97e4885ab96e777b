//! End-to-end tests for the consume-archive-commit pipeline.
//!
//! Records come from `MemoryPartitionSource`; events are written by the real
//! `S3ArchiveSink` into an in-memory object store that can be taken down.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use tokio::sync::watch;

use chargeback_connectors::{
    ArchiveRuntime, MemoryPartitionSource, PartitionWorker, S3ArchiveSink, S3SinkConfig,
};
use chargeback_observability::metrics::RECORDS_TOTAL;

/// In-memory store that counts puts and fails the first `failures` of them.
/// Puts to a key containing `poison` always fail.
#[derive(Debug)]
struct TestStore {
    inner: InMemory,
    puts: AtomicUsize,
    failures: AtomicUsize,
    poison: Option<&'static str>,
}

impl TestStore {
    fn healthy() -> Arc<Self> {
        Self::failing(0)
    }

    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemory::new(),
            puts: AtomicUsize::new(0),
            failures: AtomicUsize::new(failures),
            poison: None,
        })
    }

    fn poisoned(marker: &'static str) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemory::new(),
            puts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            poison: Some(marker),
        })
    }

    fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .list(None)
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .unwrap();
        keys.sort();
        keys
    }

    async fn body(&self, key: &str) -> String {
        let bytes = self
            .inner
            .get(&ObjectPath::from(key))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }
}

impl fmt::Display for TestStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestStore")
    }
}

#[async_trait]
impl ObjectStore for TestStore {
    async fn put_opts(
        &self,
        location: &ObjectPath,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let poisoned = self
            .poison
            .map_or(false, |marker| location.to_string().contains(marker));
        if fail || poisoned {
            return Err(object_store::Error::Generic {
                store: "test",
                source: "service unavailable".into(),
            });
        }
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &ObjectPath,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &ObjectPath,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&ObjectPath>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&ObjectPath>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
    ) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

fn sink(store: &Arc<TestStore>) -> Arc<S3ArchiveSink> {
    sink_with(store, S3SinkConfig::default())
}

fn sink_with(store: &Arc<TestStore>, config: S3SinkConfig) -> Arc<S3ArchiveSink> {
    Arc::new(S3ArchiveSink::with_store(
        "pipeline-test",
        config,
        Arc::clone(store) as Arc<dyn ObjectStore>,
    ))
}

fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap()
}

fn assert_suffix(file_name: &str, id: &str) {
    let stem = file_name.strip_suffix(".json").unwrap();
    let (prefix, suffix) = stem.rsplit_once('_').unwrap();
    assert_eq!(prefix, id);
    assert_eq!(suffix.len(), 8, "suffix of {}", file_name);
}

// ---------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------

#[tokio::test]
async fn test_event_archived_under_event_hour() {
    let store = TestStore::healthy();
    let source = MemoryPartitionSource::from_json(
        "it-scenario-a",
        0,
        &[r#"{"chargeback_id":"CB123","amount":125.50,"currency":"USD","timestamp":"2024-03-15T10:30:00"}"#],
    );
    let log = source.log_handle();
    let (_tx, rx) = watch::channel(false);

    let stats = PartitionWorker::new(source, sink(&store)).run(rx).await;
    assert_eq!(stats.archived, 1);

    let keys = store.keys().await;
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("year=2024/month=03/day=15/hour=10/"));
    assert_suffix(file_name(&keys[0]), "CB123");

    let body = store.body(&keys[0]).await;
    assert!(body.contains(r#""chargeback_id":"CB123""#));
    assert!(body.contains(r#""amount":125.50"#));
    assert!(body.contains(r#""merchant_id":null"#));

    assert_eq!(log.snapshot().await.commits, vec![1]);
}

#[tokio::test]
async fn test_malformed_payload_is_skipped_and_committed() {
    let store = TestStore::healthy();
    let source =
        MemoryPartitionSource::new("it-scenario-b", 2, 57, vec![Some(br#"{"chargeback_id":"#.to_vec())]);
    let log = source.log_handle();
    let (_tx, rx) = watch::channel(false);

    let stats = PartitionWorker::new(source, sink(&store)).run(rx).await;

    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.last_committed, Some(58));
    assert_eq!(store.puts(), 0);
    let snapshot = log.snapshot().await;
    assert_eq!(snapshot.commits, vec![58]);
    assert!(snapshot.rewinds.is_empty());
}

#[tokio::test]
async fn test_store_failure_leaves_offset_and_redelivers() {
    let store = TestStore::failing(usize::MAX);
    let source = MemoryPartitionSource::from_json(
        "it-scenario-c",
        0,
        &[r#"{"chargeback_id":"CB1"}"#, r#"{"chargeback_id":"CB2"}"#],
    )
    .with_pull_limit(3);
    let log = source.log_handle();
    let (_tx, rx) = watch::channel(false);

    let stats = PartitionWorker::new(source, sink(&store)).run(rx).await;

    assert_eq!(stats.not_acknowledged, 3);
    assert_eq!(stats.last_committed, None);
    let snapshot = log.snapshot().await;
    assert!(snapshot.commits.is_empty());
    assert_eq!(snapshot.delivered, vec![0, 0, 0]);
    assert_eq!(snapshot.rewinds, vec![0, 0, 0]);
    assert_eq!(snapshot.closed_with, Some(None));
    assert!(store.keys().await.is_empty());
}

#[tokio::test]
async fn test_redelivered_record_archived_once_store_recovers() {
    let store = TestStore::failing(2);
    let source = MemoryPartitionSource::from_json(
        "it-recovery",
        0,
        &[r#"{"chargeback_id":"CB1"}"#, r#"{"chargeback_id":"CB2"}"#],
    );
    let log = source.log_handle();
    let (_tx, rx) = watch::channel(false);

    let stats = PartitionWorker::new(source, sink(&store)).run(rx).await;

    assert_eq!(stats.archived, 2);
    assert_eq!(stats.not_acknowledged, 2);
    let snapshot = log.snapshot().await;
    assert_eq!(snapshot.delivered, vec![0, 0, 0, 1]);
    assert_eq!(snapshot.commits, vec![1, 2]);
    assert_eq!(store.keys().await.len(), 2);
}

#[tokio::test]
async fn test_missing_id_uses_configured_fallback() {
    let store = TestStore::healthy();
    let config = S3SinkConfig {
        fallback_id: "no-chargeback-id".to_string(),
        ..Default::default()
    };
    let source = MemoryPartitionSource::from_json(
        "it-scenario-d",
        0,
        &[
            r#"{"transaction_id":"TX9","timestamp":"2024-03-15T10:30:00"}"#,
            r#"{"chargeback_id":"","timestamp":"2024-03-15T10:30:00"}"#,
        ],
    );
    let (_tx, rx) = watch::channel(false);

    PartitionWorker::new(source, sink_with(&store, config)).run(rx).await;

    let keys = store.keys().await;
    assert_eq!(keys.len(), 2);
    for key in &keys {
        assert_suffix(file_name(key), "no-chargeback-id");
    }
}

// ---------------------------------------------------------------
// Properties
// ---------------------------------------------------------------

#[tokio::test]
async fn test_missing_timestamp_partitions_by_write_time() {
    let store = TestStore::healthy();
    let source = MemoryPartitionSource::from_json("it-write-time", 0, &[r#"{"chargeback_id":"CB7"}"#]);
    let (_tx, rx) = watch::channel(false);

    let before = Utc::now().naive_utc();
    let stats = PartitionWorker::new(source, sink(&store)).run(rx).await;
    let after = Utc::now().naive_utc() + ChronoDuration::seconds(1);
    assert_eq!(stats.archived, 1);

    let keys = store.keys().await;
    let hour = |t: chrono::NaiveDateTime| t.format("year=%Y/month=%m/day=%d/hour=%H/").to_string();
    assert!(
        keys[0].starts_with(&hour(before)) || keys[0].starts_with(&hour(after)),
        "unexpected key {}",
        keys[0]
    );
}

#[tokio::test]
async fn test_redelivery_writes_a_second_object() {
    // Commit fails after a successful write, so the record is archived twice
    // under distinct keys.
    let store = TestStore::healthy();
    let source = MemoryPartitionSource::from_json(
        "it-duplicates",
        0,
        &[r#"{"chargeback_id":"CB5","timestamp":"2024-03-15T10:30:00"}"#],
    )
    .with_failing_commits(1);
    let log = source.log_handle();
    let (_tx, rx) = watch::channel(false);

    PartitionWorker::new(source, sink(&store)).run(rx).await;

    let keys = store.keys().await;
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
    for key in &keys {
        assert!(key.starts_with("year=2024/month=03/day=15/hour=10/CB5_"));
    }
    assert_eq!(log.snapshot().await.commits, vec![1]);
}

#[tokio::test]
async fn test_commits_follow_delivery_order_per_partition() {
    let store = TestStore::failing(3);
    let payloads = [
        r#"{"chargeback_id":"A"}"#,
        "not json",
        r#"{"chargeback_id":"B"}"#,
        r#"{"chargeback_id":"C"}"#,
        "",
        r#"{"chargeback_id":"D"}"#,
    ];
    let (_tx, rx) = watch::channel(false);
    let mut runtime = ArchiveRuntime::new(sink(&store), rx);

    let mut logs = Vec::new();
    for partition in 0..3 {
        let source = MemoryPartitionSource::from_json("it-ordering", partition, &payloads)
            .with_rewind_lag(1);
        logs.push(source.log_handle());
        runtime.spawn_partition(source).unwrap();
    }

    let summary = runtime.join().await;
    assert_eq!(summary.partitions.len(), 3);

    for log in logs {
        let snapshot = log.snapshot().await;
        assert_eq!(snapshot.commits, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(snapshot.closed_with, Some(Some(6)));
    }

    let totals = summary.totals();
    assert_eq!(totals.archived, 12);
    assert_eq!(totals.skipped, 6);
    assert_eq!(totals.not_acknowledged, 3);
    assert_eq!(store.keys().await.len(), 12);
}

#[tokio::test]
async fn test_shutdown_stops_workers_and_keeps_commits() {
    let store = TestStore::healthy();
    let (tx, rx) = watch::channel(false);
    let mut runtime = ArchiveRuntime::new(sink(&store), rx);

    tx.send(true).unwrap();

    let source = MemoryPartitionSource::from_json("it-shutdown", 0, &[r#"{"chargeback_id":"S1"}"#]);
    let log = source.log_handle();
    runtime.spawn_partition(source).unwrap();
    let summary = runtime.join().await;

    assert_eq!(summary.totals().received, 0);
    let snapshot = log.snapshot().await;
    assert!(snapshot.delivered.is_empty());
    assert_eq!(snapshot.closed_with, Some(None));
    assert_eq!(store.puts(), 0);
}

#[tokio::test]
async fn test_outcomes_are_counted() {
    let store = TestStore::healthy();
    let source = MemoryPartitionSource::from_json(
        "it-metrics",
        0,
        &[r#"{"chargeback_id":"M1"}"#, "{", r#"{"chargeback_id":"M2"}"#],
    );
    let (_tx, rx) = watch::channel(false);

    PartitionWorker::new(source, sink(&store)).run(rx).await;

    assert_eq!(
        RECORDS_TOTAL.with_label_values(&["it-metrics", "archived"]).get(),
        2
    );
    assert_eq!(
        RECORDS_TOTAL.with_label_values(&["it-metrics", "skipped"]).get(),
        1
    );
}

#[tokio::test]
async fn test_stuck_partition_does_not_hold_back_others() {
    let store = TestStore::poisoned("STUCK");
    let (_tx, rx) = watch::channel(false);
    let mut runtime = ArchiveRuntime::new(sink(&store), rx);

    let stuck = MemoryPartitionSource::from_json(
        "it-independent",
        0,
        &[r#"{"chargeback_id":"STUCK","timestamp":"2024-03-15T10:30:00"}"#],
    )
    .with_pull_limit(4);
    let stuck_log = stuck.log_handle();
    let healthy = MemoryPartitionSource::from_json(
        "it-independent",
        1,
        &[
            r#"{"chargeback_id":"H1"}"#,
            r#"{"chargeback_id":"H2"}"#,
            r#"{"chargeback_id":"H3"}"#,
        ],
    );
    let healthy_log = healthy.log_handle();
    runtime.spawn_partition(stuck).unwrap();
    runtime.spawn_partition(healthy).unwrap();

    let summary = runtime.join().await;
    let p0 = &summary.partitions[&("it-independent".to_string(), 0)];
    let p1 = &summary.partitions[&("it-independent".to_string(), 1)];
    assert_eq!(p0.not_acknowledged, 4);
    assert_eq!(p0.last_committed, None);
    assert_eq!(p1.archived, 3);

    let stuck_snapshot = stuck_log.snapshot().await;
    assert!(stuck_snapshot.commits.is_empty());
    assert_eq!(stuck_snapshot.rewinds, vec![0, 0, 0, 0]);
    assert_eq!(healthy_log.snapshot().await.commits, vec![1, 2, 3]);
    assert_eq!(store.keys().await.len(), 3);
}

#[tokio::test]
async fn test_wide_amount_is_archived_verbatim() {
    let store = TestStore::healthy();
    let source = MemoryPartitionSource::from_json(
        "it-wide-amount",
        0,
        &[r#"{"chargeback_id":"CB1","amount":123456789012345678901234567890.5,"timestamp":"2024-03-15T10:30:00"}"#],
    );
    let log = source.log_handle();
    let (_tx, rx) = watch::channel(false);

    let stats = PartitionWorker::new(source, sink(&store)).run(rx).await;
    assert_eq!(stats.archived, 1);
    assert_eq!(stats.skipped, 0);

    let keys = store.keys().await;
    assert_eq!(keys.len(), 1);
    let body = store.body(&keys[0]).await;
    assert!(body.contains(r#""amount":123456789012345678901234567890.5"#));
    assert_eq!(log.snapshot().await.commits, vec![1]);
}
