use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Pipeline Metrics
    // ============================================================================

    /// Records resolved by a partition worker, by outcome
    /// (`archived`, `skipped`, `not_acknowledged`)
    pub static ref RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chargeback_archive_records_total", "Total records resolved by outcome"),
        &["topic", "outcome"]
    ).expect("metric can be created");

    /// Per-record faults by kind (`decode`, `write`, `processing`)
    pub static ref FAULTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chargeback_archive_faults_total", "Total per-record faults by kind"),
        &["topic", "kind"]
    ).expect("metric can be created");

    /// Records dropped because they were pulled before a rewind took effect
    pub static ref STALE_RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chargeback_archive_stale_records_total", "Total stale records dropped after a rewind"),
        &["topic"]
    ).expect("metric can be created");

    /// Next offset committed per partition
    pub static ref COMMITTED_OFFSET: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chargeback_archive_committed_offset", "Last committed offset per partition"),
        &["topic", "partition"]
    ).expect("metric can be created");

    /// Partition workers currently running
    pub static ref PARTITION_WORKERS_ACTIVE: IntGauge = IntGauge::new(
        "chargeback_archive_partition_workers_active",
        "Number of running partition workers"
    ).expect("metric can be created");

    // ============================================================================
    // Storage Metrics
    // ============================================================================

    /// Archive put latency
    pub static ref WRITE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chargeback_archive_write_latency_seconds", "Archive put latency in seconds")
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["outcome"] // ok, error, timeout
    ).expect("metric can be created");

    // ============================================================================
    // Consumer Metrics
    // ============================================================================

    /// Errors surfaced by the broker client while receiving
    pub static ref CONSUMER_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chargeback_archive_consumer_errors_total", "Total consumer receive errors"),
        &["topic"]
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(RECORDS_TOTAL.clone()))
            .expect("records_total can be registered");
        REGISTRY
            .register(Box::new(FAULTS_TOTAL.clone()))
            .expect("faults_total can be registered");
        REGISTRY
            .register(Box::new(STALE_RECORDS_TOTAL.clone()))
            .expect("stale_records_total can be registered");
        REGISTRY
            .register(Box::new(COMMITTED_OFFSET.clone()))
            .expect("committed_offset can be registered");
        REGISTRY
            .register(Box::new(PARTITION_WORKERS_ACTIVE.clone()))
            .expect("partition_workers_active can be registered");
        REGISTRY
            .register(Box::new(WRITE_LATENCY.clone()))
            .expect("write_latency can be registered");
        REGISTRY
            .register(Box::new(CONSUMER_ERRORS_TOTAL.clone()))
            .expect("consumer_errors_total can be registered");
    });
}
