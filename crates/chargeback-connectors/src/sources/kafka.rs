//! Kafka Source
//!
//! Subscribes to the chargeback topic with manual offset management and runs
//! one [`PartitionWorker`](crate::runtime::PartitionWorker) per assigned
//! partition. Each worker sees a [`KafkaPartitionSource`]: the partition's own
//! queue split off the shared consumer, plus commit and seek access to it.
//! Rebalances are followed through [`PartitionAssignments`].
//!
//! ## Configuration
//!
//! | Key                     | Description                                     | Default       |
//! |-------------------------|-------------------------------------------------|---------------|
//! | `bootstrap.servers`     | Kafka broker addresses                          | required      |
//! | `group.id`              | Consumer group ID                               | required      |
//! | `topic`                 | Topic to subscribe to                           | `chargebacks` |
//! | `auto.offset.reset`     | Where to start consuming: `earliest`/`latest`   | `earliest`    |
//! | `security.protocol`     | Security protocol: `PLAINTEXT`, `SASL_SSL`, etc | `PLAINTEXT`   |
//! | `sasl.mechanism`        | SASL mechanism (e.g. `PLAIN`, `SCRAM-SHA-256`)  | (none)        |
//! | `sasl.username`         | SASL username                                   | (none)        |
//! | `sasl.password`         | SASL password                                   | (none)        |
//! | `partition.buffer.size` | Records prefetched per partition                | `256`         |
//! | `redelivery.pause.ms`   | Pause before seeking back to a failed record    | `1000`        |
//! | `seek.timeout.ms`       | Timeout for a single seek                       | `5000`        |
//!
//! Auto commit and auto offset store are always disabled.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};

use chargeback_observability::metrics::CONSUMER_ERRORS_TOTAL;

use crate::error::{ConnectorError, Result};
use crate::runtime::ArchiveRuntime;
use crate::traits::{PartitionSource, SourceRecord};

pub const DEFAULT_TOPIC: &str = "chargebacks";

/// Parsed configuration for the Kafka source.
#[derive(Debug, Clone)]
pub struct KafkaSourceConfig {
    /// Comma-separated list of Kafka broker addresses.
    pub bootstrap_servers: String,
    /// Topic to subscribe to.
    pub topic: String,
    /// Consumer group ID.
    pub group_id: String,
    /// Auto offset reset policy: `"earliest"` or `"latest"`.
    pub auto_offset_reset: String,
    /// Security protocol (e.g. `PLAINTEXT`, `SASL_SSL`).
    pub security_protocol: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// Minimum number of records librdkafka keeps prefetched per partition.
    pub partition_buffer: usize,
    pub redelivery_pause_ms: u64,
    pub seek_timeout_ms: u64,
}

impl KafkaSourceConfig {
    /// Parse a `KafkaSourceConfig` from a string key-value map.
    ///
    /// Required keys: `bootstrap.servers`, `group.id`.
    pub fn from_config_map(config: &HashMap<String, String>) -> Result<Self> {
        let bootstrap_servers = required(config, "bootstrap.servers")?;
        let group_id = required(config, "group.id")?;

        let topic = config
            .get("topic")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());

        let auto_offset_reset = config
            .get("auto.offset.reset")
            .cloned()
            .unwrap_or_else(|| "earliest".to_string());

        match auto_offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => {
                return Err(ConnectorError::ConfigError(format!(
                    "invalid auto.offset.reset '{}': must be 'earliest' or 'latest'",
                    other
                )));
            }
        }

        let security_protocol = config
            .get("security.protocol")
            .cloned()
            .unwrap_or_else(|| "PLAINTEXT".to_string());

        let partition_buffer: usize = parse_number(config, "partition.buffer.size")?.unwrap_or(256);
        if partition_buffer == 0 {
            return Err(ConnectorError::ConfigError(
                "'partition.buffer.size' must be greater than zero".to_string(),
            ));
        }

        Ok(KafkaSourceConfig {
            bootstrap_servers,
            topic,
            group_id,
            auto_offset_reset,
            security_protocol,
            sasl_mechanism: config.get("sasl.mechanism").cloned(),
            sasl_username: config.get("sasl.username").cloned(),
            sasl_password: config.get("sasl.password").cloned(),
            partition_buffer,
            redelivery_pause_ms: parse_number(config, "redelivery.pause.ms")?.unwrap_or(1000),
            seek_timeout_ms: parse_number(config, "seek.timeout.ms")?.unwrap_or(5000),
        })
    }

    /// librdkafka settings for the consumer.
    pub fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &self.group_id)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("security.protocol", &self.security_protocol)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("queued.min.messages", self.partition_buffer.to_string());

        if let Some(mechanism) = &self.sasl_mechanism {
            client.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &self.sasl_username {
            client.set("sasl.username", username);
        }
        if let Some(password) = &self.sasl_password {
            client.set("sasl.password", password);
        }
        client
    }
}

fn required(config: &HashMap<String, String>, key: &str) -> Result<String> {
    let value = config
        .get(key)
        .ok_or_else(|| ConnectorError::ConfigError(format!("missing required '{}'", key)))?;
    if value.trim().is_empty() {
        return Err(ConnectorError::ConfigError(format!(
            "'{}' must not be empty",
            key
        )));
    }
    Ok(value.trim().to_string())
}

fn parse_number<T>(config: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    config
        .get(key)
        .map(|s| {
            s.trim()
                .parse::<T>()
                .map_err(|e| ConnectorError::ConfigError(format!("invalid {}: {}", key, e)))
        })
        .transpose()
}

impl SourceRecord {
    /// Copy a consumed Kafka message into an owned record.
    pub fn from_message<M: Message>(message: &M) -> Self {
        SourceRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp: message.timestamp().to_millis(),
            key: message.key().map(Bytes::copy_from_slice),
            payload: message.payload().map(Bytes::copy_from_slice),
        }
    }
}

/// Consumer type used by the archiver.
pub type ArchiverConsumer = StreamConsumer<PartitionAssignments>;

/// How often the dispatcher checks that every assigned partition still has a
/// live worker.
const WORKER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Assignment change reported by the rebalance callbacks.
pub enum AssignmentEvent {
    Assigned {
        partition: i32,
        queue: StreamPartitionQueue<PartitionAssignments>,
        revoked: watch::Receiver<bool>,
    },
    Revoked {
        partition: i32,
    },
}

/// Consumer context that tracks which partitions this member owns.
///
/// On assignment each partition gets its own message queue, split off the
/// consumer right after librdkafka applied the assignment, and a revocation
/// flag. On revocation the flag is raised before librdkafka gives the
/// partition up, so its worker stops committing at once.
pub struct PartitionAssignments {
    topic: String,
    consumer: OnceLock<Weak<ArchiverConsumer>>,
    live: Mutex<HashMap<i32, watch::Sender<bool>>>,
    events: mpsc::UnboundedSender<AssignmentEvent>,
}

impl PartitionAssignments {
    pub fn new(topic: &str, events: mpsc::UnboundedSender<AssignmentEvent>) -> Self {
        Self {
            topic: topic.to_string(),
            consumer: OnceLock::new(),
            live: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Give the callbacks access to the consumer that owns this context.
    fn attach(&self, consumer: &Arc<ArchiverConsumer>) {
        let _ = self.consumer.set(Arc::downgrade(consumer));
    }

    fn live(&self) -> MutexGuard<'_, HashMap<i32, watch::Sender<bool>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn revoke(&self, partitions: &[i32]) {
        let mut live = self.live();
        for &partition in partitions {
            if let Some(revoked) = live.remove(&partition) {
                let _ = revoked.send(true);
            }
            tracing::info!(topic = %self.topic, partition, "partition revoked");
            let _ = self.events.send(AssignmentEvent::Revoked { partition });
        }
    }

    fn assign(&self, partitions: &[i32]) {
        let Some(consumer) = self.consumer.get().and_then(Weak::upgrade) else {
            tracing::warn!(topic = %self.topic, "assignment received before consumer was attached");
            return;
        };

        let mut live = self.live();
        for &partition in partitions {
            let Some(queue) = consumer.split_partition_queue(&self.topic, partition) else {
                tracing::error!(
                    topic = %self.topic,
                    partition,
                    "could not split partition queue"
                );
                continue;
            };
            let (revoke_tx, revoked) = watch::channel(false);
            if let Some(previous) = live.insert(partition, revoke_tx) {
                let _ = previous.send(true);
            }
            tracing::info!(topic = %self.topic, partition, "partition assigned");
            let _ = self.events.send(AssignmentEvent::Assigned {
                partition,
                queue,
                revoked,
            });
        }
    }

    fn partitions_of(&self, tpl: &TopicPartitionList) -> Vec<i32> {
        tpl.elements_for_topic(&self.topic)
            .iter()
            .map(|elem| elem.partition())
            .collect()
    }
}

impl ClientContext for PartitionAssignments {}

impl ConsumerContext for PartitionAssignments {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            self.revoke(&self.partitions_of(tpl));
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        match rebalance {
            Rebalance::Assign(tpl) => self.assign(&self.partitions_of(tpl)),
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                tracing::error!(topic = %self.topic, error = %e, "rebalance failed")
            }
        }
    }
}

/// Kafka consumer plus the loop that starts and retires partition workers.
pub struct KafkaSource {
    name: String,
    config: KafkaSourceConfig,
    consumer: Arc<ArchiverConsumer>,
    events: Option<mpsc::UnboundedReceiver<AssignmentEvent>>,
}

impl KafkaSource {
    /// Create the consumer and subscribe to the configured topic.
    pub fn connect(name: &str, config: KafkaSourceConfig) -> Result<Self> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let context = PartitionAssignments::new(&config.topic, events_tx);
        let consumer: ArchiverConsumer = config
            .client_config()
            .create_with_context(context)
            .map_err(|e| {
                ConnectorError::ConnectionError(format!("failed to create Kafka consumer: {}", e))
            })?;
        let consumer = Arc::new(consumer);
        consumer.context().attach(&consumer);
        consumer.subscribe(&[config.topic.as_str()])?;

        tracing::info!(
            source = %name,
            bootstrap_servers = %config.bootstrap_servers,
            topic = %config.topic,
            group_id = %config.group_id,
            "Kafka source subscribed"
        );

        Ok(Self {
            name: name.to_string(),
            config,
            consumer,
            events: Some(events),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &KafkaSourceConfig {
        &self.config
    }

    /// Serve the consumer and follow its assignment until `shutdown` is set.
    ///
    /// Every assigned partition gets a worker on `runtime` reading its own
    /// queue, so a partition that is stuck redelivering never holds back the
    /// others. A revoked partition's worker is retired before the partition
    /// can be started again. A worker that stops while its partition is still
    /// assigned is fatal: the partition would otherwise stall.
    pub async fn run(
        &mut self,
        runtime: &mut ArchiveRuntime,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut events = self.events.take().ok_or_else(|| {
            ConnectorError::RuntimeError(format!("source {} is already running", self.name))
        })?;
        let mut assigned: HashMap<i32, watch::Receiver<bool>> = HashMap::new();
        let mut unrouted: HashSet<i32> = HashSet::new();
        let mut health = tokio::time::interval(WORKER_CHECK_INTERVAL);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = events.recv() => {
                    self.apply(event, runtime, &mut assigned, &mut unrouted).await?;
                }
                message = self.consumer.recv() => {
                    let message = message.map(|m| SourceRecord::from_message(&m));
                    self.handle_unrouted(message, &assigned, &mut unrouted).await;
                }
                _ = health.tick() => {
                    check_workers(runtime, &self.config.topic, &assigned)?;
                }
            }
        }

        tracing::info!(source = %self.name, "Kafka dispatcher stopped");
        Ok(())
    }

    async fn apply(
        &self,
        event: AssignmentEvent,
        runtime: &mut ArchiveRuntime,
        assigned: &mut HashMap<i32, watch::Receiver<bool>>,
        unrouted: &mut HashSet<i32>,
    ) -> Result<()> {
        let topic = self.config.topic.as_str();
        match event {
            AssignmentEvent::Assigned {
                partition,
                queue,
                revoked,
            } => {
                // A quick revoke/assign pair may arrive before the old worker
                // was retired.
                self.retire(runtime, partition).await;
                unrouted.remove(&partition);

                runtime.spawn_partition(KafkaPartitionSource {
                    topic: topic.to_string(),
                    partition,
                    consumer: Arc::clone(&self.consumer),
                    queue,
                    revoked: revoked.clone(),
                    redelivery_pause: Duration::from_millis(self.config.redelivery_pause_ms),
                    seek_timeout: Duration::from_millis(self.config.seek_timeout_ms),
                })?;
                assigned.insert(partition, revoked);
                tracing::info!(
                    source = %self.name,
                    topic,
                    partition,
                    "started partition worker"
                );
            }
            AssignmentEvent::Revoked { partition } => {
                assigned.remove(&partition);
                unrouted.remove(&partition);
                self.retire(runtime, partition).await;
            }
        }
        Ok(())
    }

    async fn retire(&self, runtime: &mut ArchiveRuntime, partition: i32) {
        if let Some(stats) = runtime.retire(&self.config.topic, partition).await {
            tracing::info!(
                source = %self.name,
                topic = %self.config.topic,
                partition,
                archived = stats.archived,
                committed = ?stats.last_committed,
                "retired partition worker"
            );
        }
    }

    /// Messages fetched before a partition's queue was split still arrive on
    /// the consumer queue. Seek the partition back to the first of them so
    /// its worker receives them in order.
    async fn handle_unrouted(
        &self,
        message: KafkaResult<SourceRecord>,
        assigned: &HashMap<i32, watch::Receiver<bool>>,
        unrouted: &mut HashSet<i32>,
    ) {
        let record = match message {
            Ok(record) => record,
            Err(e) => {
                CONSUMER_ERRORS_TOTAL
                    .with_label_values(&[&self.config.topic])
                    .inc();
                tracing::warn!(
                    source = %self.name,
                    topic = %self.config.topic,
                    error = %e,
                    "Kafka receive error"
                );
                return;
            }
        };

        let owned = assigned
            .get(&record.partition)
            .map_or(false, |revoked| !*revoked.borrow());
        if !owned || !unrouted.insert(record.partition) {
            tracing::debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "dropping record outside its partition queue"
            );
            return;
        }
        tracing::warn!(
            source = %self.name,
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "record arrived outside its partition queue, seeking back"
        );
        let consumer = Arc::clone(&self.consumer);
        let timeout = Duration::from_millis(self.config.seek_timeout_ms);
        let seek = tokio::task::spawn_blocking(move || {
            consumer.seek(
                &record.topic,
                record.partition,
                Offset::Offset(record.offset),
                timeout,
            )
        })
        .await;
        if let Err(e) = seek
            .map_err(|e| ConnectorError::RuntimeError(format!("seek task failed: {}", e)))
            .and_then(|r| r.map_err(ConnectorError::from))
        {
            tracing::error!(
                source = %self.name,
                topic = %self.config.topic,
                error = %e,
                "failed to seek back unrouted record"
            );
        }
    }
}

/// Fail when an assigned, unrevoked partition has no running worker.
fn check_workers(
    runtime: &ArchiveRuntime,
    topic: &str,
    assigned: &HashMap<i32, watch::Receiver<bool>>,
) -> Result<()> {
    for (&partition, revoked) in assigned {
        if !*revoked.borrow() && !runtime.is_running(topic, partition) {
            return Err(ConnectorError::RuntimeError(format!(
                "worker for {}[{}] stopped unexpectedly",
                topic, partition
            )));
        }
    }
    Ok(())
}

/// One assigned partition, read from its own queue.
///
/// Once the partition is revoked the source stops delivering, refuses
/// commits and skips seeks.
pub struct KafkaPartitionSource {
    topic: String,
    partition: i32,
    consumer: Arc<ArchiverConsumer>,
    queue: StreamPartitionQueue<PartitionAssignments>,
    revoked: watch::Receiver<bool>,
    redelivery_pause: Duration,
    seek_timeout: Duration,
}

impl KafkaPartitionSource {
    fn offsets(&self, next_offset: i64) -> Result<TopicPartitionList> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(next_offset))?;
        Ok(tpl)
    }

    fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }
}

#[async_trait]
impl PartitionSource for KafkaPartitionSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_record(&mut self) -> Option<SourceRecord> {
        loop {
            if self.is_revoked() {
                return None;
            }
            tokio::select! {
                biased;
                changed = self.revoked.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                message = self.queue.recv() => match message {
                    Ok(message) => return Some(SourceRecord::from_message(&message)),
                    Err(e) => {
                        CONSUMER_ERRORS_TOTAL.with_label_values(&[&self.topic]).inc();
                        tracing::warn!(
                            topic = %self.topic,
                            partition = self.partition,
                            error = %e,
                            "Kafka receive error"
                        );
                    }
                },
            }
        }
    }

    async fn commit(&mut self, next_offset: i64) -> Result<()> {
        if self.is_revoked() {
            return Err(ConnectorError::SourceError(format!(
                "{}[{}] is no longer assigned, not committing {}",
                self.topic, self.partition, next_offset
            )));
        }
        let tpl = self.offsets(next_offset)?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }

    async fn rewind(&mut self, offset: i64) -> Result<()> {
        tokio::time::sleep(self.redelivery_pause).await;
        if self.is_revoked() {
            return Ok(());
        }

        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let partition = self.partition;
        let timeout = self.seek_timeout;
        tokio::task::spawn_blocking(move || {
            consumer.seek(&topic, partition, Offset::Offset(offset), timeout)
        })
        .await
        .map_err(|e| ConnectorError::RuntimeError(format!("seek task failed: {}", e)))??;

        tracing::debug!(
            topic = %self.topic,
            partition = self.partition,
            offset,
            "seeked back for redelivery"
        );
        Ok(())
    }

    async fn close(&mut self, committed: Option<i64>) -> Result<()> {
        let Some(next_offset) = committed else {
            return Ok(());
        };
        if self.is_revoked() {
            tracing::info!(
                topic = %self.topic,
                partition = self.partition,
                committed = next_offset,
                "partition revoked, leaving final commit to the new owner"
            );
            return Ok(());
        }

        let tpl = self.offsets(next_offset)?;
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| ConnectorError::RuntimeError(format!("commit task failed: {}", e)))??;

        tracing::info!(
            topic = %self.topic,
            partition = self.partition,
            committed = next_offset,
            "final offset committed"
        );
        Ok(())
    }
}
