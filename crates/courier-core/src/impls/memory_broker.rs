//! In-memory broker implementation.
//!
//! パーティション付き topic のログ、consumer group ごとの commit 済み offset、
//! 障害注入（ブローカー停止・N 回目の send 失敗）を持つ。
//!
//! # 単純化
//! consumer group のメンバーは 1 つだけ想定。subscribe した consumer が
//! その topic の全パーティションを受け持つ（rebalance しない）。

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{BrokerError, ConsumeError};
use crate::ports::{
    AssignmentListener, Broker, Consumer, ConsumerRecord, DeliveryFuture, Producer,
    ProducerRecord, RecordMetadata, TopicPartition,
};

const DEFAULT_PARTITIONS: u32 = 3;
const DEFAULT_MAX_POLL_RECORDS: usize = 500;

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<Vec<ConsumerRecord>>,
    /// Round-robin cursor for key-less records.
    next_partition: usize,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
            next_partition: 0,
        }
    }

    fn choose_partition(&mut self, key: Option<&str>) -> usize {
        let count = self.partitions.len();
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            None => {
                let partition = self.next_partition % count;
                self.next_partition = self.next_partition.wrapping_add(1);
                partition
            }
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    committed: HashMap<(String, TopicPartition), i64>,
    available: bool,
    sends: u64,
    /// 1-based send sequence numbers that fail.
    failing_sends: BTreeSet<u64>,
}

impl BrokerState {
    fn topic_mut(&mut self, name: &str, partitions: u32) -> &mut TopicLog {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| TopicLog::new(partitions))
    }
}

/// In-memory Kafka-like broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    partitions: u32,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                topics: HashMap::new(),
                committed: HashMap::new(),
                available: true,
                sends: 0,
                failing_sends: BTreeSet::new(),
            })),
            notify: Arc::new(Notify::new()),
            partitions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    /// While offline every send is nacked and every poll fails.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
        self.notify.notify_waiters();
    }

    /// The `n`-th send from now (1-based) is nacked.
    pub fn fail_nth_send(&self, n: u64) {
        let mut state = self.lock();
        let target = state.sends + n;
        state.failing_sends.insert(target);
    }

    /// Every record on a broker topic, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<ConsumerRecord> {
        self.lock()
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed offset of a group on one partition.
    pub fn committed(&self, group: &str, partition: &TopicPartition) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), partition.clone()))
            .copied()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Broker for MemoryBroker {
    fn producer(&self) -> Result<Arc<dyn Producer>, BrokerError> {
        Ok(Arc::new(MemoryProducer {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            partitions: self.partitions,
            closed: AtomicBool::new(false),
        }))
    }

    fn consumer(&self, group: &str) -> Result<Arc<dyn Consumer>, BrokerError> {
        Ok(Arc::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            partitions: self.partitions,
            group: group.to_string(),
            positions: Mutex::new(None),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            woken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryProducer {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    partitions: u32,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryFuture, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let result = {
            let mut state = lock_state(&self.state);
            state.sends += 1;
            let seq = state.sends;
            if !state.available {
                Err(BrokerError::Unavailable("in-memory broker is offline".into()))
            } else if state.failing_sends.remove(&seq) {
                Err(BrokerError::SendFailed {
                    topic: record.topic.clone(),
                    reason: format!("injected failure on send #{seq}"),
                })
            } else {
                let log = state.topic_mut(&record.topic, self.partitions);
                let partition = log.choose_partition(record.key.as_deref());
                let entries = &mut log.partitions[partition];
                let offset = entries.len() as i64;
                entries.push(ConsumerRecord {
                    topic: record.topic.clone(),
                    partition: partition as u32,
                    offset,
                    key: record.key,
                    value: record.value,
                    headers: record.headers,
                });
                Ok(RecordMetadata {
                    topic: record.topic,
                    partition: partition as u32,
                    offset,
                })
            }
        };

        if result.is_ok() {
            self.notify.notify_waiters();
        }
        Ok(DeliveryFuture::ready(result))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // send は同期的に ack 済みなので flush するものは無い
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryConsumer {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    partitions: u32,
    group: String,
    /// Fetch position per assigned partition; `None` until subscribed.
    positions: Mutex<Option<BTreeMap<TopicPartition, i64>>>,
    max_poll_records: usize,
    woken: AtomicBool,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn positions(&self) -> MutexGuard<'_, Option<BTreeMap<TopicPartition, i64>>> {
        self.positions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetch(&self) -> Result<Vec<ConsumerRecord>, ConsumeError> {
        let state = lock_state(&self.state);
        if !state.available {
            return Err(BrokerError::Unavailable("in-memory broker is offline".into()).into());
        }
        let mut positions = self.positions();
        let positions = positions.as_mut().ok_or(ConsumeError::NotSubscribed)?;

        let mut batch = Vec::new();
        for (tp, position) in positions.iter_mut() {
            let Some(log) = state.topics.get(&tp.topic) else {
                continue;
            };
            let Some(entries) = log.partitions.get(tp.partition as usize) else {
                continue;
            };
            let start = usize::try_from(*position).unwrap_or(0);
            for record in entries.iter().skip(start) {
                if batch.len() >= self.max_poll_records {
                    break;
                }
                batch.push(record.clone());
                *position = record.offset + 1;
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn subscribe(
        &self,
        topics: &[String],
        listener: Arc<dyn AssignmentListener>,
    ) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let assigned: BTreeMap<TopicPartition, i64> = {
            let mut state = lock_state(&self.state);
            let mut assigned = BTreeMap::new();
            for topic in topics {
                let count = state.topic_mut(topic, self.partitions).partitions.len() as u32;
                for partition in 0..count {
                    let tp = TopicPartition::new(topic.clone(), partition);
                    let committed = state
                        .committed
                        .get(&(self.group.clone(), tp.clone()))
                        .copied()
                        .unwrap_or(0);
                    assigned.insert(tp, committed);
                }
            }
            assigned
        };

        let partitions: Vec<TopicPartition> = assigned.keys().cloned().collect();
        *self.positions() = Some(assigned);
        debug!(group = %self.group, partitions = partitions.len(), "partitions assigned");
        listener.on_assigned(&partitions);
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<ConsumerRecord>, ConsumeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // notified を先に登録してから状態を見る（wakeup / send の取りこぼし防止）
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.woken.swap(false, Ordering::SeqCst) {
                return Err(ConsumeError::Woken);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed.into());
            }

            let batch = self.fetch()?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit_sync(
        &self,
        offsets: &BTreeMap<TopicPartition, i64>,
    ) -> Result<(), BrokerError> {
        let mut state = lock_state(&self.state);
        if !state.available {
            return Err(BrokerError::Unavailable("in-memory broker is offline".into()));
        }
        for (tp, offset) in offsets {
            state
                .committed
                .insert((self.group.clone(), tp.clone()), *offset);
        }
        Ok(())
    }

    async fn rewind(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        let state = lock_state(&self.state);
        let mut positions = self.positions();
        if let Some(positions) = positions.as_mut() {
            for tp in partitions {
                let committed = state
                    .committed
                    .get(&(self.group.clone(), tp.clone()))
                    .copied()
                    .unwrap_or(0);
                positions.insert(tp.clone(), committed);
            }
        }
        Ok(())
    }

    fn wakeup(&self) {
        self.woken.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        *self.positions() = None;
        Ok(())
    }
}
