//! Broker port - メッセージブローカーの抽象化
//!
//! Kafka 風のクライアントを想定:
//! - Producer: 非同期 send → ack を待つ DeliveryFuture
//! - Consumer: subscribe / poll / commit_sync / wakeup
//!
//! topic 名は broker 上の名前（`Topic::broker_name()`）で扱う。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::domain::Headers;
use crate::error::{BrokerError, ConsumeError};

pub trait Broker: Send + Sync {
    fn producer(&self) -> Result<Arc<dyn Producer>, BrokerError>;

    /// A consumer that joins the named consumer group.
    fn consumer(&self, group: &str) -> Result<Arc<dyn Consumer>, BrokerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub topic: String,
    /// Partitioning key; same key, same partition.
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Headers,
}

impl ConsumerRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Broker acknowledgement of one send.
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<Result<RecordMetadata, BrokerError>>,
}

impl DeliveryFuture {
    /// The producer side completes the returned sender once the broker acks.
    pub fn channel() -> (oneshot::Sender<Result<RecordMetadata, BrokerError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub fn ready(result: Result<RecordMetadata, BrokerError>) -> Self {
        let (tx, fut) = Self::channel();
        // receiver は手元にあるので失敗しない
        let _ = tx.send(result);
        fut
    }

    pub async fn wait(self) -> Result<RecordMetadata, BrokerError> {
        self.rx.await.map_err(|_| BrokerError::AckDropped)?
    }
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Submits a record without waiting for the ack.
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryFuture, BrokerError>;

    /// Flushes in-flight sends and rejects any further `send`.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Partition assignment callback.
pub trait AssignmentListener: Send + Sync {
    fn on_assigned(&self, partitions: &[TopicPartition]);

    fn on_revoked(&self, _partitions: &[TopicPartition]) {}
}

#[async_trait]
pub trait Consumer: Send + Sync {
    async fn subscribe(
        &self,
        topics: &[String],
        listener: Arc<dyn AssignmentListener>,
    ) -> Result<(), BrokerError>;

    /// Waits up to `timeout` for records. Returns `ConsumeError::Woken` if
    /// `wakeup()` was called before or during the wait.
    async fn poll(&self, timeout: Duration) -> Result<Vec<ConsumerRecord>, ConsumeError>;

    /// Commits the next offset to read per partition.
    async fn commit_sync(&self, offsets: &BTreeMap<TopicPartition, i64>)
    -> Result<(), BrokerError>;

    /// Moves the fetch position back to the last committed offset.
    async fn rewind(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Interrupts a blocking `poll`. Safe to call from any thread.
    fn wakeup(&self);

    async fn close(&self) -> Result<(), BrokerError>;
}
