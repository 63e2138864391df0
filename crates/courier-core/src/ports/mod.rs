//! Ports - 抽象化レイヤー
//!
//! 外部システム（リレーショナル DB、メッセージブローカー）へのインターフェース。
//! core はこの trait 越しにしか store / broker に触らない。
//!
//! # 前提
//! - store: 行ロック（lock-skip）と ACID トランザクションが使える
//! - broker: パーティション付き topic、consumer group、パーティション内順序、
//!   手動 offset commit が使える

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod store;

pub use self::broker::{
    AssignmentListener, Broker, Consumer, ConsumerRecord, DeliveryFuture, Producer,
    ProducerRecord, RecordMetadata, TopicPartition,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::store::{OutboxCounts, Store, Transaction};
