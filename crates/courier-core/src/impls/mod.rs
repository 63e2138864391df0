//! Implementations - ports の実装
//!
//! # 開発・テスト用
//! - **MemoryStore**: outbox / hospital テーブル（行ロック + ステージング付き）
//! - **MemoryBroker**: パーティション付き topic と consumer group offset
//!
//! 本番の RDB / Kafka アダプタはこの crate の外で ports を実装する。

pub mod memory_broker;
pub mod memory_store;

pub use self::memory_broker::MemoryBroker;
pub use self::memory_store::MemoryStore;
