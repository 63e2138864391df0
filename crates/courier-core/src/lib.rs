//! courier-core
//!
//! Transactional outbox と retry / hospital パイプラインの中核。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, topic, envelope, records, failure, decision）
//! - **codec**: payload / envelope の (de)serialize、payload_type による decoder 登録
//! - **ports**: 抽象化レイヤー（Store / Transaction, Broker / Producer / Consumer, Clock, IdGenerator）
//! - **impls**: 開発・テスト用の in-memory 実装（MemoryStore, MemoryBroker）
//! - **app**: アプリケーションロジック（publisher, deliverer, consumer_loop, dead_letter,
//!   retry_coordinator, runtime, status）
//! - **config**: RelayConfig（defaults / env / JSON）
//! - **error**: 層ごとのエラー型
//!
//! # 配送保証
//! at-least-once。consumer は `EventEnvelope::id` をキーに冪等であること。

pub mod app;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use app::{
    ConsumerLoopHandle, Deliverer, DelivererHandle, EventPublisher, LoopState, Relay,
    RelayBuilder, RelayStatus, RunningRelay,
};
pub use codec::Payload;
pub use config::RelayConfig;
pub use domain::{EventEnvelope, EventId, RequestContext, Topic};
pub use error::HandlerError;
