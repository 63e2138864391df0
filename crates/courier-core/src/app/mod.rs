//! App - アプリケーション層
//!
//! ports を組み合わせて配送パイプラインを実装する。
//!
//! # 主要コンポーネント
//! - **EventPublisher**: business トランザクション内で outbox に積む
//! - **Deliverer**: outbox → broker の定期配送（single-flight）
//! - **ConsumerLoop**: poll → dispatch → commit の run-loop
//! - **dispatch**: topic ごとの handler 登録と envelope decode
//! - **RetryForwarder**: 失敗レコードを retry topic へ
//! - **RetryCoordinator**: retry topic → redelivery / hospital
//! - **RelayBuilder / Relay / RunningRelay**: ワイヤリングと起動・停止
//! - **RelayStatus**: 件数と run-loop の状態

pub mod consumer_loop;
pub mod dead_letter;
pub mod deliverer;
pub mod dispatch;
pub mod publisher;
pub mod retry_coordinator;
pub mod runtime;
pub mod status;

pub use self::consumer_loop::{ConsumerLoop, ConsumerLoopHandle, ErrorHandler, LoopState, RecordHandler};
pub use self::dead_letter::RetryForwarder;
pub use self::deliverer::{Deliverer, DelivererHandle, TickOutcome};
pub use self::dispatch::{
    DecodingHandler, EnvelopeDispatcher, EventHandler, HandlerRegistry, PayloadHandler,
    TypedHandler, VariantHandler,
};
pub use self::publisher::EventPublisher;
pub use self::retry_coordinator::{DeferOnRetryable, RetryCoordinator};
pub use self::runtime::{Relay, RelayBuilder, RunningRelay};
pub use self::status::RelayStatus;
