//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース。timestamp 部分は Clock から取る

use std::sync::Arc;

use ulid::Ulid;

use super::clock::Clock;
use crate::domain::EventId;

/// # Thread Safety
/// - `Send + Sync` を要求（publisher は複数タスクから共有される）
pub trait IdGenerator: Send + Sync {
    fn generate_event_id(&self) -> EventId;
}

pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn generate_ulid(&self) -> Ulid {
        // 1970 以前の時計は 0 に丸める
        let ts_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(ts_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_event_id(&self) -> EventId {
        EventId::from_ulid(self.generate_ulid())
    }
}
