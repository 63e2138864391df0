//! Request context.
//!
//! 相関 id は thread-local ではなく明示的に引き回す。request boundary で一度だけ
//! 作って、enqueue / ログ出力する関数に渡す。

use super::ids::CorrelationId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    correlation_id: CorrelationId,
}

impl RequestContext {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self { correlation_id }
    }

    /// 上流から相関 id が来なかった request 用
    pub fn generate() -> Self {
        Self::new(CorrelationId::generate())
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}
