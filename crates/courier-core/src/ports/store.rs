//! Store port - outbox / hospital テーブルの抽象化
//!
//! 全ての読み書きはトランザクション経由。`begin()` で開いて `commit()` /
//! `rollback()` で閉じる。commit されずに drop されたトランザクションは
//! rollback 扱いで、claim した行のロックも解放される。
//!
//! # 想定スキーマ
//! - outbox: surrogate id, envelope の各フィールド, scheduled_for
//! - hospital: surrogate id, envelope の各フィールド, reason, cause, timestamp

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EventEnvelope, HospitalRecord, HospitalRowId, OutboxRecord, OutboxRowId};
use crate::error::StoreError;

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    /// Hospital rows in admission order.
    async fn hospital_records(&self) -> Result<Vec<(HospitalRowId, HospitalRecord)>, StoreError>;

    async fn counts(&self, now: DateTime<Utc>) -> Result<OutboxCounts, StoreError>;
}

#[async_trait]
pub trait Transaction: Send {
    /// Inserts a first-delivery row with `scheduled_for = envelope.timestamp`.
    async fn enqueue(&mut self, envelope: EventEnvelope) -> Result<OutboxRowId, StoreError>;

    /// Inserts a redelivery row holding `envelope.redelivered()`.
    async fn enqueue_redelivery(
        &mut self,
        envelope: &EventEnvelope,
        scheduled_for: DateTime<Utc>,
    ) -> Result<OutboxRowId, StoreError>;

    /// Claims up to `limit` rows with `scheduled_for <= now`, oldest
    /// envelope timestamp first, locking each for the rest of this
    /// transaction. Rows locked by other transactions are skipped.
    async fn claim_batch(
        &mut self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Deletes a row claimed by this transaction.
    async fn delete(&mut self, record: &OutboxRecord) -> Result<(), StoreError>;

    /// Appends a hospital row.
    async fn admit(&mut self, record: HospitalRecord) -> Result<HospitalRowId, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Outbox / hospital sizes for operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    /// Eligible now and not claimed.
    pub pending: usize,
    /// Waiting for a future `scheduled_for`.
    pub scheduled: usize,
    /// Claimed by an open transaction.
    pub in_flight: usize,
    pub hospitalized: usize,
}

impl OutboxCounts {
    pub fn outbox_total(&self) -> usize {
        self.pending + self.scheduled + self.in_flight
    }
}
