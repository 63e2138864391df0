//! In-memory store implementation.
//!
//! 開発・テスト用。本番の RDB と同じ見え方になるように:
//! - トランザクション内の書き込みは commit までステージされ、他から見えない
//! - `claim_batch` は行ロックを取り、他トランザクションがロック中の行は飛ばす
//! - drop / rollback / commit 失敗でロックを解放する
//!
//! 状態は std の Mutex で持つ。Drop でロックを解放する必要があるので
//! async ロックは使わない（await を跨いで保持しない）。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{EventEnvelope, HospitalRecord, HospitalRowId, OutboxRecord, OutboxRowId};
use crate::error::StoreError;
use crate::ports::{OutboxCounts, Store, Transaction};

type TxId = u64;

#[derive(Debug)]
struct MemoryStoreState {
    outbox: BTreeMap<OutboxRowId, OutboxRecord>,
    locks: HashMap<OutboxRowId, TxId>,
    hospital: Vec<(HospitalRowId, HospitalRecord)>,
    next_outbox_id: i64,
    next_hospital_id: i64,
    next_tx_id: TxId,
    available: bool,
    /// Commits that should fail before anything is applied.
    failing_commits: usize,
}

impl MemoryStoreState {
    fn new() -> Self {
        Self {
            outbox: BTreeMap::new(),
            locks: HashMap::new(),
            hospital: Vec::new(),
            next_outbox_id: 1,
            next_hospital_id: 1,
            next_tx_id: 1,
            available: true,
            failing_commits: 0,
        }
    }

    fn allocate_outbox_id(&mut self) -> OutboxRowId {
        let id = OutboxRowId(self.next_outbox_id);
        self.next_outbox_id += 1;
        id
    }

    fn allocate_hospital_id(&mut self) -> HospitalRowId {
        let id = HospitalRowId(self.next_hospital_id);
        self.next_hospital_id += 1;
        id
    }

    fn release(&mut self, tx_id: TxId) {
        self.locks.retain(|_, owner| *owner != tx_id);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".into()))
        }
    }
}

/// In-memory outbox + hospital store.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryStoreState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreState> {
        lock_state(&self.state)
    }

    /// Simulates a database outage: `begin` and `commit` fail while offline.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// The next `n` commits fail and roll back.
    pub fn fail_next_commits(&self, n: usize) {
        self.lock().failing_commits = n;
    }

    /// Committed outbox rows in row-id order.
    pub fn outbox_rows(&self) -> Vec<OutboxRecord> {
        self.lock().outbox.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state(state: &Mutex<MemoryStoreState>) -> MutexGuard<'_, MemoryStoreState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let mut state = self.lock();
        state.ensure_available()?;
        let tx_id = state.next_tx_id;
        state.next_tx_id += 1;
        Ok(Box::new(MemoryTransaction {
            tx_id,
            state: Arc::clone(&self.state),
            inserts: Vec::new(),
            deletes: BTreeSet::new(),
            admits: Vec::new(),
            finished: false,
        }))
    }

    async fn hospital_records(&self) -> Result<Vec<(HospitalRowId, HospitalRecord)>, StoreError> {
        let state = self.lock();
        state.ensure_available()?;
        Ok(state.hospital.clone())
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<OutboxCounts, StoreError> {
        let state = self.lock();
        state.ensure_available()?;
        let mut counts = OutboxCounts {
            hospitalized: state.hospital.len(),
            ..OutboxCounts::default()
        };
        for (row_id, record) in &state.outbox {
            if state.locks.contains_key(row_id) {
                counts.in_flight += 1;
            } else if record.scheduled_for <= now {
                counts.pending += 1;
            } else {
                counts.scheduled += 1;
            }
        }
        Ok(counts)
    }
}

struct MemoryTransaction {
    tx_id: TxId,
    state: Arc<Mutex<MemoryStoreState>>,
    inserts: Vec<OutboxRecord>,
    deletes: BTreeSet<OutboxRowId>,
    admits: Vec<(HospitalRowId, HospitalRecord)>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::TransactionFinished)
        } else {
            Ok(())
        }
    }

    fn insert(&mut self, envelope: EventEnvelope, scheduled_for: DateTime<Utc>) -> OutboxRowId {
        let row_id = lock_state(&self.state).allocate_outbox_id();
        self.inserts.push(OutboxRecord {
            row_id,
            envelope,
            scheduled_for,
        });
        row_id
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            lock_state(&self.state).release(self.tx_id);
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn enqueue(&mut self, envelope: EventEnvelope) -> Result<OutboxRowId, StoreError> {
        self.ensure_open()?;
        let scheduled_for = envelope.timestamp();
        Ok(self.insert(envelope, scheduled_for))
    }

    async fn enqueue_redelivery(
        &mut self,
        envelope: &EventEnvelope,
        scheduled_for: DateTime<Utc>,
    ) -> Result<OutboxRowId, StoreError> {
        self.ensure_open()?;
        Ok(self.insert(envelope.redelivered(), scheduled_for))
    }

    async fn claim_batch(
        &mut self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        self.ensure_open()?;
        let mut state = lock_state(&self.state);

        let mut eligible: Vec<&OutboxRecord> = state
            .outbox
            .values()
            .filter(|record| record.scheduled_for <= now)
            .filter(|record| !self.deletes.contains(&record.row_id))
            .filter(|record| match state.locks.get(&record.row_id) {
                // SKIP LOCKED
                Some(owner) => *owner == self.tx_id,
                None => true,
            })
            .collect();
        eligible.sort_by_key(|record| (record.envelope.timestamp(), record.row_id));

        let claimed: Vec<OutboxRecord> = eligible.into_iter().take(limit).cloned().collect();
        for record in &claimed {
            state.locks.insert(record.row_id, self.tx_id);
        }
        debug!(tx = self.tx_id, claimed = claimed.len(), "claimed outbox rows");
        Ok(claimed)
    }

    async fn delete(&mut self, record: &OutboxRecord) -> Result<(), StoreError> {
        self.ensure_open()?;
        let owner = lock_state(&self.state).locks.get(&record.row_id).copied();
        if owner != Some(self.tx_id) {
            return Err(StoreError::NotClaimed(record.row_id));
        }
        self.deletes.insert(record.row_id);
        Ok(())
    }

    async fn admit(&mut self, record: HospitalRecord) -> Result<HospitalRowId, StoreError> {
        self.ensure_open()?;
        let row_id = lock_state(&self.state).allocate_hospital_id();
        self.admits.push((row_id, record));
        Ok(row_id)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.ensure_open()?;
        let outcome = {
            let mut state = lock_state(&self.state);
            if let Err(err) = state.ensure_available() {
                Err(err)
            } else if state.failing_commits > 0 {
                state.failing_commits -= 1;
                Err(StoreError::Unavailable("injected commit failure".into()))
            } else {
                for row_id in &self.deletes {
                    state.outbox.remove(row_id);
                }
                for record in self.inserts.drain(..) {
                    state.outbox.insert(record.row_id, record);
                }
                state.hospital.append(&mut self.admits);
                Ok(())
            }
        };
        self.finish();
        outcome
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finish();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}
