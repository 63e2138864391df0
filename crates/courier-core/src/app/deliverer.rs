//! Deliverer - outbox → broker
//!
//! # 1 回の run
//! 1. トランザクションを開いて `claim_batch(N)`（行ロック、lock-skip）
//! 2. 全件を非同期 send して ack の future を集める
//! 3. 送信順に ack を待ち、成功した行をそのトランザクション内で delete
//! 4. 1 件でも失敗したらトランザクションごと rollback（全行が pending に戻る）
//!
//! 成功済みの send が次の tick で再送されるのは at-least-once の範囲内。
//!
//! # single-flight
//! 前の run が終わっていない tick はキューせずに skip する。
//! 状態はインスタンスごとの AtomicBool 1 つだけ。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::codec;
use crate::domain::OutboxRecord;
use crate::error::DeliveryError;
use crate::ports::{Clock, DeliveryFuture, Producer, ProducerRecord, Store, Transaction};

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// This many rows were sent and deleted.
    Delivered(usize),
    /// Nothing was eligible.
    Idle,
    /// The previous run was still in flight.
    Skipped,
    /// Shutdown has begun; no new batch starts.
    ShuttingDown,
}

pub struct Deliverer {
    store: Arc<dyn Store>,
    producer: Arc<dyn Producer>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    in_progress: AtomicBool,
    shutting_down: AtomicBool,
}

/// Clears the in-progress flag even if the run future is dropped.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Deliverer {
    pub fn new(
        store: Arc<dyn Store>,
        producer: Arc<dyn Producer>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            producer,
            clock,
            batch_size: batch_size.max(1),
            in_progress: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// One single-flight delivery attempt.
    pub async fn tick(&self) -> Result<TickOutcome, DeliveryError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Ok(TickOutcome::ShuttingDown);
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("previous delivery run still in flight, skipping tick");
            return Ok(TickOutcome::Skipped);
        }
        let _guard = FlightGuard(&self.in_progress);

        self.run_once()
            .instrument(info_span!("deliver", batch_size = self.batch_size))
            .await
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    async fn run_once(&self) -> Result<TickOutcome, DeliveryError> {
        let mut tx = self.store.begin().await?;

        let batch = match tx.claim_batch(self.batch_size, self.clock.now()).await {
            Ok(batch) => batch,
            Err(err) => {
                rollback(tx).await;
                return Err(err.into());
            }
        };
        if batch.is_empty() {
            rollback(tx).await;
            return Ok(TickOutcome::Idle);
        }

        match self.send_batch(tx.as_mut(), &batch).await {
            Ok(()) => {
                tx.commit().await?;
                info!(delivered = batch.len(), "outbox batch delivered");
                Ok(TickOutcome::Delivered(batch.len()))
            }
            Err(err) => {
                warn!(error = %err, claimed = batch.len(), "delivery failed, rolling back batch");
                rollback(tx).await;
                Err(err)
            }
        }
    }

    async fn send_batch(
        &self,
        tx: &mut dyn Transaction,
        batch: &[OutboxRecord],
    ) -> Result<(), DeliveryError> {
        let mut acks: Vec<(&OutboxRecord, DeliveryFuture)> = Vec::with_capacity(batch.len());
        for record in batch {
            let envelope = &record.envelope;
            let value = codec::encode_envelope(envelope)?;
            let ack = self
                .producer
                .send(ProducerRecord {
                    topic: envelope.topic().broker_name(),
                    key: envelope.key().map(str::to_string),
                    value,
                    headers: Default::default(),
                })
                .await?;
            acks.push((record, ack));
        }

        // 送信順に待つ（完了順ではない）
        for (record, ack) in acks {
            let meta = ack.wait().await?;
            debug!(
                event_id = %record.envelope.id(),
                topic = %meta.topic,
                partition = meta.partition,
                offset = meta.offset,
                "broker acknowledged"
            );
            tx.delete(record).await?;
        }
        Ok(())
    }

    /// Runs `tick` every `interval` until the handle is shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> DelivererHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let deliverer = Arc::clone(&self);
        let join = tokio::spawn(delivery_loop(deliverer, interval, shutdown_rx));
        DelivererHandle {
            deliverer: self,
            shutdown_tx,
            join,
        }
    }
}

async fn rollback(tx: Box<dyn Transaction>) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "outbox rollback failed");
    }
}

async fn delivery_loop(
    deliverer: Arc<Deliverer>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut runs = JoinSet::new();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender が drop されたら止める
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let deliverer = Arc::clone(&deliverer);
                runs.spawn(async move { deliverer.tick().await });
            }
            Some(joined) = runs.join_next(), if !runs.is_empty() => {
                log_run(joined);
            }
        }
    }

    deliverer.begin_shutdown();
    while let Some(joined) = runs.join_next().await {
        log_run(joined);
    }
    if let Err(err) = deliverer.producer.close().await {
        warn!(error = %err, "producer close failed");
    }
    info!("deliverer stopped");
}

fn log_run(joined: Result<Result<TickOutcome, DeliveryError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(_)) => {}
        // 次の tick で再試行される
        Ok(Err(err)) => warn!(error = %err, "delivery run failed"),
        Err(err) => warn!(error = %err, "delivery run aborted"),
    }
}

/// Handle of a spawned delivery loop.
pub struct DelivererHandle {
    deliverer: Arc<Deliverer>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DelivererHandle {
    pub fn deliverer(&self) -> &Arc<Deliverer> {
        &self.deliverer
    }

    /// Stops new batches, waits for the in-flight run, then closes the
    /// producer.
    pub async fn shutdown(self) {
        self.deliverer.begin_shutdown();
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "delivery loop panicked");
        }
    }
}
