//! Consumer run-loop.
//!
//! ```text
//! Stopped → Subscribing → Polling ⇄ Dispatching → (Polling | Stopping) → Stopped
//! ```
//!
//! - poll ごとに返ってきたレコードを 1 件ずつ handler に渡す
//! - handler の失敗（panic 含む）はそのレコードだけに閉じ込め、ErrorHandler に回す
//! - バッチを処理し終えたら、次の poll の前に offset を同期 commit
//! - ErrorHandler がルーティングできなかったレコードのパーティションは commit を
//!   そこで止め、最後の commit 位置まで巻き戻す（再 poll される）
//! - `stop()` は冪等で、どのスレッドからでも呼べる。ブロック中の poll は wakeup で
//!   中断される。poll 済みのレコードは最後まで dispatch してから抜ける

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{ConsumeError, HandlerError, RoutingError};
use crate::ports::{AssignmentListener, Consumer, ConsumerRecord, TopicPartition};

/// Per-record business handler. Receives the raw broker record.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &ConsumerRecord) -> Result<(), HandlerError>;
}

/// Decides where a failed record goes. The run-loop knows nothing about
/// retry policy.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, record: &ConsumerRecord, error: &HandlerError)
    -> Result<(), RoutingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Subscribing,
    Polling,
    Dispatching,
    Stopping,
}

/// Logs partition assignments. No per-partition bookkeeping is needed here.
struct LoggingAssignmentListener {
    name: String,
}

impl AssignmentListener for LoggingAssignmentListener {
    fn on_assigned(&self, partitions: &[TopicPartition]) {
        info!(consumer = %self.name, partitions = ?partitions, "partitions assigned");
    }

    fn on_revoked(&self, partitions: &[TopicPartition]) {
        info!(consumer = %self.name, partitions = ?partitions, "partitions revoked");
    }
}

pub struct ConsumerLoop {
    name: String,
    consumer: Arc<dyn Consumer>,
    topics: Vec<String>,
    handler: Arc<dyn RecordHandler>,
    error_handler: Arc<dyn ErrorHandler>,
    poll_timeout: Duration,
    error_backoff: Duration,
}

/// Offsets to commit and partitions to rewind after one batch.
#[derive(Debug, Default)]
struct BatchProgress {
    commit: BTreeMap<TopicPartition, i64>,
    blocked: BTreeSet<TopicPartition>,
}

impl ConsumerLoop {
    pub fn new(
        name: impl Into<String>,
        consumer: Arc<dyn Consumer>,
        topics: Vec<String>,
        handler: Arc<dyn RecordHandler>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            consumer,
            topics,
            handler,
            error_handler,
            poll_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Pause after a failed poll, subscribe or routing.
    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn spawn(self) -> ConsumerLoopHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(LoopState::Stopped);
        let name = self.name.clone();
        let consumer = Arc::clone(&self.consumer);
        let join = tokio::spawn(self.run(Arc::clone(&stop), state_tx));
        ConsumerLoopHandle {
            name,
            stop,
            consumer,
            state_rx,
            join: Mutex::new(Some(join)),
        }
    }

    async fn run(self, stop: Arc<AtomicBool>, state: watch::Sender<LoopState>) {
        let stopping = || stop.load(Ordering::SeqCst);

        state.send_replace(LoopState::Subscribing);
        let listener = Arc::new(LoggingAssignmentListener {
            name: self.name.clone(),
        });
        while !stopping() {
            match self.consumer.subscribe(&self.topics, listener.clone()).await {
                Ok(()) => break,
                Err(err) => {
                    warn!(consumer = %self.name, error = %err, "subscribe failed, retrying");
                    tokio::time::sleep(self.error_backoff).await;
                }
            }
        }

        while !stopping() {
            state.send_replace(LoopState::Polling);
            let records = match self.consumer.poll(self.poll_timeout).await {
                Ok(records) => records,
                Err(ConsumeError::Woken) => {
                    debug!(consumer = %self.name, "poll woken up");
                    continue;
                }
                Err(err) => {
                    // commit はしていないので取りこぼしは無い
                    warn!(consumer = %self.name, error = %err, "poll failed");
                    tokio::time::sleep(self.error_backoff).await;
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }

            state.send_replace(LoopState::Dispatching);
            let progress = self.dispatch(records).await;

            if !progress.commit.is_empty()
                && let Err(err) = self.consumer.commit_sync(&progress.commit).await
            {
                warn!(consumer = %self.name, error = %err, "offset commit failed");
            }
            if !progress.blocked.is_empty() {
                let blocked: Vec<TopicPartition> = progress.blocked.into_iter().collect();
                if let Err(err) = self.consumer.rewind(&blocked).await {
                    warn!(consumer = %self.name, error = %err, "rewind failed");
                }
                tokio::time::sleep(self.error_backoff).await;
            }
        }

        state.send_replace(LoopState::Stopping);
        if let Err(err) = self.consumer.close().await {
            warn!(consumer = %self.name, error = %err, "consumer close failed");
        }
        state.send_replace(LoopState::Stopped);
        info!(consumer = %self.name, "consumer loop stopped");
    }

    async fn dispatch(&self, records: Vec<ConsumerRecord>) -> BatchProgress {
        let mut progress = BatchProgress::default();

        for record in records {
            let tp = record.topic_partition();
            // 巻き戻すパーティションの後続レコードは再 poll で処理する
            if progress.blocked.contains(&tp) {
                continue;
            }

            let span = info_span!(
                "dispatch",
                consumer = %self.name,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
            );
            let routed = async {
                match self.handle_isolated(&record).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(error = %err, reason = %err.reason(), "handler failed");
                        match self.error_handler.on_error(&record, &err).await {
                            Ok(()) => true,
                            Err(route_err) => {
                                error!(error = %route_err, "failed record could not be routed");
                                false
                            }
                        }
                    }
                }
            }
            .instrument(span)
            .await;

            if routed {
                progress.commit.insert(tp, record.offset + 1);
            } else {
                progress.blocked.insert(tp);
            }
        }
        progress
    }

    /// Runs the handler on its own task so a panic only fails this record.
    async fn handle_isolated(&self, record: &ConsumerRecord) -> Result<(), HandlerError> {
        let handler = Arc::clone(&self.handler);
        let owned = record.clone();
        let task = tokio::spawn(
            async move { handler.handle(&owned).await }.instrument(tracing::Span::current()),
        );
        match task.await {
            Ok(result) => result,
            Err(join_err) => Err(classify_join_error(join_err)),
        }
    }
}

fn classify_join_error(err: JoinError) -> HandlerError {
    if err.is_panic() {
        let panic = err.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        HandlerError::fatal("HandlerPanic", message)
    } else {
        HandlerError::retryable("HandlerCancelled", err.to_string())
    }
}

/// Handle of a spawned run-loop. `Send + Sync`; stop from anywhere.
pub struct ConsumerLoopHandle {
    name: String,
    stop: Arc<AtomicBool>,
    consumer: Arc<dyn Consumer>,
    state_rx: watch::Receiver<LoopState>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerLoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoopState {
        *self.state_rx.borrow()
    }

    /// Asks the loop to stop and interrupts a blocked poll. Idempotent.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            debug!(consumer = %self.name, "stop requested");
        }
        self.consumer.wakeup();
    }

    /// Waits until the loop reaches `target`. Returns false if the loop is
    /// gone before that.
    pub async fn wait_for_state(&self, target: LoopState) -> bool {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target).await.is_ok()
    }

    /// Waits for the loop task to exit. Later calls return immediately.
    pub async fn join(&self) {
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join
            && let Err(err) = join.await
        {
            error!(consumer = %self.name, error = %err, "consumer loop panicked");
        }
    }

    pub async fn stop_and_join(&self) {
        self.stop();
        self.join().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::domain::Headers;
    use crate::error::BrokerError;
    use crate::impls::MemoryBroker;
    use crate::ports::{Broker, Producer, ProducerRecord};

    /// Fails records whose value is "fail", panics on "panic".
    #[derive(Default)]
    struct ScriptedHandler {
        handled: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn handled(&self) -> Vec<String> {
            self.handled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordHandler for ScriptedHandler {
        async fn handle(&self, record: &ConsumerRecord) -> Result<(), HandlerError> {
            let value = String::from_utf8_lossy(&record.value).to_string();
            match value.as_str() {
                "fail" => Err(HandlerError::retryable("Boom", "scripted failure")),
                "panic" => panic!("scripted panic"),
                _ => {
                    self.handled.lock().unwrap().push(value);
                    Ok(())
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingErrors {
        seen: Mutex<Vec<(String, String)>>,
        /// Refuse to route this many failures.
        refuse: AtomicUsize,
    }

    #[async_trait]
    impl ErrorHandler for RecordingErrors {
        async fn on_error(
            &self,
            record: &ConsumerRecord,
            error: &HandlerError,
        ) -> Result<(), RoutingError> {
            let refused = self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(RoutingError::Broker(BrokerError::Unavailable("retry topic".into())));
            }
            self.seen.lock().unwrap().push((
                String::from_utf8_lossy(&record.value).to_string(),
                error.reason(),
            ));
            Ok(())
        }
    }

    async fn produce(producer: &Arc<dyn Producer>, values: &[&str]) {
        for value in values {
            producer
                .send(ProducerRecord {
                    topic: "user_auth".into(),
                    key: None,
                    value: value.as_bytes().to_vec(),
                    headers: Headers::new(),
                })
                .await
                .unwrap()
                .wait()
                .await
                .unwrap();
        }
    }

    fn spawn_loop(
        broker: &MemoryBroker,
        handler: Arc<ScriptedHandler>,
        errors: Arc<RecordingErrors>,
    ) -> ConsumerLoopHandle {
        ConsumerLoop::new(
            "test",
            broker.consumer("group").unwrap(),
            vec!["user_auth".to_string()],
            handler,
            errors,
        )
        .with_poll_timeout(Duration::from_millis(20))
        .with_error_backoff(Duration::from_millis(5))
        .spawn()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn failures_are_isolated_per_record() {
        let broker = MemoryBroker::with_partitions(1);
        let producer = broker.producer().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        let errors = Arc::new(RecordingErrors::default());

        produce(&producer, &["a", "fail", "panic", "b"]).await;
        let handle = spawn_loop(&broker, handler.clone(), errors.clone());

        eventually(|| handler.handled().len() == 2).await;
        eventually(|| errors.seen.lock().unwrap().len() == 2).await;
        assert_eq!(handler.handled(), vec!["a", "b"]);
        assert_eq!(
            *errors.seen.lock().unwrap(),
            vec![
                ("fail".to_string(), "Boom".to_string()),
                ("panic".to_string(), "HandlerPanic".to_string()),
            ]
        );

        eventually(|| broker.committed("group", &TopicPartition::new("user_auth", 0)) == Some(4))
            .await;
        handle.stop_and_join().await;
        assert_eq!(handle.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn unroutable_failure_rewinds_partition() {
        let broker = MemoryBroker::with_partitions(1);
        let producer = broker.producer().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        let errors = Arc::new(RecordingErrors::default());
        errors.refuse.store(1, Ordering::SeqCst);

        produce(&producer, &["a", "fail", "b"]).await;
        let handle = spawn_loop(&broker, handler.clone(), errors.clone());

        // 1 回目は "fail" でルーティング失敗 → "a" だけ commit して巻き戻し
        eventually(|| errors.seen.lock().unwrap().len() == 1).await;
        eventually(|| handler.handled() == vec!["a", "b"]).await;
        eventually(|| broker.committed("group", &TopicPartition::new("user_auth", 0)) == Some(3))
            .await;

        handle.stop_and_join().await;
    }

    /// Sleeps per record so a stop can land mid-batch.
    #[derive(Default)]
    struct SlowHandler {
        started: AtomicUsize,
        handled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecordHandler for SlowHandler {
        async fn handle(&self, record: &ConsumerRecord) -> Result<(), HandlerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.handled
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&record.value).to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_during_dispatch_finishes_batch_and_commits() {
        let broker = MemoryBroker::with_partitions(1);
        let producer = broker.producer().unwrap();
        let handler = Arc::new(SlowHandler::default());

        produce(&producer, &["a", "b", "c", "d"]).await;
        let handle = ConsumerLoop::new(
            "slow",
            broker.consumer("group").unwrap(),
            vec!["user_auth".to_string()],
            handler.clone(),
            Arc::new(RecordingErrors::default()),
        )
        .with_poll_timeout(Duration::from_millis(20))
        .spawn();

        eventually(|| handler.started.load(Ordering::SeqCst) >= 1).await;
        handle.stop_and_join().await;

        assert_eq!(*handler.handled.lock().unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(
            broker.committed("group", &TopicPartition::new("user_auth", 0)),
            Some(4)
        );
        assert_eq!(handle.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn broker_outage_is_survived_without_loss_or_duplicates() {
        let broker = MemoryBroker::with_partitions(1);
        let producer = broker.producer().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        let errors = Arc::new(RecordingErrors::default());
        let tp = TopicPartition::new("user_auth", 0);

        produce(&producer, &["a"]).await;
        let handle = spawn_loop(&broker, handler.clone(), errors.clone());
        eventually(|| broker.committed("group", &tp) == Some(1)).await;

        // poll が失敗し続ける間は commit も進まない
        broker.set_available(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.committed("group", &tp), Some(1));
        broker.set_available(true);

        produce(&producer, &["b", "c"]).await;
        eventually(|| broker.committed("group", &tp) == Some(3)).await;

        handle.stop_and_join().await;
        assert_eq!(handler.handled(), vec!["a", "b", "c"]);
        assert!(errors.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_interrupts_idle_poll_and_is_idempotent() {
        let broker = MemoryBroker::new();
        let handle = ConsumerLoop::new(
            "idle",
            broker.consumer("group").unwrap(),
            vec!["user_auth".to_string()],
            Arc::new(ScriptedHandler::default()),
            Arc::new(RecordingErrors::default()),
        )
        .with_poll_timeout(Duration::from_secs(60))
        .spawn();

        assert!(handle.wait_for_state(LoopState::Polling).await);
        // poll に入るまで少し待つ
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.stop();
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("stop should interrupt the blocked poll");
        handle.stop();
        handle.join().await;
        assert_eq!(handle.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn stop_from_another_thread() {
        let broker = MemoryBroker::new();
        let handle = Arc::new(
            ConsumerLoop::new(
                "threaded",
                broker.consumer("group").unwrap(),
                vec!["user_auth".to_string()],
                Arc::new(ScriptedHandler::default()),
                Arc::new(RecordingErrors::default()),
            )
            .with_poll_timeout(Duration::from_secs(60))
            .spawn(),
        );
        assert!(handle.wait_for_state(LoopState::Polling).await);

        let remote = Arc::clone(&handle);
        std::thread::spawn(move || remote.stop()).join().unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("loop should stop");
    }

    #[tokio::test]
    async fn panic_payloads_become_fatal() {
        let task: JoinHandle<()> = tokio::spawn(async { panic!("kaboom") });
        let err = task.await.unwrap_err();
        let classified = classify_join_error(err);
        assert_eq!(classified.reason(), "HandlerPanic");
        assert_eq!(classified.cause(), "kaboom");
    }
}
