//! Retry coordinator - retry topic の consumer
//!
//! 1 レコードごとに:
//! 1. envelope と failure header を読む
//! 2. Decider で redeliver / quarantine を決める
//! 3. 1 トランザクションで `enqueue_redelivery` か `admit`（hospital）して commit
//!
//! hospital 通知 topic が設定されていれば、admit したトランザクションの commit 後に
//! 通知を送る。正は Hospital Store で、通知は best-effort（失敗は warn のみ。
//! 再 poll すると hospital 行が二重になるため再試行しない）。
//!
//! store の失敗は Retryable として返し、`DeferOnRetryable` がパーティションを
//! 巻き戻すので、そのレコードは再 poll される。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::consumer_loop::{ErrorHandler, RecordHandler};
use crate::codec;
use crate::domain::failure::{CAUSE_HEADER, REASON_HEADER};
use crate::domain::{Decider, Decision, EventEnvelope, FailureReport, Headers, HospitalRecord, Topic};
use crate::error::{BrokerError, HandlerError, RoutingError, StoreError};
use crate::ports::{Clock, ConsumerRecord, Producer, ProducerRecord, Store, Transaction};

pub struct RetryCoordinator {
    store: Arc<dyn Store>,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    hospital_topic: Option<(Topic, Arc<dyn Producer>)>,
}

impl RetryCoordinator {
    pub fn new(store: Arc<dyn Store>, decider: Arc<dyn Decider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            decider,
            clock,
            hospital_topic: None,
        }
    }

    /// Also publish every new hospital record to `topic`.
    pub fn with_hospital_topic(mut self, topic: Topic, producer: Arc<dyn Producer>) -> Self {
        self.hospital_topic = Some((topic, producer));
        self
    }

    /// Executes the decision for one failed envelope.
    pub async fn process(
        &self,
        envelope: &EventEnvelope,
        report: &FailureReport,
    ) -> Result<Decision, HandlerError> {
        let now = self.clock.now();
        let decision = self.decider.decide(envelope, report, now);

        let mut tx = self.store.begin().await.map_err(store_failure)?;
        let applied = self.apply(tx.as_mut(), envelope, report, &decision).await;
        match applied {
            Ok(()) => tx.commit().await.map_err(store_failure)?,
            Err(err) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "retry transaction rollback failed");
                }
                return Err(err);
            }
        }

        if matches!(decision, Decision::Quarantine { .. })
            && let Err(err) = self.notify_hospital(envelope, report).await
        {
            warn!(
                event_id = %envelope.id(),
                error = %err,
                "hospital notification failed; record is in the hospital store"
            );
        }

        match &decision {
            Decision::Redeliver { scheduled_for } => info!(
                event_id = %envelope.id(),
                correlation_id = %envelope.correlation_id(),
                retry_count = envelope.retry_count() + 1,
                scheduled_for = %scheduled_for,
                "redelivery scheduled"
            ),
            Decision::Quarantine { reason } => warn!(
                event_id = %envelope.id(),
                correlation_id = %envelope.correlation_id(),
                retry_count = envelope.retry_count(),
                failure = %report.reason,
                %reason,
                "event hospitalized"
            ),
        }
        Ok(decision)
    }

    async fn apply(
        &self,
        tx: &mut dyn Transaction,
        envelope: &EventEnvelope,
        report: &FailureReport,
        decision: &Decision,
    ) -> Result<(), HandlerError> {
        match decision {
            Decision::Redeliver { scheduled_for } => {
                tx.enqueue_redelivery(envelope, *scheduled_for)
                    .await
                    .map_err(store_failure)?;
            }
            Decision::Quarantine { .. } => {
                let record = HospitalRecord::from_envelope(
                    envelope.clone(),
                    report.reason.clone(),
                    report.cause.clone(),
                    self.clock.now(),
                );
                tx.admit(record).await.map_err(store_failure)?;
            }
        }
        Ok(())
    }

    async fn notify_hospital(
        &self,
        envelope: &EventEnvelope,
        report: &FailureReport,
    ) -> Result<(), BrokerError> {
        let Some((topic, producer)) = &self.hospital_topic else {
            return Ok(());
        };
        let value = codec::encode_envelope(envelope).map_err(|err| BrokerError::SendFailed {
            topic: topic.broker_name(),
            reason: err.to_string(),
        })?;
        let mut headers = Headers::new();
        headers.insert(REASON_HEADER.to_string(), report.reason.clone());
        headers.insert(CAUSE_HEADER.to_string(), report.cause.clone());

        producer
            .send(ProducerRecord {
                topic: topic.broker_name(),
                key: envelope.key().map(str::to_string),
                value,
                headers,
            })
            .await?
            .wait()
            .await?;
        Ok(())
    }
}

fn store_failure(err: StoreError) -> HandlerError {
    HandlerError::retryable("StoreUnavailable", err.to_string())
}

#[async_trait]
impl RecordHandler for RetryCoordinator {
    async fn handle(&self, record: &ConsumerRecord) -> Result<(), HandlerError> {
        let envelope = codec::decode_envelope(&record.value)?;
        let report = FailureReport::from_headers(&record.headers);
        self.process(&envelope, &report).await?;
        Ok(())
    }
}

/// Error handler of the retry-topic loop.
///
/// Retryable failures (store or notification outage) defer the record so the
/// partition is rewound. Anything else cannot be redelivered or hospitalized
/// and is logged and skipped.
pub struct DeferOnRetryable;

#[async_trait]
impl ErrorHandler for DeferOnRetryable {
    async fn on_error(
        &self,
        record: &ConsumerRecord,
        error: &HandlerError,
    ) -> Result<(), RoutingError> {
        match error {
            HandlerError::Retryable { .. } => Err(RoutingError::Deferred(error.to_string())),
            other => {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %other,
                    "dropping unprocessable retry record"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    use super::*;
    use crate::domain::failure::SCHEDULE_HEADER;
    use crate::domain::{CorrelationId, DefaultDecider, Disposition, EventId, RetryPolicy};
    use crate::impls::{MemoryBroker, MemoryStore};
    use crate::ports::{Broker, FixedClock};

    struct Fixture {
        store: MemoryStore,
        clock: Arc<FixedClock>,
        coordinator: RetryCoordinator,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap(),
        ));
        let coordinator = RetryCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(DefaultDecider::new(RetryPolicy::default())),
            clock.clone(),
        );
        Fixture {
            store,
            clock,
            coordinator,
        }
    }

    fn envelope(retry_count: u32) -> EventEnvelope {
        EventEnvelope::new(
            EventId::from_ulid(Ulid::new()),
            CorrelationId::new("corr"),
            Topic::USER_AUTH,
            Some("test-key".into()),
            "user.auth.logged_in.v1",
            "{}".into(),
            Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap(),
        )
        .with_retry_count(retry_count)
    }

    fn retry_record(envelope: &EventEnvelope, report: &FailureReport) -> ConsumerRecord {
        ConsumerRecord {
            topic: "dead_letter_retry".into(),
            partition: 0,
            offset: 0,
            key: envelope.key().map(String::from),
            value: codec::encode_envelope(envelope).unwrap(),
            headers: report.to_headers(),
        }
    }

    fn report() -> FailureReport {
        FailureReport {
            reason: "Boom".into(),
            cause: "handler failed".into(),
            schedule: None,
            disposition: Disposition::Retry,
        }
    }

    #[tokio::test]
    async fn within_budget_creates_redelivery_row() {
        let fx = fixture();
        let original = envelope(0);

        fx.coordinator
            .handle(&retry_record(&original, &report()))
            .await
            .unwrap();

        let rows = fx.store.outbox_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].envelope.id(), original.id());
        assert_eq!(rows[0].envelope.retry_count(), 1);
        assert_eq!(rows[0].envelope.timestamp(), original.timestamp());
        assert_eq!(
            rows[0].scheduled_for,
            fx.clock.now() + chrono::Duration::minutes(5)
        );
        assert!(fx.store.hospital_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedule_header_is_honoured() {
        let fx = fixture();
        let at = fx.clock.now() + chrono::Duration::seconds(90);
        let mut record = retry_record(&envelope(1), &report());
        record
            .headers
            .insert(SCHEDULE_HEADER.to_string(), at.to_rfc3339());

        fx.coordinator.handle(&record).await.unwrap();

        assert_eq!(fx.store.outbox_rows()[0].scheduled_for, at);
    }

    #[tokio::test]
    async fn exhausted_budget_writes_exactly_one_hospital_record() {
        let fx = fixture();
        let exhausted = envelope(3);

        fx.coordinator
            .handle(&retry_record(&exhausted, &report()))
            .await
            .unwrap();

        assert!(fx.store.outbox_rows().is_empty());
        let hospital = fx.store.hospital_records().await.unwrap();
        assert_eq!(hospital.len(), 1);
        let (_, record) = &hospital[0];
        assert_eq!(record.envelope.id(), exhausted.id());
        assert_eq!(record.envelope.retry_count(), 3);
        assert_eq!(record.reason, "Boom");
        assert_eq!(record.cause, "handler failed");
        assert_eq!(record.timestamp, fx.clock.now());
    }

    #[tokio::test]
    async fn quarantine_disposition_skips_the_budget() {
        let fx = fixture();
        let mut report = report();
        report.disposition = Disposition::Quarantine;

        let decision = fx.coordinator.process(&envelope(0), &report).await.unwrap();

        assert!(matches!(decision, Decision::Quarantine { .. }));
        assert_eq!(fx.store.hospital_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_outage_is_retryable_and_writes_nothing() {
        let fx = fixture();
        fx.store.fail_next_commits(1);

        let err = fx.coordinator.process(&envelope(0), &report()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Retryable { .. }));
        assert!(fx.store.outbox_rows().is_empty());

        let routed = DeferOnRetryable
            .on_error(&retry_record(&envelope(0), &report()), &err)
            .await;
        assert!(matches!(routed, Err(RoutingError::Deferred(_))));
    }

    #[tokio::test]
    async fn hospital_notification_is_published() {
        let fx = fixture();
        let broker = MemoryBroker::new();
        let coordinator = fx.coordinator.with_hospital_topic(
            Topic::DEAD_LETTER_HOSPITAL,
            broker.producer().unwrap(),
        );
        let exhausted = envelope(3);

        coordinator.process(&exhausted, &report()).await.unwrap();

        let notices = broker.records("dead_letter_hospital");
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].headers[REASON_HEADER], "Boom");
        assert_eq!(codec::decode_envelope(&notices[0].value).unwrap(), exhausted);
    }

    #[tokio::test]
    async fn failed_notification_keeps_the_single_hospital_record() {
        let fx = fixture();
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let coordinator = fx.coordinator.with_hospital_topic(
            Topic::DEAD_LETTER_HOSPITAL,
            broker.producer().unwrap(),
        );

        let decision = coordinator.process(&envelope(3), &report()).await.unwrap();
        assert!(matches!(decision, Decision::Quarantine { .. }));
        assert_eq!(fx.store.hospital_records().await.unwrap().len(), 1);
        assert!(broker.records("dead_letter_hospital").is_empty());
    }

    #[tokio::test]
    async fn failed_commit_sends_no_notification() {
        let fx = fixture();
        let broker = MemoryBroker::new();
        fx.store.fail_next_commits(1);
        let coordinator = fx.coordinator.with_hospital_topic(
            Topic::DEAD_LETTER_HOSPITAL,
            broker.producer().unwrap(),
        );
        let exhausted = envelope(3);

        let err = coordinator.process(&exhausted, &report()).await.unwrap_err();
        assert_eq!(err.reason(), "StoreUnavailable");
        assert!(fx.store.hospital_records().await.unwrap().is_empty());
        assert!(broker.records("dead_letter_hospital").is_empty());

        // 再 poll で admit と通知が 1 回ずつ
        coordinator.process(&exhausted, &report()).await.unwrap();
        assert_eq!(fx.store.hospital_records().await.unwrap().len(), 1);
        assert_eq!(broker.records("dead_letter_hospital").len(), 1);
    }

    #[tokio::test]
    async fn malformed_retry_record_is_dropped() {
        let err = HandlerError::Poison(crate::error::CodecError::UnknownPayloadType("x".into()));
        let mut record = retry_record(&envelope(0), &report());
        record.value = b"nope".to_vec();
        assert!(DeferOnRetryable.on_error(&record, &err).await.is_ok());
    }
}
