//! Retry-topic forwarding.
//!
//! The error handler used by business consumer loops. A failed record is
//! republished unchanged to the retry topic with failure headers. The send
//! is awaited before returning, so the consumer only commits past a record
//! once its retry copy is on the broker.
//!
//! A record without a readable envelope cannot be redelivered or admitted to
//! the hospital store. With a hospital notification topic configured, its raw
//! bytes are published there with quarantine headers; otherwise it is only
//! logged.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::consumer_loop::ErrorHandler;
use crate::codec;
use crate::domain::{Disposition, FailureReport, Topic};
use crate::error::{CodecError, HandlerError, RoutingError};
use crate::ports::{ConsumerRecord, Producer, ProducerRecord};

pub struct RetryForwarder {
    producer: Arc<dyn Producer>,
    retry_topic: Topic,
    hospital_topic: Option<Topic>,
    quarantine_poison: bool,
}

impl RetryForwarder {
    pub fn new(producer: Arc<dyn Producer>, retry_topic: Topic, quarantine_poison: bool) -> Self {
        Self {
            producer,
            retry_topic,
            hospital_topic: None,
            quarantine_poison,
        }
    }

    /// Where records without a readable envelope go.
    pub fn with_hospital_topic(mut self, topic: Topic) -> Self {
        self.hospital_topic = Some(topic);
        self
    }

    async fn quarantine_unreadable(
        &self,
        record: &ConsumerRecord,
        error: &HandlerError,
        decode_err: &CodecError,
    ) -> Result<(), RoutingError> {
        let Some(topic) = &self.hospital_topic else {
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %decode_err,
                "dropping record without a readable envelope"
            );
            return Ok(());
        };

        let mut report = FailureReport::from_error(error, true);
        report.disposition = Disposition::Quarantine;
        report.schedule = None;
        let meta = self
            .producer
            .send(ProducerRecord {
                topic: topic.broker_name(),
                key: record.key.clone(),
                value: record.value.clone(),
                headers: report.to_headers(),
            })
            .await?
            .wait()
            .await?;

        warn!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            error = %decode_err,
            hospital_offset = meta.offset,
            "record without a readable envelope sent to hospital topic"
        );
        Ok(())
    }
}

#[async_trait]
impl ErrorHandler for RetryForwarder {
    async fn on_error(
        &self,
        record: &ConsumerRecord,
        error: &HandlerError,
    ) -> Result<(), RoutingError> {
        // envelope が読めないと redelivery も hospital 行もできない
        let envelope = match codec::decode_envelope(&record.value) {
            Ok(envelope) => envelope,
            Err(decode_err) => return self.quarantine_unreadable(record, error, &decode_err).await,
        };

        let report = FailureReport::from_error(error, self.quarantine_poison);
        let ack = self
            .producer
            .send(ProducerRecord {
                topic: self.retry_topic.broker_name(),
                key: envelope.key().map(str::to_string),
                value: record.value.clone(),
                headers: report.to_headers(),
            })
            .await?;
        let meta = ack.wait().await?;

        info!(
            event_id = %envelope.id(),
            correlation_id = %envelope.correlation_id(),
            retry_count = envelope.retry_count(),
            reason = %report.reason,
            disposition = %report.disposition,
            retry_offset = meta.offset,
            "failed event forwarded to retry topic"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use ulid::Ulid;

    use super::*;
    use crate::domain::failure::{CAUSE_HEADER, DISPOSITION_HEADER, REASON_HEADER};
    use crate::domain::{CorrelationId, EventEnvelope, EventId, Headers};
    use crate::error::BrokerError;
    use crate::impls::MemoryBroker;
    use crate::ports::Broker;

    fn failed_record() -> (EventEnvelope, ConsumerRecord) {
        let envelope = EventEnvelope::new(
            EventId::from_ulid(Ulid::new()),
            CorrelationId::new("corr"),
            Topic::USER_AUTH,
            Some("test-key".into()),
            "user.auth.logged_in.v1",
            r#"{"userId":"u"}"#.into(),
            Utc::now(),
        );
        let record = ConsumerRecord {
            topic: "user_auth".into(),
            partition: 1,
            offset: 9,
            key: Some("test-key".into()),
            value: codec::encode_envelope(&envelope).unwrap(),
            headers: Headers::new(),
        };
        (envelope, record)
    }

    #[tokio::test]
    async fn forwards_original_value_with_failure_headers() {
        let broker = MemoryBroker::new();
        let forwarder = RetryForwarder::new(broker.producer().unwrap(), Topic::DEAD_LETTER_RETRY, false);
        let (envelope, record) = failed_record();

        forwarder
            .on_error(&record, &HandlerError::retryable("Timeout", "upstream slow"))
            .await
            .unwrap();

        let forwarded = broker.records("dead_letter_retry");
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].key.as_deref(), Some("test-key"));
        assert_eq!(forwarded[0].value, record.value);
        assert_eq!(forwarded[0].headers[REASON_HEADER], "Timeout");
        assert_eq!(forwarded[0].headers[CAUSE_HEADER], "upstream slow");
        assert_eq!(forwarded[0].headers[DISPOSITION_HEADER], "retry");
        assert_eq!(codec::decode_envelope(&forwarded[0].value).unwrap(), envelope);
    }

    #[tokio::test]
    async fn poison_follows_quarantine_setting() {
        let broker = MemoryBroker::new();
        let forwarder = RetryForwarder::new(broker.producer().unwrap(), Topic::DEAD_LETTER_RETRY, true);
        let (_, record) = failed_record();

        let poison = HandlerError::Poison(CodecError::UnknownPayloadType("x".into()));
        forwarder.on_error(&record, &poison).await.unwrap();

        let forwarded = broker.records("dead_letter_retry");
        assert_eq!(forwarded[0].headers[REASON_HEADER], "DeserializationError");
        assert_eq!(forwarded[0].headers[DISPOSITION_HEADER], "quarantine");
    }

    #[tokio::test]
    async fn unreachable_retry_topic_is_a_routing_error() {
        let broker = MemoryBroker::new();
        let forwarder = RetryForwarder::new(broker.producer().unwrap(), Topic::DEAD_LETTER_RETRY, false);
        broker.set_available(false);
        let (_, record) = failed_record();

        let err = forwarder
            .on_error(&record, &HandlerError::retryable("Boom", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Broker(BrokerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn unreadable_envelope_is_dropped() {
        let broker = MemoryBroker::new();
        let forwarder = RetryForwarder::new(broker.producer().unwrap(), Topic::DEAD_LETTER_RETRY, false);
        let (_, mut record) = failed_record();
        record.value = b"garbage".to_vec();

        let err = HandlerError::Poison(CodecError::UnknownPayloadType("?".into()));
        forwarder.on_error(&record, &err).await.unwrap();
        assert!(broker.records("dead_letter_retry").is_empty());
    }

    #[tokio::test]
    async fn unreadable_envelope_goes_to_hospital_topic_when_configured() {
        let broker = MemoryBroker::new();
        let forwarder = RetryForwarder::new(broker.producer().unwrap(), Topic::DEAD_LETTER_RETRY, false)
            .with_hospital_topic(Topic::DEAD_LETTER_HOSPITAL);
        let (_, mut record) = failed_record();
        record.value = b"garbage".to_vec();

        let err = HandlerError::Poison(CodecError::UnknownPayloadType("?".into()));
        forwarder.on_error(&record, &err).await.unwrap();

        assert!(broker.records("dead_letter_retry").is_empty());
        let parked = broker.records("dead_letter_hospital");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].value, b"garbage".to_vec());
        assert_eq!(parked[0].key.as_deref(), Some("test-key"));
        assert_eq!(parked[0].headers[REASON_HEADER], "DeserializationError");
        assert_eq!(parked[0].headers[DISPOSITION_HEADER], "quarantine");
    }

    #[tokio::test]
    async fn unreachable_hospital_topic_keeps_unreadable_record_uncommitted() {
        let broker = MemoryBroker::new();
        let forwarder = RetryForwarder::new(broker.producer().unwrap(), Topic::DEAD_LETTER_RETRY, false)
            .with_hospital_topic(Topic::DEAD_LETTER_HOSPITAL);
        broker.set_available(false);
        let (_, mut record) = failed_record();
        record.value = b"garbage".to_vec();

        let err = HandlerError::Poison(CodecError::UnknownPayloadType("?".into()));
        let routed = forwarder.on_error(&record, &err).await;
        assert!(matches!(routed, Err(RoutingError::Broker(_))));
    }
}
