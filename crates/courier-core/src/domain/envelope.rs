//! The immutable event record carried end to end.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CorrelationId, EventId};
use super::topic::Topic;

/// Event envelope.
///
/// `id`, `topic` and `payload` never change after creation. Redelivery only
/// bumps `retry_count`; scheduling lives on the outbox row, not here.
///
/// Equality and hashing look at `id` alone, which is the idempotency key
/// consumers deduplicate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    id: EventId,
    correlation_id: CorrelationId,
    topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    payload_type: String,
    /// JSON text of the payload.
    payload: String,
    #[serde(default)]
    retry_count: u32,
    timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(
        id: EventId,
        correlation_id: CorrelationId,
        topic: Topic,
        key: Option<String>,
        payload_type: impl Into<String>,
        payload: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            correlation_id,
            topic,
            key,
            payload_type: payload_type.into(),
            payload,
            retry_count: 0,
            timestamp,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The copy that goes back into the outbox for the next attempt.
    pub fn redelivered(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Restores an envelope at a known attempt count (row hydration, tests).
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

impl PartialEq for EventEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventEnvelope {}

impl Hash for EventEnvelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    fn envelope() -> EventEnvelope {
        EventEnvelope::new(
            EventId::from_ulid(Ulid::new()),
            CorrelationId::new("corr-1"),
            Topic::USER_AUTH,
            Some("test-key".to_string()),
            "user.auth.login.v1",
            r#"{"userId":"u-1"}"#.to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn equality_is_by_id_only() {
        let a = envelope();
        let b = a.redelivered().redelivered();
        assert_eq!(a, b);
        assert_ne!(a.retry_count(), b.retry_count());
        assert_ne!(a, envelope());
    }

    #[test]
    fn redelivery_keeps_identity_and_bumps_count() {
        let original = envelope();
        let next = original.redelivered();

        assert_eq!(next.id(), original.id());
        assert_eq!(next.correlation_id(), original.correlation_id());
        assert_eq!(next.topic(), original.topic());
        assert_eq!(next.payload(), original.payload());
        assert_eq!(next.timestamp(), original.timestamp());
        assert_eq!(next.retry_count(), original.retry_count() + 1);
    }

    #[test]
    fn wire_fields_are_camel_case() {
        let json = serde_json::to_value(envelope()).unwrap();
        assert!(json.get("correlationId").is_some());
        assert!(json.get("payloadType").is_some());
        assert_eq!(json["retryCount"], 0);
        assert_eq!(json["topic"], "USER_AUTH");
    }
}
