//! Error types for every layer of the relay.
//!
//! Each concern gets its own enum so callers can match on the failure class
//! they care about:
//! - codec failures are schema/programmer errors (never retried at enqueue)
//! - store and broker failures are transient infrastructure errors
//! - handler failures are classified before retry routing

use thiserror::Error;

use crate::domain::{OutboxRowId, Topic};

/// Envelope and payload (de)serialization failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload could not be marshalled. Surfaced synchronously to the
    /// producing transaction.
    #[error("failed to serialize payload of type {payload_type}: {source}")]
    Serialization {
        payload_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// The body does not match the schema registered for `payload_type`.
    #[error("failed to deserialize payload of type {payload_type}: {source}")]
    Deserialization {
        payload_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// No decoder is registered for this tag.
    #[error("unknown payload type: {0}")]
    UnknownPayloadType(String),

    /// The transport bytes are not an envelope at all.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
}

impl CodecError {
    /// True for every decode-side failure (a poison message).
    pub fn is_deserialization(&self) -> bool {
        !matches!(self, CodecError::Serialization { .. })
    }
}

/// Outbox / hospital store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction already finished")]
    TransactionFinished,

    #[error("outbox row {0} is not claimed by this transaction")]
    NotClaimed(OutboxRowId),
}

/// Broker client failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("send to {topic} failed: {reason}")]
    SendFailed { topic: String, reason: String },

    #[error("broker client is closed")]
    Closed,

    #[error("delivery acknowledgement was dropped")]
    AckDropped,
}

/// Failures raised by `Consumer::poll` and friends.
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// `wakeup()` interrupted the poll. This is the stopping signal, not a
    /// broker fault.
    #[error("consumer woken up")]
    Woken,

    #[error("consumer is not subscribed")]
    NotSubscribed,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// How a failed record should be treated by the retry pipeline.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A business failure worth retrying with backoff.
    #[error("{reason}: {cause}")]
    Retryable {
        reason: String,
        cause: String,
        /// Explicit redelivery instant requested by the handler.
        reschedule_at: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// A failure that retrying cannot fix; quarantined immediately.
    #[error("{reason}: {cause}")]
    Fatal { reason: String, cause: String },

    /// The envelope or its payload could not be decoded.
    #[error("poison message: {0}")]
    Poison(#[from] CodecError),
}

impl HandlerError {
    pub fn retryable(reason: impl Into<String>, cause: impl Into<String>) -> Self {
        HandlerError::Retryable {
            reason: reason.into(),
            cause: cause.into(),
            reschedule_at: None,
        }
    }

    pub fn fatal(reason: impl Into<String>, cause: impl Into<String>) -> Self {
        HandlerError::Fatal {
            reason: reason.into(),
            cause: cause.into(),
        }
    }

    /// Ask for redelivery at a specific instant instead of the backoff.
    pub fn reschedule_at(self, at: chrono::DateTime<chrono::Utc>) -> Self {
        match self {
            HandlerError::Retryable { reason, cause, .. } => HandlerError::Retryable {
                reason,
                cause,
                reschedule_at: Some(at),
            },
            other => other,
        }
    }

    /// Failure class, written to the `dead-letter-reason` header.
    pub fn reason(&self) -> String {
        match self {
            HandlerError::Retryable { reason, .. } | HandlerError::Fatal { reason, .. } => {
                reason.clone()
            }
            HandlerError::Poison(_) => "DeserializationError".to_string(),
        }
    }

    /// Failure detail, written to the `dead-letter-cause` header.
    pub fn cause(&self) -> String {
        match self {
            HandlerError::Retryable { cause, .. } | HandlerError::Fatal { cause, .. } => {
                cause.clone()
            }
            HandlerError::Poison(err) => err.to_string(),
        }
    }
}

/// The error handler could not route a failed record anywhere.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("routing deferred: {0}")]
    Deferred(String),
}

/// A deliverer run failed; the whole batch was rolled back.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Producer-facing `send` failures.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration loading / validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Handler / decoder registration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler for topic '{0}' is already registered")]
    DuplicateHandler(Topic),

    #[error("decoder for payload type '{0}' is already registered")]
    DuplicateDecoder(String),
}

/// Relay wiring failures, raised by `RelayBuilder::build`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing handlers for topics: {0:?}")]
    MissingTopics(Vec<String>),

    #[error("no store configured")]
    MissingStore,

    #[error("no broker configured")]
    MissingBroker,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poison_reason_is_deserialization_error() {
        let err = HandlerError::from(CodecError::UnknownPayloadType("nope".into()));
        assert_eq!(err.reason(), "DeserializationError");
        assert!(err.cause().contains("nope"));
    }

    #[test]
    fn reschedule_only_applies_to_retryable() {
        let at = chrono::Utc::now();
        let err = HandlerError::retryable("Timeout", "upstream slow").reschedule_at(at);
        assert!(matches!(err, HandlerError::Retryable { reschedule_at: Some(t), .. } if t == at));

        let err = HandlerError::fatal("Invalid", "bad state").reschedule_at(at);
        assert!(matches!(err, HandlerError::Fatal { .. }));
    }

    #[test]
    fn serialization_is_not_a_poison_condition() {
        let source = serde_json::from_str::<u8>("x").unwrap_err();
        let err = CodecError::Serialization {
            payload_type: "t".into(),
            source,
        };
        assert!(!err.is_deserialization());
    }
}
