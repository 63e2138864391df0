//! Envelope codec.
//!
//! Two layers:
//! - payload <-> JSON text stored in `EventEnvelope::payload`
//! - envelope <-> JSON bytes carried as the broker record value

pub mod decoders;
pub mod payload;

pub use self::decoders::PayloadDecoders;
pub use self::payload::Payload;

use crate::domain::EventEnvelope;
use crate::error::CodecError;

/// Marshals a payload. A failure here is a schema bug in the producer and
/// must surface to the caller's transaction, never be retried.
pub fn serialize<P: Payload>(payload: &P) -> Result<String, CodecError> {
    serde_json::to_string(payload).map_err(|source| CodecError::Serialization {
        payload_type: P::TYPE.to_string(),
        source,
    })
}

/// Unmarshals a payload of a statically known type.
///
/// `payload_type` must match `P::TYPE`; anything else is an unknown type for
/// this decoder.
pub fn deserialize<P: Payload>(payload_type: &str, body: &str) -> Result<P, CodecError> {
    if payload_type != P::TYPE {
        return Err(CodecError::UnknownPayloadType(payload_type.to_string()));
    }
    serde_json::from_str(body).map_err(|source| CodecError::Deserialization {
        payload_type: payload_type.to_string(),
        source,
    })
}

/// Decodes the payload carried by an envelope.
pub fn decode_payload<P: Payload>(envelope: &EventEnvelope) -> Result<P, CodecError> {
    deserialize(envelope.payload_type(), envelope.payload())
}

pub fn encode_envelope(envelope: &EventEnvelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(|source| CodecError::Serialization {
        payload_type: envelope.payload_type().to_string(),
        source,
    })
}

pub fn decode_envelope(bytes: &[u8]) -> Result<EventEnvelope, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::MalformedEnvelope)
}
