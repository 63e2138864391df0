//! Rows of the outbox and hospital tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::EventEnvelope;
use super::ids::OutboxRowId;

/// An outbox row: the envelope plus its delivery eligibility time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub row_id: OutboxRowId,
    pub envelope: EventEnvelope,
    /// Eligible for delivery at or after this instant.
    pub scheduled_for: DateTime<Utc>,
}

/// A terminal record for an event that exhausted its retry budget.
///
/// Append-only. The store assigns the row id on admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HospitalRecord {
    pub envelope: EventEnvelope,
    /// Failure class.
    pub reason: String,
    /// Failure detail.
    pub cause: String,
    pub timestamp: DateTime<Utc>,
}

impl HospitalRecord {
    pub fn from_envelope(
        envelope: EventEnvelope,
        reason: impl Into<String>,
        cause: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            envelope,
            reason: reason.into(),
            cause: cause.into(),
            timestamp,
        }
    }
}
