//! Domain model.
//!
//! Pure data and pure decisions. Nothing in here touches the store or the
//! broker.

pub mod context;
pub mod decision;
pub mod envelope;
pub mod failure;
pub mod ids;
pub mod records;
pub mod topic;

pub use context::RequestContext;
pub use decision::{Backoff, Decider, Decision, DefaultDecider, RetryPolicy};
pub use envelope::EventEnvelope;
pub use failure::{Disposition, FailureReport, Headers};
pub use ids::{CorrelationId, Event, EventId, HospitalRowId, Id, IdMarker, OutboxRowId};
pub use records::{HospitalRecord, OutboxRecord};
pub use topic::Topic;
