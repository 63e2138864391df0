//! Producer-facing API.
//!
//! `send` writes the envelope into the outbox inside the caller's open
//! transaction. Nothing reaches the broker here; the deliverer picks the row
//! up after the caller commits. A rolled-back business transaction leaves no
//! row behind.

use std::sync::Arc;

use tracing::debug;

use crate::codec::{self, Payload};
use crate::domain::{EventEnvelope, EventId, RequestContext, Topic};
use crate::error::PublishError;
use crate::ports::{Clock, IdGenerator, Transaction};

#[derive(Clone)]
pub struct EventPublisher {
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl EventPublisher {
    pub fn new(ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>) -> Self {
        Self { ids, clock }
    }

    /// Enqueues `payload` on `topic`.
    ///
    /// Fails with `PublishError::Codec` if the payload cannot be encoded; the
    /// caller should abort its transaction.
    pub async fn send<P: Payload>(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        topic: &Topic,
        payload: &P,
        key: Option<&str>,
    ) -> Result<EventId, PublishError> {
        let body = codec::serialize(payload)?;
        let envelope = EventEnvelope::new(
            self.ids.generate_event_id(),
            ctx.correlation_id().clone(),
            topic.clone(),
            key.map(str::to_string),
            P::TYPE,
            body,
            self.clock.now(),
        );
        let event_id = envelope.id();

        let row_id = tx.enqueue(envelope).await?;
        debug!(
            event_id = %event_id,
            %topic,
            correlation_id = %ctx.correlation_id(),
            %row_id,
            "event enqueued"
        );
        Ok(event_id)
    }
}
