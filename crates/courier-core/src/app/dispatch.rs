//! Consumer-facing API - topic ごとの handler 登録と envelope の decode
//!
//! # 学習ポイント
//! - ジェネリック trait (PayloadHandler<P>, VariantHandler<E>)
//! - Object-safe trait (EventHandler)
//! - Type erasure パターン (TypedHandler<P, H> → EventHandler)
//!
//! broker レコード → `EnvelopeDispatcher`（envelope を decode）→ `EventHandler`。
//! decode 失敗は `HandlerError::Poison` として retry / hospital の経路に乗る。

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Instrument, debug, info_span};

use super::consumer_loop::RecordHandler;
use crate::codec::{self, Payload, PayloadDecoders};
use crate::domain::{EventEnvelope, Topic};
use crate::error::{HandlerError, RegistryError};
use crate::ports::ConsumerRecord;

/// Handles a decoded envelope. Must be idempotent on `envelope.id()`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Handles one payload type.
///
/// # 使用例
/// ```ignore
/// struct AuditLogin;
///
/// #[async_trait]
/// impl PayloadHandler<UserLoggedIn> for AuditLogin {
///     async fn handle(&self, envelope: &EventEnvelope, payload: UserLoggedIn) -> Result<(), HandlerError> {
///         // envelope.id() で重複排除
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait PayloadHandler<P: Payload>: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope, payload: P) -> Result<(), HandlerError>;
}

pub struct TypedHandler<P: Payload, H: PayloadHandler<P>> {
    handler: H,
    _marker: PhantomData<fn() -> P>,
}

impl<P: Payload, H: PayloadHandler<P>> TypedHandler<P, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<P: Payload, H: PayloadHandler<P>> EventHandler for TypedHandler<P, H> {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let payload: P = codec::decode_payload(envelope)?;
        self.handler.handle(envelope, payload).await
    }
}

/// Handles every payload type of a topic as a variant of `E`.
#[async_trait]
pub trait VariantHandler<E: Send + 'static>: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope, event: E) -> Result<(), HandlerError>;
}

/// Decodes through a `PayloadDecoders<E>` table, then calls the handler.
pub struct DecodingHandler<E, H> {
    decoders: PayloadDecoders<E>,
    handler: H,
}

impl<E: Send + 'static, H: VariantHandler<E>> DecodingHandler<E, H> {
    pub fn new(decoders: PayloadDecoders<E>, handler: H) -> Self {
        Self { decoders, handler }
    }
}

#[async_trait]
impl<E: Send + 'static, H: VariantHandler<E>> EventHandler for DecodingHandler<E, H> {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let event = self.decoders.decode_envelope(envelope)?;
        self.handler.handle(envelope, event).await
    }
}

/// One handler per logical topic.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<Topic, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        topic: Topic,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&topic) {
            return Err(RegistryError::DuplicateHandler(topic));
        }
        self.handlers.insert(topic, handler);
        Ok(())
    }

    pub fn get(&self, topic: &Topic) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(topic).cloned()
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }
}

/// Bridges a broker record to an `EventHandler`.
pub struct EnvelopeDispatcher {
    handler: Arc<dyn EventHandler>,
}

impl EnvelopeDispatcher {
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl RecordHandler for EnvelopeDispatcher {
    async fn handle(&self, record: &ConsumerRecord) -> Result<(), HandlerError> {
        let envelope = codec::decode_envelope(&record.value)?;
        let span = info_span!(
            "handle_event",
            event_id = %envelope.id(),
            topic = %envelope.topic(),
            correlation_id = %envelope.correlation_id(),
            retry_count = envelope.retry_count(),
        );
        async {
            self.handler.handle(&envelope).await?;
            debug!("event handled");
            Ok::<(), HandlerError>(())
        }
        .instrument(span)
        .await
    }
}
