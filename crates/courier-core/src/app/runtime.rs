//! RelayBuilder / Relay / RunningRelay - 組み立てと起動・停止
//!
//! # 起動するもの
//! - Deliverer（outbox → broker、`delivery.interval` ごと）
//! - 登録された topic ごとに 1 本の consumer run-loop
//!   （`EnvelopeDispatcher` + `RetryForwarder`）
//! - retry topic の run-loop（`RetryCoordinator` + `DeferOnRetryable`）
//!
//! # 停止順
//! business consumer → retry coordinator → deliverer（最後に producer を close）。
//! consumer が retry topic に送る分を coordinator が拾い、coordinator が outbox に
//! 積んだ分は次回起動時に deliverer が送る。

use std::sync::Arc;

use tracing::info;

use super::consumer_loop::{ConsumerLoop, ConsumerLoopHandle};
use super::dead_letter::RetryForwarder;
use super::deliverer::{Deliverer, DelivererHandle};
use super::dispatch::{EnvelopeDispatcher, EventHandler, HandlerRegistry, PayloadHandler, TypedHandler};
use super::publisher::EventPublisher;
use super::retry_coordinator::{DeferOnRetryable, RetryCoordinator};
use super::status::RelayStatus;
use crate::codec::Payload;
use crate::config::RelayConfig;
use crate::domain::{Decider, DefaultDecider, Topic};
use crate::error::{BrokerError, BuildError, RegistryError, StoreError};
use crate::ports::{Broker, Clock, IdGenerator, Store, SystemClock, UlidGenerator};

/// Wires a relay from its ports and handlers.
///
/// # 使用例
/// ```ignore
/// let relay = RelayBuilder::new(RelayConfig::from_env()?)
///     .store(Arc::new(store))
///     .broker(Arc::new(broker))
///     .register_typed::<UserLoggedIn, _>(Topic::USER_AUTH, AuditLogin)?
///     .expect_topics(&[Topic::USER_AUTH])
///     .build()?;
/// let running = relay.start()?;
/// ```
///
/// # Fail-fast
/// `build()` は expect_topics の全 topic に handler があることを確認する。
pub struct RelayBuilder {
    config: RelayConfig,
    store: Option<Arc<dyn Store>>,
    broker: Option<Arc<dyn Broker>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
    registry: HandlerRegistry,
    expected_topics: Option<Vec<Topic>>,
}

impl RelayBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            store: None,
            broker: None,
            clock: None,
            ids: None,
            decider: None,
            registry: HandlerRegistry::new(),
            expected_topics: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Defaults to `SystemClock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to a `UlidGenerator` on the relay clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Defaults to `DefaultDecider` with `config.retry.policy()`.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn register(
        mut self,
        topic: Topic,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(topic, handler)?;
        Ok(self)
    }

    /// Registers a handler for a single payload type on `topic`.
    pub fn register_typed<P, H>(self, topic: Topic, handler: H) -> Result<Self, RegistryError>
    where
        P: Payload,
        H: PayloadHandler<P> + 'static,
    {
        self.register(topic, Arc::new(TypedHandler::<P, H>::new(handler)))
    }

    pub fn expect_topics(mut self, topics: &[Topic]) -> Self {
        self.expected_topics = Some(topics.to_vec());
        self
    }

    pub fn build(self) -> Result<Relay, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let broker = self.broker.ok_or(BuildError::MissingBroker)?;

        if let Some(expected) = &self.expected_topics {
            let registered = self.registry.topics();
            let missing: Vec<String> = expected
                .iter()
                .filter(|topic| !registered.contains(topic))
                .map(|topic| topic.as_str().to_string())
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTopics(missing));
            }
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))) as Arc<dyn IdGenerator>);
        let decider = self.decider.unwrap_or_else(|| {
            Arc::new(DefaultDecider::new(self.config.retry.policy())) as Arc<dyn Decider>
        });

        Ok(Relay {
            publisher: EventPublisher::new(ids, Arc::clone(&clock)),
            config: self.config,
            store,
            broker,
            clock,
            decider,
            registry: self.registry,
        })
    }
}

/// A wired but not yet started relay.
pub struct Relay {
    config: RelayConfig,
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    decider: Arc<dyn Decider>,
    registry: HandlerRegistry,
    publisher: EventPublisher,
}

impl Relay {
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Spawns every loop. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<RunningRelay, BrokerError> {
        let group = self.config.group_id.as_str();
        let poll_timeout = self.config.consumer.poll_timeout();
        let error_backoff = self.config.consumer.error_backoff();
        let producer = self.broker.producer()?;

        // consumer を全部作ってから spawn する（途中で失敗しても何も動いていない）
        let mut forwarder = RetryForwarder::new(
            Arc::clone(&producer),
            self.config.retry.retry_topic(),
            self.config.retry.quarantine_poison,
        );
        if let Some(hospital_topic) = self.config.retry.hospital_topic() {
            forwarder = forwarder.with_hospital_topic(hospital_topic);
        }
        let forwarder = Arc::new(forwarder);
        let mut business = Vec::new();
        for topic in self.registry.topics() {
            let Some(handler) = self.registry.get(&topic) else {
                continue;
            };
            let consumer = self.broker.consumer(group)?;
            business.push(ConsumerLoop::new(
                format!("{group}-{}", topic.broker_name()),
                consumer,
                vec![topic.broker_name()],
                Arc::new(EnvelopeDispatcher::new(handler)),
                Arc::clone(&forwarder) as _,
            ));
        }

        let retry_topic = self.config.retry.retry_topic();
        let mut coordinator = RetryCoordinator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.decider),
            Arc::clone(&self.clock),
        );
        if let Some(hospital_topic) = self.config.retry.hospital_topic() {
            coordinator = coordinator.with_hospital_topic(hospital_topic, Arc::clone(&producer));
        }
        let retry_loop = ConsumerLoop::new(
            format!("{group}-{}", retry_topic.broker_name()),
            self.broker.consumer(group)?,
            vec![retry_topic.broker_name()],
            Arc::new(coordinator),
            Arc::new(DeferOnRetryable),
        );

        let consumers: Vec<ConsumerLoopHandle> = business
            .into_iter()
            .map(|run_loop| {
                run_loop
                    .with_poll_timeout(poll_timeout)
                    .with_error_backoff(error_backoff)
                    .spawn()
            })
            .collect();
        let retry_coordinator = retry_loop
            .with_poll_timeout(poll_timeout)
            .with_error_backoff(error_backoff)
            .spawn();
        let deliverer = Arc::new(Deliverer::new(
            Arc::clone(&self.store),
            producer,
            Arc::clone(&self.clock),
            self.config.delivery.batch_size,
        ))
        .spawn(self.config.delivery.interval());

        info!(
            group = %group,
            consumers = consumers.len(),
            retry_topic = %retry_topic,
            "relay started"
        );
        Ok(RunningRelay {
            store: self.store,
            clock: self.clock,
            publisher: self.publisher,
            consumers,
            retry_coordinator,
            deliverer,
        })
    }
}

pub struct RunningRelay {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    publisher: EventPublisher,
    consumers: Vec<ConsumerLoopHandle>,
    retry_coordinator: ConsumerLoopHandle,
    deliverer: DelivererHandle,
}

impl RunningRelay {
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub async fn status(&self) -> Result<RelayStatus, StoreError> {
        let counts = self.store.counts(self.clock.now()).await?;
        Ok(RelayStatus {
            counts,
            consumers: self
                .consumers
                .iter()
                .map(|handle| (handle.name().to_string(), handle.state()))
                .collect(),
            retry_coordinator: self.retry_coordinator.state(),
            delivery_in_flight: self.deliverer.deliverer().is_running(),
        })
    }

    pub async fn shutdown(self) {
        for handle in &self.consumers {
            handle.stop();
        }
        for handle in &self.consumers {
            handle.join().await;
        }
        self.retry_coordinator.stop_and_join().await;
        self.deliverer.shutdown().await;
        info!("relay stopped");
    }
}
