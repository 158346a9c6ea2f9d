// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The broker-backed event back-end.
//!
//! Queue layout: one durable topic exchange carries all events. Each handler gets a queue named
//! `<interface>-<function>` (durable, shared across replicas), or an instance-unique
//! auto-deleting queue for `broadcast`/`once` subscriptions, bound to the exchange once per
//! pattern. Delayed emits publish to a direct `<exchange>_waiting` exchange routed to a
//! per-delay wait queue whose per-message TTL dead-letters back onto the main exchange.
//!
//! The broker product is interchangeable: anything providing durable exchanges/queues,
//! auto-delete, per-message TTL, dead-letter exchanges and negative acknowledgement can
//! implement [`Broker`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use hive_shutdown::{Shutdown, ShutdownSignal};
use tokio::sync::{broadcast, mpsc};

use crate::{
    config::EventsConfig,
    container::ContainerHandle,
    events::{Event, EventContext, EventError, EventHandlerBinding, EventSystem},
    hooks::ErrorReport,
    metrics,
    serializer,
};

const LOG_TARGET: &str = "hive::events::broker";

const RECONSUME_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unknown exchange '{0}'")]
    UnknownExchange(String),
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),
    #[error("broker connection closed")]
    Closed,
    #[error("broker error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
}

#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub message_ttl: Option<Duration>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            message_ttl: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    pub fn auto_delete(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: true,
            message_ttl: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }
}

/// Acknowledgement handle of one delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&mut self) -> Result<(), BrokerError>;
    async fn nack(&mut self, requeue: bool) -> Result<(), BrokerError>;
}

pub struct Delivery {
    pub payload: Bytes,
    pub routing_key: String,
    pub(crate) ack: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(payload: Bytes, routing_key: String, ack: Box<dyn AckHandle>) -> Self {
        Self {
            payload,
            routing_key,
            ack,
        }
    }

    pub async fn ack(mut self) -> Result<(), BrokerError> {
        self.ack.ack().await
    }

    pub async fn nack(mut self, requeue: bool) -> Result<(), BrokerError> {
        self.ack.nack(requeue).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The broker connection was re-established, e.g. after a failover. Consumers re-declare
    /// their queues and bindings, because auto-delete queues may have vanished.
    Reconnected,
}

/// A topic-routed message queue.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<(), BrokerError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Start consuming from a queue. Dropping the receiver cancels the consumer.
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent>;
}

struct ConsumerEntry {
    binding: Arc<EventHandlerBinding>,
    shutdown: Option<Shutdown>,
}

/// The broker-backed [`EventSystem`].
pub struct BrokerEventSystem<B> {
    broker: Arc<B>,
    config: EventsConfig,
    consumers: Mutex<HashMap<String, ConsumerEntry>>,
    context: Mutex<Option<EventContext>>,
    shutdown: ShutdownSignal,
    self_ref: Mutex<Weak<BrokerEventSystem<B>>>,
}

impl<B: Broker> BrokerEventSystem<B> {
    pub fn new(broker: B, config: EventsConfig, shutdown: ShutdownSignal) -> Arc<Self> {
        let system = Arc::new(Self {
            broker: Arc::new(broker),
            config,
            consumers: Mutex::new(HashMap::new()),
            context: Mutex::new(None),
            shutdown,
            self_ref: Mutex::new(Weak::new()),
        });
        *system.self_ref.lock().expect("event system self ref lock poisoned") = Arc::downgrade(&system);
        system
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    fn context(&self) -> Option<EventContext> {
        self.context.lock().expect("event context lock poisoned").clone()
    }

    fn weak(&self) -> Weak<Self> {
        self.self_ref.lock().expect("event system self ref lock poisoned").clone()
    }

    async fn declare(&self, binding: &Arc<EventHandlerBinding>) -> Result<(), EventError> {
        self.broker
            .declare_exchange(&self.config.exchange, ExchangeKind::Topic, true)
            .await?;
        let spec = if binding.broadcast() || binding.once() {
            QueueSpec::auto_delete(binding.queue_name())
        } else {
            QueueSpec::durable(binding.queue_name())
        };
        self.broker.declare_queue(&spec).await?;
        for pattern in binding.patterns() {
            self.broker
                .bind_queue(binding.queue_name(), &self.config.exchange, pattern)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<B: Broker> EventSystem for BrokerEventSystem<B> {
    fn install(&self, handle: ContainerHandle) {
        *self.context.lock().expect("event context lock poisoned") = Some(EventContext {
            hook: handle.error_hook().clone(),
            tasks: handle.tasks(),
        });
    }

    async fn subscribe(&self, handler: Arc<EventHandlerBinding>, consume: bool) -> Result<(), EventError> {
        {
            let consumers = self.consumers.lock().expect("consumer table lock poisoned");
            if let Some(entry) = consumers.get(handler.queue_name()) {
                if !Arc::ptr_eq(&entry.binding, &handler) {
                    return Err(EventError::AlreadySubscribed(handler.queue_name().to_string()));
                }
                return Ok(());
            }
        }
        self.declare(&handler).await?;
        let shutdown = if consume {
            let shutdown = Shutdown::new();
            tokio::spawn(run_consumer(
                self.weak(),
                Arc::clone(&self.broker),
                Arc::clone(&handler),
                shutdown.to_signal(),
                self.shutdown.clone(),
            ));
            Some(shutdown)
        } else {
            None
        };
        self.consumers
            .lock()
            .expect("consumer table lock poisoned")
            .insert(handler.queue_name().to_string(), ConsumerEntry {
                binding: handler,
                shutdown,
            });
        Ok(())
    }

    async fn unsubscribe(&self, handler: &Arc<EventHandlerBinding>) -> Result<(), EventError> {
        let mut consumers = self.consumers.lock().expect("consumer table lock poisoned");
        let is_same = consumers
            .get(handler.queue_name())
            .map(|entry| Arc::ptr_eq(&entry.binding, handler));
        match is_same {
            Some(true) => {
                let mut entry = consumers.remove(handler.queue_name()).expect("entry just found");
                if let Some(shutdown) = entry.shutdown.as_mut() {
                    shutdown.trigger();
                }
                Ok(())
            },
            Some(false) => Err(EventError::UnknownSubscription(format!(
                "{}.{} is not subscribed to '{}'",
                handler.interface(),
                handler.function(),
                handler.queue_name()
            ))),
            None => Err(EventError::UnknownSubscription(handler.queue_name().to_string())),
        }
    }

    async fn emit(&self, event: Event, delay: Duration) -> Result<(), EventError> {
        let payload = serializer::default_serializer().encode(&event)?;
        metrics::events_emitted_total(&event.event_type).inc();
        self.broker
            .declare_exchange(&self.config.exchange, ExchangeKind::Topic, true)
            .await?;
        if delay.is_zero() {
            self.broker
                .publish(&self.config.exchange, &event.event_type, payload)
                .await?;
            return Ok(());
        }

        // Delayed emit without a server-side scheduler: publish to the waiting exchange, routed
        // to an intermediate queue whose per-message TTL dead-letters the message back onto the
        // main exchange with the original routing key.
        let wait_exchange = format!("{}_waiting", self.config.exchange);
        self.broker
            .declare_exchange(&wait_exchange, ExchangeKind::Direct, true)
            .await?;
        let wait_queue = QueueSpec {
            name: format!("{}-wait_{}", event.event_type, delay.as_millis()),
            durable: true,
            auto_delete: false,
            message_ttl: Some(delay),
            dead_letter_exchange: Some(self.config.exchange.clone()),
            dead_letter_routing_key: Some(event.event_type.clone()),
        };
        self.broker.declare_queue(&wait_queue).await?;
        self.broker
            .bind_queue(&wait_queue.name, &wait_exchange, &event.event_type)
            .await?;
        self.broker
            .publish(&wait_exchange, &event.event_type, payload)
            .await?;
        Ok(())
    }

    async fn stop(&self) {
        let mut consumers = self.consumers.lock().expect("consumer table lock poisoned");
        for (_, mut entry) in consumers.drain() {
            if let Some(shutdown) = entry.shutdown.as_mut() {
                shutdown.trigger();
            }
        }
    }
}

async fn run_consumer<B: Broker>(
    system: Weak<BrokerEventSystem<B>>,
    broker: Arc<B>,
    binding: Arc<EventHandlerBinding>,
    mut own_signal: ShutdownSignal,
    mut container_signal: ShutdownSignal,
) {
    let mut broker_events = broker.subscribe_events();
    'consume: loop {
        let mut deliveries = match broker.consume(binding.queue_name()).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                log::warn!(
                    target: LOG_TARGET,
                    "failed to consume from '{}': {}; retrying",
                    binding.queue_name(),
                    err
                );
                tokio::select! {
                    _ = own_signal.wait() => break,
                    _ = container_signal.wait() => break,
                    _ = tokio::time::sleep(RECONSUME_DELAY) => {},
                }
                if let Some(system) = system.upgrade() {
                    let _ = system.declare(&binding).await;
                }
                continue;
            },
        };
        loop {
            tokio::select! {
                _ = own_signal.wait() => break 'consume,
                _ = container_signal.wait() => break 'consume,
                event = broker_events.recv() => match event {
                    Ok(BrokerEvent::Reconnected) => {
                        // Auto-delete queues may have vanished in the failover
                        if let Some(system) = system.upgrade() {
                            if let Err(err) = system.declare(&binding).await {
                                log::warn!(
                                    target: LOG_TARGET,
                                    "failed to re-declare '{}': {}",
                                    binding.queue_name(),
                                    err
                                );
                            }
                        }
                        continue 'consume;
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break 'consume,
                },
                maybe = deliveries.recv() => match maybe {
                    Some(delivery) => handle_delivery(&system, &binding, delivery).await,
                    None => {
                        // The consumer stream ended, e.g. the queue was deleted
                        tokio::select! {
                            _ = own_signal.wait() => break 'consume,
                            _ = container_signal.wait() => break 'consume,
                            _ = tokio::time::sleep(RECONSUME_DELAY) => {},
                        }
                        if let Some(system) = system.upgrade() {
                            let _ = system.declare(&binding).await;
                        }
                        continue 'consume;
                    },
                },
            }
        }
    }
    log::debug!(target: LOG_TARGET, "consumer for '{}' ended", binding.queue_name());
}

async fn handle_delivery<B: Broker>(
    system: &Weak<BrokerEventSystem<B>>,
    binding: &Arc<EventHandlerBinding>,
    delivery: Delivery,
) {
    let event: Event = match serializer::default_serializer().decode(&delivery.payload) {
        Ok(event) => event,
        Err(err) => {
            log::warn!(
                target: LOG_TARGET,
                "failed to decode event from queue '{}': {}",
                binding.queue_name(),
                err
            );
            let _ = delivery.nack(false).await;
            return;
        },
    };
    let run = run_handler(system.clone(), Arc::clone(binding), event, delivery);
    if binding.sequential() {
        // No concurrent dispatch for sequential handlers: handle inline on the consumer loop
        run.await;
    } else {
        let tasks = system.upgrade().and_then(|system| system.context().map(|ctx| ctx.tasks));
        match tasks {
            Some(tasks) => tasks.spawn(run),
            None => {
                tokio::spawn(run);
            },
        }
    }
}

async fn run_handler<B: Broker>(
    system: Weak<BrokerEventSystem<B>>,
    binding: Arc<EventHandlerBinding>,
    event: Event,
    delivery: Delivery,
) {
    let event_type = event.event_type.clone();
    match binding.invoke(event).await {
        Ok(()) => {
            metrics::events_handled_total(binding.queue_name()).inc();
            if let Err(err) = delivery.ack().await {
                log::warn!(target: LOG_TARGET, "failed to ack on '{}': {}", binding.queue_name(), err);
            }
            if binding.once() {
                if let Some(system) = system.upgrade() {
                    let _ = system.unsubscribe(&binding).await;
                }
            }
        },
        Err(err) => {
            metrics::events_failed_total(binding.queue_name()).inc();
            log::error!(
                target: LOG_TARGET,
                "failed to handle event '{}' from queue '{}': {}",
                event_type,
                binding.queue_name(),
                err
            );
            if let Some(system) = system.upgrade() {
                if let Some(ctx) = system.context() {
                    ctx.hook.report(&ErrorReport::for_subject(
                        err.to_string(),
                        binding.interface(),
                        binding.function(),
                    ));
                }
            }
            // Negative-ack without requeue; redelivery policy is the operator's choice
            let _ = delivery.nack(false).await;
        },
    }
}
