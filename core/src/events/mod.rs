// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The event subsystem.
//!
//! Three interchangeable back-ends share one contract ([`EventSystem`]): a broker-backed topic
//! exchange ([`BrokerEventSystem`], the production back-end), an in-process dispatcher
//! ([`LocalEventSystem`]) and an RPC relay ([`RelayEventSystem`]). Event-type patterns support
//! `*` (one word) and `#` (zero or more dotted words).

mod broker;
pub mod dispatcher;
mod local;
mod memory_broker;
mod relay;

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use broker::{AckHandle, Broker, BrokerError, BrokerEvent, BrokerEventSystem, Delivery, ExchangeKind, QueueSpec};
pub use dispatcher::EventDispatcher;
pub use local::LocalEventSystem;
pub use memory_broker::MemoryBroker;
pub(crate) use relay::dispatch_received;
pub use relay::RelayEventSystem;

use crate::{
    container::{tasks::TaskGroup, ContainerHandle},
    hooks::ErrorHook,
    interface::HandlerError,
    serializer::SerializerError,
    trace,
};

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("invalid event handler binding: {0}")]
    InvalidBinding(String),
    #[error("cannot subscribe to queue '{0}' more than once")]
    AlreadySubscribed(String),
    #[error("there is no subscription for '{0}'")]
    UnknownSubscription(String),
    #[error("invalid event pattern '{0}': {1}")]
    InvalidPattern(String, String),
    #[error("event system is not installed into a container")]
    NotInstalled,
    #[error("failed to emit event: {0}")]
    Emit(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Serializer(#[from] SerializerError),
}

/// A topic event. Serialized with the same format as message bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub body: rmpv::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl Event {
    pub fn new<T>(event_type: impl Into<String>, body: &T) -> Result<Self, EventError>
    where T: Serialize {
        let body = rmpv::ext::to_value(body).map_err(|e| SerializerError::Encode(e.to_string()))?;
        Ok(Self {
            event_type: event_type.into(),
            body,
            source: None,
            headers: HashMap::new(),
        })
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.headers.get(trace::TRACE_ID_HEADER).map(String::as_str)
    }

    pub fn decode_body<T>(&self) -> Result<T, EventError>
    where T: DeserializeOwned {
        rmpv::ext::from_value(self.body.clone())
            .map_err(|e| EventError::from(SerializerError::Decode(e.to_string())))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Event type={:?} source={:?}>", self.event_type, self.source)
    }
}

pub type EventHandlerFn = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Delivery flags of an event handler binding. `once` and `broadcast` are mutually exclusive.
#[derive(Debug, Clone, Copy)]
pub struct EventFlags {
    /// Handle on the consumer loop itself instead of handing off to the task group.
    pub sequential: bool,
    /// Unsubscribe after the first successful delivery.
    pub once: bool,
    /// Give every replica its own auto-deleting queue so each sees every event.
    pub broadcast: bool,
    /// Consume immediately on subscribe.
    pub active: bool,
}

impl Default for EventFlags {
    fn default() -> Self {
        Self {
            sequential: false,
            once: false,
            broadcast: false,
            active: true,
        }
    }
}

/// Binds a handler function of an interface to a set of event-type patterns.
pub struct EventHandlerBinding {
    interface: String,
    function: String,
    patterns: Vec<String>,
    queue_name: String,
    flags: EventFlags,
    handler: EventHandlerFn,
}

impl EventHandlerBinding {
    pub fn new(
        interface: &str,
        function: &str,
        patterns: Vec<String>,
        flags: EventFlags,
        handler: EventHandlerFn,
    ) -> Result<Arc<Self>, EventError> {
        if patterns.is_empty() {
            return Err(EventError::InvalidBinding(format!(
                "{}.{} subscribes to no event types",
                interface, function
            )));
        }
        if flags.once && flags.broadcast {
            return Err(EventError::InvalidBinding(format!(
                "{}.{}: 'once' and 'broadcast' are mutually exclusive",
                interface, function
            )));
        }
        for pattern in &patterns {
            dispatcher::compile_pattern(pattern)?;
        }
        // Broadcast and once subscriptions get an instance-unique, auto-deleting queue
        let queue_name = if flags.broadcast || flags.once {
            format!("{}-{}-{}", interface, function, random_suffix())
        } else {
            format!("{}-{}", interface, function)
        };
        Ok(Arc::new(Self {
            interface: interface.to_string(),
            function: function.to_string(),
            patterns,
            queue_name,
            flags,
            handler,
        }))
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn sequential(&self) -> bool {
        self.flags.sequential
    }

    pub fn once(&self) -> bool {
        self.flags.once
    }

    pub fn broadcast(&self) -> bool {
        self.flags.broadcast
    }

    pub fn active(&self) -> bool {
        self.flags.active
    }

    pub fn invoke(&self, event: Event) -> BoxFuture<'static, Result<(), HandlerError>> {
        (self.handler)(event)
    }
}

impl fmt::Debug for EventHandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlerBinding")
            .field("interface", &self.interface)
            .field("function", &self.function)
            .field("patterns", &self.patterns)
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    data_encoding::HEXLOWER.encode(&bytes)
}

/// What an event back-end needs from its hosting container.
#[derive(Clone)]
pub(crate) struct EventContext {
    pub hook: ErrorHook,
    pub tasks: TaskGroup,
}

/// Contract shared by all event back-ends.
#[async_trait]
pub trait EventSystem: Send + Sync + 'static {
    /// Called once when the hosting container is created.
    fn install(&self, _handle: ContainerHandle) {}

    /// Declare the handler's queue and bindings; start consuming when `consume` is true.
    async fn subscribe(&self, handler: Arc<EventHandlerBinding>, consume: bool) -> Result<(), EventError>;

    async fn unsubscribe(&self, handler: &Arc<EventHandlerBinding>) -> Result<(), EventError>;

    /// Publish an event, optionally delayed.
    async fn emit(&self, event: Event, delay: Duration) -> Result<(), EventError>;

    /// The in-process dispatcher, for back-ends that have one. Used by the `hive.event` builtin
    /// to inject relayed events.
    fn local_dispatcher(&self) -> Option<Arc<EventDispatcher>> {
        None
    }

    /// Stop all consumers. Called on container shutdown.
    async fn stop(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop_handler() -> EventHandlerFn {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn empty_patterns_are_rejected() {
        let result = EventHandlerBinding::new("echo", "on_foo", vec![], EventFlags::default(), noop_handler());
        assert!(matches!(result, Err(EventError::InvalidBinding(_))));
    }

    #[test]
    fn once_and_broadcast_are_exclusive() {
        let flags = EventFlags {
            once: true,
            broadcast: true,
            ..Default::default()
        };
        let result =
            EventHandlerBinding::new("echo", "on_foo", vec!["foo".to_string()], flags, noop_handler());
        assert!(matches!(result, Err(EventError::InvalidBinding(_))));
    }

    #[test]
    fn queue_names() {
        let shared = EventHandlerBinding::new(
            "echo",
            "on_foo",
            vec!["foo".to_string()],
            EventFlags::default(),
            noop_handler(),
        )
        .unwrap();
        assert_eq!(shared.queue_name(), "echo-on_foo");

        let broadcast = EventHandlerBinding::new(
            "echo",
            "on_foo",
            vec!["foo".to_string()],
            EventFlags {
                broadcast: true,
                ..Default::default()
            },
            noop_handler(),
        )
        .unwrap();
        assert!(broadcast.queue_name().starts_with("echo-on_foo-"));
        assert_ne!(broadcast.queue_name(), shared.queue_name());
    }

    #[test]
    fn event_body_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Body {
            text: String,
        }
        let event = Event::new("uppercase_transform_finished", &Body {
            text: "foo".to_string(),
        })
        .unwrap();
        assert_eq!(event.decode_body::<Body>().unwrap(), Body {
            text: "foo".to_string()
        });
    }
}
