// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The RPC relay event back-end.
//!
//! Emits are forwarded as RPC requests to a broker service, which fans them out to subscribers
//! by invoking their `hive.event` builtin; received events land in the local dispatcher. Useful
//! for development setups without a message broker. No durability.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    container::ContainerHandle,
    events::{local, Event, EventContext, EventDispatcher, EventError, EventHandlerBinding, EventSystem},
    metrics,
};

const LOG_TARGET: &str = "hive::events::relay";

const BROADCAST_SUBJECT: &str = "broker.broadcast";

/// Event back-end that relays emits to a broker service over RPC.
pub struct RelayEventSystem {
    broker_address: String,
    timeout: Duration,
    dispatcher: Arc<EventDispatcher>,
    context: Mutex<Option<ContainerHandle>>,
}

impl RelayEventSystem {
    pub fn new(broker_address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            broker_address: broker_address.into(),
            timeout,
            dispatcher: Arc::new(EventDispatcher::new()),
            context: Mutex::new(None),
        }
    }

    fn handle(&self) -> Result<ContainerHandle, EventError> {
        let context = self.context.lock().expect("relay context lock poisoned");
        context.clone().ok_or(EventError::NotInstalled)
    }

    async fn send(handle: ContainerHandle, broker_address: &str, timeout: Duration, event: Event) -> Result<(), EventError> {
        let channel = handle
            .send_request(broker_address, BROADCAST_SUBJECT, &event)
            .await
            .map_err(|e| EventError::Emit(e.to_string()))?;
        channel
            .get(timeout)
            .await
            .map_err(|e| EventError::Emit(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl EventSystem for RelayEventSystem {
    fn install(&self, handle: ContainerHandle) {
        *self.context.lock().expect("relay context lock poisoned") = Some(handle);
    }

    async fn subscribe(&self, handler: Arc<EventHandlerBinding>, consume: bool) -> Result<(), EventError> {
        if consume {
            self.dispatcher.register(&handler)?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, handler: &Arc<EventHandlerBinding>) -> Result<(), EventError> {
        if !self.dispatcher.remove(handler) {
            return Err(EventError::UnknownSubscription(handler.queue_name().to_string()));
        }
        Ok(())
    }

    async fn emit(&self, event: Event, delay: Duration) -> Result<(), EventError> {
        metrics::events_emitted_total(&event.event_type).inc();
        let handle = self.handle()?;
        if delay.is_zero() {
            return Self::send(handle, &self.broker_address, self.timeout, event).await;
        }
        let broker_address = self.broker_address.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = Self::send(handle, &broker_address, timeout, event).await {
                log::warn!(target: LOG_TARGET, "delayed relay emit failed: {}", err);
            }
        });
        Ok(())
    }

    fn local_dispatcher(&self) -> Option<Arc<EventDispatcher>> {
        Some(Arc::clone(&self.dispatcher))
    }

    async fn stop(&self) {}
}

/// Dispatch an event received through `hive.event` to the local subscriptions.
pub(crate) async fn dispatch_received(system: &dyn EventSystem, context: Option<EventContext>, event: Event) -> bool {
    match system.local_dispatcher() {
        Some(dispatcher) => {
            local::dispatch(dispatcher, context, event).await;
            true
        },
        None => false,
    }
}
