// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The in-process event back-end.
//!
//! Dispatches emitted events directly to local subscriptions. Delays are tokio timers; there is
//! no durability and no cross-process delivery.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    container::ContainerHandle,
    events::{Event, EventContext, EventDispatcher, EventError, EventHandlerBinding, EventSystem},
    hooks::ErrorReport,
    metrics,
};

const LOG_TARGET: &str = "hive::events::local";

#[derive(Default)]
pub struct LocalEventSystem {
    dispatcher: Arc<EventDispatcher>,
    context: Mutex<Option<EventContext>>,
}

impl LocalEventSystem {
    pub fn new() -> Self {
        Default::default()
    }

    fn context(&self) -> Option<EventContext> {
        self.context.lock().expect("event context lock poisoned").clone()
    }
}

#[async_trait]
impl EventSystem for LocalEventSystem {
    fn install(&self, handle: ContainerHandle) {
        *self.context.lock().expect("event context lock poisoned") = Some(EventContext {
            hook: handle.error_hook().clone(),
            tasks: handle.tasks(),
        });
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
        let dispatcher = Arc::clone(&self.dispatcher);
        let context = self.context();
        if delay.is_zero() {
            dispatch(dispatcher, context, event).await;
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                dispatch(dispatcher, context, event).await;
            });
        }
        Ok(())
    }

    fn local_dispatcher(&self) -> Option<Arc<EventDispatcher>> {
        Some(Arc::clone(&self.dispatcher))
    }
}

pub(crate) async fn dispatch(dispatcher: Arc<EventDispatcher>, context: Option<EventContext>, event: Event) {
    for handler in dispatcher.matching(&event.event_type) {
        let run = run_handler(
            Arc::clone(&dispatcher),
            context.clone(),
            Arc::clone(&handler),
            event.clone(),
        );
        if handler.sequential() {
            run.await;
        } else {
            match &context {
                Some(ctx) => ctx.tasks.spawn(run),
                None => {
                    tokio::spawn(run);
                },
            }
        }
    }
}

async fn run_handler(
    dispatcher: Arc<EventDispatcher>,
    context: Option<EventContext>,
    handler: Arc<EventHandlerBinding>,
    event: Event,
) {
    let event_type = event.event_type.clone();
    match handler.invoke(event).await {
        Ok(()) => {
            metrics::events_handled_total(handler.queue_name()).inc();
            if handler.once() {
                dispatcher.remove(&handler);
            }
        },
        Err(err) => {
            metrics::events_failed_total(handler.queue_name()).inc();
            log::error!(
                target: LOG_TARGET,
                "handler {}.{} failed for event '{}': {}",
                handler.interface(),
                handler.function(),
                event_type,
                err
            );
            if let Some(ctx) = context {
                ctx.hook
                    .report(&ErrorReport::for_subject(err.to_string(), handler.interface(), handler.function()));
            }
        },
    }
}
