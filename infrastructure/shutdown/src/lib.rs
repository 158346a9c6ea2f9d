// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! A composable shutdown signal.
//!
//! [`Shutdown`] is the owning trigger. Any number of [`ShutdownSignal`]s can be created from it
//! with [`Shutdown::to_signal`]; each resolves once the trigger fires or is dropped. Signals are
//! cheap to clone and can be awaited directly or polled from a `select!` loop.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    channel::oneshot,
    future::{BoxFuture, Shared},
    FutureExt,
};

/// The owning side of a shutdown signal. Dropping a `Shutdown` also triggers it.
pub struct Shutdown {
    trigger: Option<oneshot::Sender<()>>,
    signal: ShutdownSignal,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        // A dropped trigger resolves the receiver with `Canceled`, which we treat the same as an
        // explicit trigger.
        let signal = ShutdownSignal {
            inner: rx.map(|_| ()).boxed().shared(),
        };
        Self {
            trigger: Some(tx),
            signal,
        }
    }

    pub fn trigger(&mut self) {
        if let Some(trigger) = self.trigger.take() {
            let _ = trigger.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.trigger.is_none()
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("is_triggered", &self.is_triggered())
            .finish()
    }
}

/// Receiving side of the shutdown signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Shared<BoxFuture<'static, ()>>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.inner.peek().is_some()
    }

    /// Wait for the shutdown signal to trigger. Resolves immediately if it already has.
    pub async fn wait(&mut self) {
        self.inner.clone().await
    }
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("is_triggered", &self.is_triggered())
            .finish()
    }
}

/// A `ShutdownSignal` that may be unset, in which case it never resolves.
#[derive(Debug, Clone, Default)]
pub struct OptionalShutdownSignal(Option<ShutdownSignal>);

impl OptionalShutdownSignal {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn set(&mut self, signal: ShutdownSignal) -> &mut Self {
        self.0 = Some(signal);
        self
    }

    pub fn is_triggered(&self) -> bool {
        self.0.as_ref().map(|s| s.is_triggered()).unwrap_or(false)
    }
}

impl Future for OptionalShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.0.as_mut() {
            Some(signal) => signal.poll_unpin(cx),
            None => Poll::Pending,
        }
    }
}

impl From<ShutdownSignal> for OptionalShutdownSignal {
    fn from(signal: ShutdownSignal) -> Self {
        Self(Some(signal))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn trigger_resolves_all_signals() {
        let mut shutdown = Shutdown::new();
        let mut signal = shutdown.to_signal();
        let other = shutdown.to_signal();
        assert!(!signal.is_triggered());
        shutdown.trigger();
        // Both signals resolve, and triggering twice is a no-op
        shutdown.trigger();
        signal.wait().await;
        other.await;
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn drop_triggers_signal() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.to_signal();
        drop(shutdown);
        signal.wait().await;
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn optional_signal_pending_when_unset() {
        let mut optional = OptionalShutdownSignal::none();
        assert!(!optional.is_triggered());
        let mut shutdown = Shutdown::new();
        optional.set(shutdown.to_signal());
        shutdown.trigger();
        optional.await;
    }
}
