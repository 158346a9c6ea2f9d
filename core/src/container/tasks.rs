// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The container's task group.
//!
//! Request and event handlers run as tracked tasks. On shutdown the group is joined with a
//! grace period; tasks that ignore cancellation past the grace are forcibly aborted.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::{Duration, Instant},
};

use tokio::task::AbortHandle;

const LOG_TARGET: &str = "hive::container::tasks";

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct Inner {
    active: AtomicUsize,
    handles: Mutex<Vec<AbortHandle>>,
}

#[derive(Clone, Default)]
pub struct TaskGroup {
    inner: Arc<Inner>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn spawn<F>(&self, fut: F)
    where F: Future<Output = ()> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        inner.active.fetch_add(1, Ordering::SeqCst);
        let counter = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            fut.await;
            counter.active.fetch_sub(1, Ordering::SeqCst);
        });
        let mut handles = inner.handles.lock().expect("task group lock poisoned");
        handles.retain(|h| !h.is_finished());
        handles.push(handle.abort_handle());
    }

    pub fn len(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `grace` for all tracked tasks to finish, then abort the stragglers. Returns
    /// how many tasks had to be aborted.
    pub async fn join_with_grace(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        while self.inner.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }
        let remaining = self.inner.active.load(Ordering::SeqCst);
        if remaining > 0 {
            log::warn!(
                target: LOG_TARGET,
                "{} task(s) did not finish within {:?}; aborting them",
                remaining,
                grace
            );
            let handles: Vec<_> = {
                let mut handles = self.inner.handles.lock().expect("task group lock poisoned");
                handles.drain(..).collect()
            };
            for handle in handles {
                handle.abort();
            }
        }
        remaining
    }
}
