// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Error hooks.
//!
//! Unhandled handler errors are reported to a list of callbacks before being surfaced as NACKs.
//! A callback that panics is logged and skipped; it never takes the container down.

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

const LOG_TARGET: &str = "hive::hooks";

pub type ErrorCallback = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub error: String,
    pub service: Option<String>,
    pub interface: Option<String>,
    pub method: Option<String>,
    pub trace_id: Option<String>,
}

impl ErrorReport {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            service: None,
            interface: None,
            method: None,
            trace_id: None,
        }
    }

    pub fn for_subject(error: impl Into<String>, interface: &str, method: &str) -> Self {
        Self {
            error: error.into(),
            service: None,
            interface: Some(interface.to_string()),
            method: Some(method.to_string()),
            trace_id: crate::trace::current(),
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.interface, &self.method) {
            (Some(i), Some(m)) => write!(f, "{} (in {}.{})", self.error, i, m),
            _ => write!(f, "{}", self.error),
        }
    }
}

/// A list of callbacks invoked for every unhandled handler error.
#[derive(Clone, Default)]
pub struct ErrorHook {
    callbacks: Arc<Mutex<Vec<ErrorCallback>>>,
}

impl ErrorHook {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn install(&self, callback: ErrorCallback) {
        self.callbacks.lock().expect("error hook lock poisoned").push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().expect("error hook lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn report(&self, report: &ErrorReport) {
        let callbacks = self.callbacks.lock().expect("error hook lock poisoned").clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(report))).is_err() {
                log::warn!(target: LOG_TARGET, "error hook callback panicked; skipping");
            }
        }
    }
}

impl fmt::Debug for ErrorHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHook").field("callbacks", &self.len()).finish()
    }
}
