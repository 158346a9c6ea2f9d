// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Ambient trace ids.
//!
//! Every RPC request carries a `trace_id` header. Handlers run inside a [`scope`] holding that id,
//! so any request they send in turn inherits it. The id is also mirrored into the log MDC so
//! formatters can stamp it onto records.

use std::future::Future;

use rand::RngCore;

pub const TRACE_ID_HEADER: &str = "trace_id";

tokio::task_local! {
    static TRACE_ID: String;
}

/// Mint a fresh 128-bit trace id, hex-encoded.
pub fn new_trace_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    data_encoding::HEXLOWER.encode(&bytes)
}

/// The trace id of the current logical task, if any.
pub fn current() -> Option<String> {
    TRACE_ID.try_with(|id| id.clone()).ok()
}

/// The trace id of the current logical task, or a freshly minted one.
pub fn current_or_new() -> String {
    current().unwrap_or_else(new_trace_id)
}

/// Run `fut` with `trace_id` as the ambient trace id.
pub async fn scope<F>(trace_id: String, fut: F) -> F::Output
where F: Future {
    log_mdc::insert(TRACE_ID_HEADER, trace_id.as_str());
    let output = TRACE_ID.scope(trace_id, fut).await;
    let _ = log_mdc::remove(TRACE_ID_HEADER);
    output
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn scope_sets_and_restores() {
        assert!(current().is_none());
        let id = new_trace_id();
        let seen = scope(id.clone(), async { current() }).await;
        assert_eq!(seen, Some(id));
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn nested_scopes_shadow() {
        let outer = scope("a".repeat(32), async {
            let inner = scope("b".repeat(32), async { current() }).await;
            (inner, current())
        })
        .await;
        assert_eq!(outer.0, Some("b".repeat(32)));
        assert_eq!(outer.1, Some("a".repeat(32)));
    }

    #[test]
    fn trace_ids_are_32_hex() {
        let id = new_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_trace_id());
    }
}
