// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    cmp,
    ops::Range,
    sync::Mutex,
};

use once_cell::sync::Lazy;

const PORT_RANGE: Range<u16> = 40000..48000;
const LOCAL_ADDRESS: &str = "127.0.0.1";

// Shared counter of ports which have been handed out
static PORT_COUNTER: Lazy<Mutex<u16>> = Lazy::new(|| Mutex::new(PORT_RANGE.start));

/// Maintains a counter of ports within a range (40000..48000), returning them in sequence. Port
/// numbers wrap back to 40000 once the upper bound is exceeded.
pub fn get_next_local_port() -> u16 {
    let mut lock = match PORT_COUNTER.lock() {
        Ok(guard) => guard,
        Err(_) => panic!("Poisoned PORT_COUNTER"),
    };
    *lock = cmp::max((*lock + 1) % PORT_RANGE.end, PORT_RANGE.start);
    *lock
}

/// Returns a local `tcp://` endpoint with the next port in the range.
pub fn get_next_local_endpoint() -> String {
    format!("tcp://{}:{}", LOCAL_ADDRESS, get_next_local_port())
}
