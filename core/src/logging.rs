// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Temporary log level overrides.
//!
//! Backs the `hive.change_loglevel` builtin: raise the level for a log target for a bounded
//! period, then revert. Since the `log` facade only exposes a process-wide maximum level, the
//! override also lifts `log::max_level` while it is active; sinks that filter per target can
//! consult [`level_for`].

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use log::LevelFilter;
use once_cell::sync::Lazy;

const LOG_TARGET: &str = "hive::logging";

struct OverrideState {
    overrides: HashMap<String, LevelOverride>,
    baseline: Option<LevelFilter>,
}

struct LevelOverride {
    level: LevelFilter,
    expires_at: Instant,
}

static STATE: Lazy<Mutex<OverrideState>> = Lazy::new(|| {
    Mutex::new(OverrideState {
        overrides: HashMap::new(),
        baseline: None,
    })
});

/// Set a temporary level override for `target`, reverting after `period`.
pub fn set_temporary_level(target: &str, level: LevelFilter, period: Duration) {
    {
        let mut state = STATE.lock().expect("logging override lock poisoned");
        if state.baseline.is_none() {
            state.baseline = Some(log::max_level());
        }
        state.overrides.insert(target.to_string(), LevelOverride {
            level,
            expires_at: Instant::now() + period,
        });
        if level > log::max_level() {
            log::set_max_level(level);
        }
    }
    log::info!(
        target: LOG_TARGET,
        "changing level of logger '{}' to {} for {:?}",
        target,
        level,
        period
    );

    let target = target.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(period).await;
        revert(&target);
    });
}

fn revert(target: &str) {
    let mut state = STATE.lock().expect("logging override lock poisoned");
    let now = Instant::now();
    match state.overrides.get(target) {
        // A newer override for the same target supersedes this revert
        Some(ov) if ov.expires_at > now => return,
        Some(_) => {
            state.overrides.remove(target);
        },
        None => return,
    }
    let max_override = state.overrides.values().map(|ov| ov.level).max();
    let restored = max_override
        .into_iter()
        .chain(state.baseline)
        .max()
        .unwrap_or_else(log::max_level);
    if state.overrides.is_empty() {
        state.baseline = None;
    }
    drop(state);
    log::set_max_level(restored);
    log::info!(target: LOG_TARGET, "resetting logger '{}' level", target);
}

/// The active override for `target`, walking `::`-separated prefixes, if any is in effect.
pub fn level_for(target: &str) -> Option<LevelFilter> {
    let state = STATE.lock().expect("logging override lock poisoned");
    let now = Instant::now();
    let mut candidate = target;
    loop {
        if let Some(ov) = state.overrides.get(candidate) {
            if ov.expires_at > now {
                return Some(ov.level);
            }
        }
        match candidate.rfind("::") {
            Some(idx) => candidate = &candidate[..idx],
            None => return None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn override_applies_and_expires() {
        set_temporary_level("hive::logging::test_a", LevelFilter::Trace, Duration::from_millis(50));
        assert_eq!(level_for("hive::logging::test_a"), Some(LevelFilter::Trace));
        // Prefix walk finds the override for child targets
        assert_eq!(level_for("hive::logging::test_a::child"), Some(LevelFilter::Trace));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(level_for("hive::logging::test_a"), None);
    }

    #[tokio::test]
    async fn unrelated_target_unaffected() {
        set_temporary_level("hive::logging::test_b", LevelFilter::Debug, Duration::from_millis(50));
        assert_eq!(level_for("hive::other"), None);
    }
}
