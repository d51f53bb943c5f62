//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use familiar_registry::{
    handler_fn, CheckContext, ConsistencyHandler, EngineConfig, Entry, EntryMap, RegistryError,
    Verdict,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub id: u32,
    pub label: String,
}

impl Entry for Unit {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

pub fn unit(id: u32, label: &str) -> Unit {
    Unit {
        id,
        label: label.to_string(),
    }
}

/// Empty labels are repaired to the id
pub fn label_handler() -> impl ConsistencyHandler<Unit> {
    handler_fn(
        "label",
        |unit: &Unit, _: &EntryMap<Unit>, _: &CheckContext<'_>| {
            if unit.label.is_empty() {
                Verdict::Modified(Unit {
                    label: unit.id.to_string(),
                    ..unit.clone()
                })
            } else {
                Verdict::Unchanged
            }
        },
    )
}

/// The label "bad" can never be repaired
pub fn reject_bad_handler() -> impl ConsistencyHandler<Unit> {
    handler_fn(
        "reject-bad",
        |unit: &Unit, _: &EntryMap<Unit>, ctx: &CheckContext<'_>| {
            if unit.label == "bad" {
                Verdict::Failed(RegistryError::verification(ctx.registry(), unit.id, "bad label"))
            } else {
                Verdict::Unchanged
            }
        },
    )
}

/// Config with a short lock jitter so contended tests stay fast
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.lock.jitter_min_ms = 1;
    config.lock.jitter_max_ms = 5;
    config
}

/// Run `work` on a thread and fail the test if it does not finish in time
pub fn within<T: Send + 'static>(limit: Duration, work: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(work());
    });
    rx.recv_timeout(limit)
        .unwrap_or_else(|_| panic!("did not finish within {:?}", limit))
}
