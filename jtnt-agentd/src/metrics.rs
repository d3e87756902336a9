//! In-process counters for agent activity.
//!
//! A plain value owned by the agent root and threaded by reference; there
//! is no global registry and no exposition endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub jobs_executed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_timed_out: AtomicU64,
    pub policy_violations: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub heartbeats_failed: AtomicU64,
    pub results_spooled: AtomicU64,
    pub spool_flushes: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
