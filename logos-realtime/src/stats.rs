//! Gateway counters.
//!
//! Tracked with atomics so the frame path never takes a lock for
//! bookkeeping. Read them through [`GatewayStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub updates_merged: u64,
    pub frames_broadcast: u64,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub flush_failures: u64,
}

#[derive(Debug, Default)]
pub struct GatewayStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    updates_merged: AtomicU64,
    frames_broadcast: AtomicU64,
    sessions_created: AtomicU64,
    sessions_evicted: AtomicU64,
    flush_failures: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_accepted(&self) {
        bump(&self.connections_accepted, 1);
    }

    pub fn connection_rejected(&self) {
        bump(&self.connections_rejected, 1);
    }

    pub fn frame_received(&self) {
        bump(&self.frames_received, 1);
    }

    pub fn frame_dropped(&self) {
        bump(&self.frames_dropped, 1);
    }

    pub fn update_merged(&self) {
        bump(&self.updates_merged, 1);
    }

    pub fn frames_broadcast(&self, count: usize) {
        bump(&self.frames_broadcast, count as u64);
    }

    pub fn session_created(&self) {
        bump(&self.sessions_created, 1);
    }

    pub fn session_evicted(&self) {
        bump(&self.sessions_evicted, 1);
    }

    pub fn flush_failed(&self) {
        bump(&self.flush_failures, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            updates_merged: self.updates_merged.load(Ordering::Relaxed),
            frames_broadcast: self.frames_broadcast.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}
