//! Passive per-connection traffic counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request/response/notification counters for one logical channel.
///
/// Incremented on the aggregator dispatch path only; keepalive probes are
/// deliberately excluded.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    requests: AtomicU64,
    responses: AtomicU64,
    notifications: AtomicU64,
}

/// Point-in-time copy of one channel's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub requests: u64,
    pub responses: u64,
    pub notifications: u64,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
        }
    }
}
