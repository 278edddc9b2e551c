//! Overlay network metrics collection.
//!
//! Counters for monitoring overlay operations: parcel traffic, application
//! message throughput, drops, bans, and protocol anomalies. All metrics use
//! atomic operations and are safe to access from multiple threads.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for simple metrics.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter starting at 0.
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by n.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to 0 and return the previous value.
    pub fn reset(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

/// Counters for the overlay subsystem.
#[derive(Debug, Default)]
pub struct OverlayMetrics {
    /// Parcels read off the wire, all types.
    pub parcels_received: Counter,
    /// Parcels written to the wire, all types.
    pub parcels_sent: Counter,
    /// Application messages forwarded to the controller.
    pub application_messages: Counter,
    /// Parcels with a type tag this node does not recognize.
    pub unknown_parcel_types: Counter,
    /// Parcels dropped because a peer's mailbox was full.
    pub mailbox_drops: Counter,
    /// Peers banned for protocol violations.
    pub bans: Counter,
    /// Peer-share requests or responses ignored for arriving too soon.
    pub rate_violations: Counter,
    /// Peer-share responses sent.
    pub shares_sent: Counter,
    /// Peer-share responses processed.
    pub shares_processed: Counter,
}

impl OverlayMetrics {
    /// Create a fresh metrics set with all counters at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            parcels_received: self.parcels_received.get(),
            parcels_sent: self.parcels_sent.get(),
            application_messages: self.application_messages.get(),
            unknown_parcel_types: self.unknown_parcel_types.get(),
            mailbox_drops: self.mailbox_drops.get(),
            bans: self.bans.get(),
            rate_violations: self.rate_violations.get(),
            shares_sent: self.shares_sent.get(),
            shares_processed: self.shares_processed.get(),
        }
    }
}

/// A point-in-time copy of [`OverlayMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Parcels read off the wire.
    pub parcels_received: u64,
    /// Parcels written to the wire.
    pub parcels_sent: u64,
    /// Application messages forwarded to the controller.
    pub application_messages: u64,
    /// Unrecognized parcel type tags.
    pub unknown_parcel_types: u64,
    /// Parcels dropped at full mailboxes.
    pub mailbox_drops: u64,
    /// Peers banned.
    pub bans: u64,
    /// Rate-limited peer-share exchanges.
    pub rate_violations: u64,
    /// Peer-share responses sent.
    pub shares_sent: u64,
    /// Peer-share responses processed.
    pub shares_processed: u64,
}
