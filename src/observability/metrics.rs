//! Lifecycle counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for credential, registration and delivery outcomes.
#[derive(Debug, Default)]
pub struct LifecycleMetrics {
    refresh_success: AtomicU64,
    refresh_failed: AtomicU64,
    registrations_created: AtomicU64,
    registrations_unchanged: AtomicU64,
    registrations_removed: AtomicU64,
    deliveries_accepted: AtomicU64,
    deliveries_filtered: AtomicU64,
    deliveries_rejected: AtomicU64,
}

impl LifecycleMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_refresh_success(&self) {
        self.refresh_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration_created(&self) {
        self.registrations_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration_unchanged(&self) {
        self.registrations_unchanged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration_removed(&self) {
        self.registrations_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_accepted(&self) {
        self.deliveries_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_filtered(&self) {
        self.deliveries_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_rejected(&self) {
        self.deliveries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            refresh_success: self.refresh_success.load(Ordering::Relaxed),
            refresh_failed: self.refresh_failed.load(Ordering::Relaxed),
            registrations_created: self.registrations_created.load(Ordering::Relaxed),
            registrations_unchanged: self.registrations_unchanged.load(Ordering::Relaxed),
            registrations_removed: self.registrations_removed.load(Ordering::Relaxed),
            deliveries_accepted: self.deliveries_accepted.load(Ordering::Relaxed),
            deliveries_filtered: self.deliveries_filtered.load(Ordering::Relaxed),
            deliveries_rejected: self.deliveries_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`LifecycleMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub refresh_success: u64,
    pub refresh_failed: u64,
    pub registrations_created: u64,
    pub registrations_unchanged: u64,
    pub registrations_removed: u64,
    pub deliveries_accepted: u64,
    pub deliveries_filtered: u64,
    pub deliveries_rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = LifecycleMetrics::new();
        metrics.record_refresh_success();
        metrics.record_refresh_success();
        metrics.record_delivery_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.refresh_success, 2);
        assert_eq!(snapshot.deliveries_rejected, 1);
        assert_eq!(snapshot.registrations_created, 0);
    }
}
