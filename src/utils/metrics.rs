//! Observability counters
//!
//! Atomic counters owned by a [`NetworkEngine`](crate::engine::NetworkEngine)
//! and shared as `Arc<Metrics>` with whatever exports them. There is no
//! process-wide instance; two engines in one process count independently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

macro_rules! protocol_counters {
    ($($(#[$doc:meta])* $field:ident),* $(,)?) => {
        /// Metrics collector for protocol operations
        #[derive(Debug)]
        pub struct Metrics {
            $($(#[$doc])* pub $field: AtomicU64,)*
            start_time: Instant,
        }

        impl Metrics {
            pub fn new() -> Self {
                Self {
                    $($field: AtomicU64::new(0),)*
                    start_time: Instant::now(),
                }
            }

            /// Get current metrics snapshot
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                    uptime_seconds: self.start_time.elapsed().as_secs(),
                }
            }

            /// Log current metrics
            pub fn log_metrics(&self) {
                let snapshot = self.snapshot();
                info!(
                    $($field = snapshot.$field,)*
                    uptime_seconds = snapshot.uptime_seconds,
                    "Replication metrics snapshot"
                );
            }
        }

        /// Snapshot of metrics at a point in time
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct MetricsSnapshot {
            $(pub $field: u64,)*
            pub uptime_seconds: u64,
        }
    };
}

protocol_counters! {
    /// Peers that reached the connected state
    connections_total,
    /// Currently connected peers
    connections_active,
    /// Key exchanges started
    handshakes_total,
    /// Key exchanges that produced a session key
    handshakes_success,
    /// Key exchanges aborted
    handshakes_failed,
    /// Connection requests refused for an incompatible configuration
    config_mismatches,
    /// Connection requests refused by the approval hook
    approvals_rejected,
    messages_sent,
    messages_received,
    bytes_sent,
    bytes_received,
    /// Messages dropped without effect (gating, missing targets, disabled features)
    messages_dropped,
    /// Errors that disconnected a peer
    protocol_errors,
    objects_spawned,
    objects_destroyed,
    ownership_changes,
    variable_updates,
    rpcs_invoked,
    responses_resolved,
    /// Suspended scene tasks replayed after a load
    scene_replays,
}

impl Metrics {
    /// Record a peer reaching the connected state
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connected peer leaving
    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn config_mismatch(&self) {
        self.config_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn approval_rejected(&self) {
        self.approvals_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object_spawned(&self) {
        self.objects_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object_destroyed(&self) {
        self.objects_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ownership_changed(&self) {
        self.ownership_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn variable_update(&self) {
        self.variable_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_invoked(&self) {
        self.rpcs_invoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_resolved(&self) {
        self.responses_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scene_replayed(&self) {
        self.scene_replays.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for measuring handler duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_us = self.start.elapsed().as_micros() as u64,
            "Handler completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();
        metrics.message_received(12);
        metrics.message_received(30);
        metrics.object_spawned();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 2);
        assert_eq!(snapshot.connections_active, 1);
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.bytes_received, 42);
        assert_eq!(snapshot.objects_spawned, 1);
        assert_eq!(snapshot.responses_resolved, 0);
    }

    #[test]
    fn test_active_never_underflows() {
        let metrics = Metrics::new();
        metrics.connection_closed();
        assert_eq!(metrics.snapshot().connections_active, 0);
    }
}
