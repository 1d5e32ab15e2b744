//! Runtime counters
//!
//! Faults on the receive and transmit paths are never raised to the caller of
//! an interrupt-level function; they are counted here instead.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by all components of a node
#[derive(Debug, Default)]
pub struct NodeStats {
    frames_received: AtomicU64,
    rx_overflows: AtomicU64,
    decode_errors: AtomicU64,
    deliveries: AtomicU64,
    handler_failures: AtomicU64,
    frames_published: AtomicU64,
    publish_drops: AtomicU64,
    frames_transmitted: AtomicU64,
    tx_errors: AtomicU64,
    duplicate_nodes: AtomicU64,
}

/// Point-in-time copy of [`NodeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames accepted into the RX queue
    pub frames_received: u64,
    /// Frames dropped because the RX queue was full
    pub rx_overflows: u64,
    /// Frames dropped as malformed
    pub decode_errors: u64,
    /// Handler invocations that completed
    pub deliveries: u64,
    /// Handler invocations that failed or panicked
    pub handler_failures: u64,
    /// Parameter frames queued by the publisher
    pub frames_published: u64,
    /// Publishes dropped because the TX queue was full
    pub publish_drops: u64,
    /// Frames handed to the driver successfully
    pub frames_transmitted: u64,
    /// Driver transmit failures
    pub tx_errors: u64,
    /// Identity frames from another node claiming our node id
    pub duplicate_nodes: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl NodeStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    counter!(frame_received, frames_received);
    counter!(rx_overflow, rx_overflows);
    counter!(decode_error, decode_errors);
    counter!(delivered, deliveries);
    counter!(handler_failed, handler_failures);
    counter!(published, frames_published);
    counter!(publish_dropped, publish_drops);
    counter!(transmitted, frames_transmitted);
    counter!(tx_error, tx_errors);
    counter!(duplicate_node, duplicate_nodes);

    /// Copy all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_received: get(&self.frames_received),
            rx_overflows: get(&self.rx_overflows),
            decode_errors: get(&self.decode_errors),
            deliveries: get(&self.deliveries),
            handler_failures: get(&self.handler_failures),
            frames_published: get(&self.frames_published),
            publish_drops: get(&self.publish_drops),
            frames_transmitted: get(&self.frames_transmitted),
            tx_errors: get(&self.tx_errors),
            duplicate_nodes: get(&self.duplicate_nodes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = NodeStats::new();
        stats.frame_received();
        stats.frame_received();
        stats.decode_error();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.rx_overflows, 0);
    }
}
