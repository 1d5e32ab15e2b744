//! Transmit-side worker
//!
//! Wakes when the next periodic parameter is due, when an on-change value is
//! published, or when a frame is queued for transmission. Each cycle queues
//! the due parameter frames, optionally re-announces the node identity, and
//! then hands the TX queue to the driver.

use crate::codec::{self, CanasMessage};
use crate::identity::IdentityService;
use crate::params::ParameterTable;
use crate::stats::NodeStats;
use crate::sync::{Event, StopToken};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Transmit path of a node
pub struct Publisher {
    transport: Arc<Transport>,
    params: Arc<ParameterTable>,
    identity: Arc<IdentityService>,
    stats: Arc<NodeStats>,
    identity_interval: Option<Duration>,
    next_identity: Option<Instant>,
    max_wait: Duration,
    due: Vec<CanasMessage>,
}

impl Publisher {
    /// `identity_interval` re-announces the node periodically; `max_wait`
    /// bounds how long a cycle may sleep.
    pub fn new(
        transport: Arc<Transport>,
        params: Arc<ParameterTable>,
        identity: Arc<IdentityService>,
        stats: Arc<NodeStats>,
        identity_interval: Option<Duration>,
        max_wait: Duration,
    ) -> Self {
        Self {
            transport,
            params,
            identity,
            stats,
            identity_interval,
            next_identity: identity_interval.map(|i| Instant::now() + i),
            max_wait,
            due: Vec::with_capacity(16),
        }
    }

    /// Run one publish cycle at `now`, returning when the next one is due
    pub fn run_cycle(&mut self, now: Instant) -> Option<Instant> {
        let mut due = std::mem::take(&mut self.due);
        due.clear();
        let mut next = self.params.collect_due(now, &mut due);
        for message in &due {
            self.queue(message);
        }
        self.due = due;

        if let (Some(interval), Some(at)) = (self.identity_interval, self.next_identity) {
            if now >= at {
                self.announce();
                self.next_identity = Some(now + interval);
            }
        }
        if let Some(at) = self.next_identity {
            next = Some(next.map_or(at, |n| n.min(at)));
        }

        self.transport.pump_tx();
        next
    }

    /// Queue the identity announcement
    pub fn announce(&self) {
        self.identity
            .announce(&mut |message: CanasMessage| self.queue(&message));
    }

    /// Worker body
    pub fn run(mut self, wake: Arc<Event>, stop: StopToken) {
        log::debug!("Publisher running");
        while !stop.should_stop() {
            let now = Instant::now();
            let timeout = match self.run_cycle(now) {
                Some(at) => at.saturating_duration_since(now).min(self.max_wait),
                None => self.max_wait,
            };
            wake.wait(timeout);
        }
        // Anything queued before the stop request still goes out
        self.transport.pump_tx();
        log::debug!("Publisher stopped");
    }

    fn queue(&self, message: &CanasMessage) {
        let frame = match codec::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Cannot encode {}: {}", message, e);
                return;
            }
        };
        match self.transport.try_send(frame) {
            Ok(()) => {
                self.stats.published();
                log::trace!("TX {}", message);
            }
            Err(_) => {
                self.stats.publish_dropped();
                log::warn!("TX queue full, publish of {} dropped", message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DataType, ParameterValue};
    use crate::identity::NodeIdentity;
    use crate::params::{ParameterDefinition, PublishPolicy};
    use crate::transport::VirtualBus;

    struct Fixture {
        publisher: Publisher,
        params: Arc<ParameterTable>,
        stats: Arc<NodeStats>,
        tap: crossbeam::channel::Receiver<crate::types::CanFrame>,
    }

    fn fixture(tx_length: usize, identity_interval: Option<Duration>) -> Fixture {
        let bus = VirtualBus::new();
        let tap = bus.tap();
        let stats = Arc::new(NodeStats::new());
        let wake = Arc::new(Event::auto());
        let transport = Arc::new(Transport::new(
            bus.attach(),
            8,
            tx_length,
            Arc::new(Event::auto()),
            wake.clone(),
            stats.clone(),
        ));
        transport.start().unwrap();
        let params = Arc::new(ParameterTable::new(
            2,
            8,
            Arc::new(Event::auto()),
            wake,
            stats.clone(),
        ));
        let identity = Arc::new(IdentityService::new(
            NodeIdentity {
                node_id: 2,
                node_type: 0,
                hardware_revision: 1,
                software_revision: 1,
                name: "pub".into(),
            },
            stats.clone(),
        ));
        Fixture {
            publisher: Publisher::new(
                transport,
                params.clone(),
                identity,
                stats.clone(),
                identity_interval,
                Duration::from_millis(100),
            ),
            params,
            stats,
            tap,
        }
    }

    #[test]
    fn test_on_change_goes_out_next_cycle() {
        let mut f = fixture(8, None);
        f.params.publish_local(1034, ParameterValue::UShort(1013)).unwrap();
        assert_eq!(f.publisher.run_cycle(Instant::now()), None);

        let frame = f.tap.try_recv().unwrap();
        let message = codec::decode(&frame).unwrap();
        assert_eq!(message.id, 1034);
        assert_eq!(message.node_id, 2);
        assert_eq!(message.value, ParameterValue::UShort(1013));
        assert_eq!(f.stats.snapshot().frames_published, 1);
    }

    #[test]
    fn test_periodic_due_times() {
        let mut f = fixture(8, None);
        f.params
            .define(&ParameterDefinition::new(1034, "qnh", DataType::UShort))
            .unwrap();
        f.params
            .own(1034, PublishPolicy::periodic(Duration::from_millis(500)))
            .unwrap();
        f.params.publish_local(1034, ParameterValue::UShort(1013)).unwrap();

        let first = f.publisher.run_cycle(Instant::now()).unwrap();
        assert!(f.tap.try_recv().is_err());

        let second = f.publisher.run_cycle(first).unwrap();
        assert_eq!(second, first + Duration::from_millis(500));
        assert_eq!(f.tap.try_iter().count(), 1);
    }

    #[test]
    fn test_every_due_message_sent_once() {
        let mut f = fixture(8, None);
        for id in [300u16, 301, 302] {
            f.params.publish_local(id, ParameterValue::Float(1.0)).unwrap();
        }
        f.publisher.run_cycle(Instant::now());
        let mut ids: Vec<u16> = f.tap.try_iter().map(|frame| frame.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![300, 301, 302]);

        // The collection buffer is kept but nothing is resent
        assert!(f.publisher.due.capacity() >= 16);
        f.publisher.run_cycle(Instant::now());
        assert!(f.tap.try_recv().is_err());

        f.params.publish_local(301, ParameterValue::Float(2.0)).unwrap();
        f.publisher.run_cycle(Instant::now());
        let frames: Vec<_> = f.tap.try_iter().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 301);
        assert_eq!(f.stats.snapshot().frames_published, 4);
    }

    #[test]
    fn test_full_tx_queue_drops_publish() {
        let mut f = fixture(1, None);
        for id in [300u16, 301, 302] {
            f.params.publish_local(id, ParameterValue::Float(1.0)).unwrap();
        }
        // Collecting queues all three before the pump, so only one fits
        f.publisher.run_cycle(Instant::now());

        let snap = f.stats.snapshot();
        assert_eq!(snap.frames_published, 1);
        assert_eq!(snap.publish_drops, 2);
        assert_eq!(f.tap.try_iter().count(), 1);
    }

    #[test]
    fn test_periodic_identity() {
        let mut f = fixture(8, Some(Duration::from_millis(500)));
        let start = Instant::now();
        let next = f.publisher.run_cycle(start).unwrap();
        assert!(f.tap.try_recv().is_err());

        f.publisher.run_cycle(next + Duration::from_millis(1));
        let frames: Vec<_> = f.tap.try_iter().collect();
        // IDS response plus one name chunk for "pub"
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, 129);
    }
}
