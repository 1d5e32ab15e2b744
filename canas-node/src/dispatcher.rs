//! Receive-side dispatch
//!
//! One worker drains the RX queue (and the queue of local publications),
//! decodes each frame and hands it to the parameter table or, for node
//! service identifiers, to the identity service. All subscriber callbacks run
//! here, which gives a single total delivery order per node.

use crate::codec::{self, CanasMessage, DecodeError};
use crate::identity::IdentityService;
use crate::params::{Delivery, ParameterTable, ParameterUpdate};
use crate::stats::NodeStats;
use crate::sync::{Event, StopToken};
use crate::transport::Transport;
use crate::types::{next_sequence, CanFrame};
use std::sync::Arc;
use std::time::Duration;

/// What happened to one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Parameter frame delivered to subscribers
    Delivered(Delivery),
    /// Node service frame handled by the identity service
    Service,
    /// Malformed or mistyped frame, dropped
    Dropped(DecodeError),
}

/// Receive path of a node
pub struct Dispatcher {
    transport: Arc<Transport>,
    params: Arc<ParameterTable>,
    identity: Arc<IdentityService>,
    stats: Arc<NodeStats>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<Transport>,
        params: Arc<ParameterTable>,
        identity: Arc<IdentityService>,
        stats: Arc<NodeStats>,
    ) -> Self {
        Self {
            transport,
            params,
            identity,
            stats,
        }
    }

    /// Decode and route a single received frame
    pub fn dispatch_frame(&self, frame: &CanFrame) -> Outcome {
        let message = match codec::decode(frame) {
            Ok(message) => message,
            Err(e) => return self.drop_frame(frame, e),
        };
        log::trace!("RX {}", message);

        if message.class().is_node_service() {
            self.identity.handle(&message, &mut |response: CanasMessage| self.reply(response));
            return Outcome::Service;
        }

        // Frames handed over directly (not through the RX queue) are unstamped
        let sequence = match frame.sequence {
            0 => next_sequence(),
            stamped => stamped,
        };
        let update = ParameterUpdate::from_message(&message, frame.timestamp_ns, sequence);
        match self.params.deliver_remote(&update) {
            Ok(delivery) => Outcome::Delivered(delivery),
            Err(e) => self.drop_frame(frame, e),
        }
    }

    /// Deliver everything currently queued, returning the number of items
    ///
    /// Queued local publications are delivered before received frames. A
    /// received frame that entered the node before an already delivered local
    /// publication of the same parameter is skipped.
    pub fn drain(&self) -> usize {
        let mut handled = 0;
        while let Some(update) = self.params.next_local() {
            self.params.deliver_local(&update);
            handled += 1;
        }
        while let Some(frame) = self.transport.receive() {
            self.dispatch_frame(&frame);
            handled += 1;
        }
        handled
    }

    /// Worker body: drain, then sleep on `wake` for at most `idle`
    pub fn run(&self, wake: Arc<Event>, stop: StopToken, idle: Duration) {
        log::debug!("Dispatcher running");
        while !stop.should_stop() {
            self.drain();
            wake.wait(idle);
        }
        log::debug!("Dispatcher stopped");
    }

    fn drop_frame(&self, frame: &CanFrame, error: DecodeError) -> Outcome {
        self.stats.decode_error();
        log::warn!("Dropping frame {}: {}", frame, error);
        Outcome::Dropped(error)
    }

    fn reply(&self, response: CanasMessage) {
        let frame = match codec::encode(&response) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Cannot encode service response {}: {}", response, e);
                return;
            }
        };
        if self.transport.try_send(frame).is_err() {
            self.stats.publish_dropped();
            log::warn!("TX queue full, service response {} dropped", response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DataType, ParameterValue};
    use crate::identity::NodeIdentity;
    use crate::params::{HandlerResult, ParameterDefinition};
    use crate::transport::VirtualBus;
    use parking_lot::Mutex;

    fn dispatcher() -> (Dispatcher, Arc<ParameterTable>, Arc<Transport>) {
        let stats = Arc::new(NodeStats::new());
        let bus = VirtualBus::new();
        let transport = Arc::new(Transport::new(
            bus.attach(),
            16,
            16,
            Arc::new(Event::auto()),
            Arc::new(Event::auto()),
            stats.clone(),
        ));
        let params = Arc::new(ParameterTable::new(
            4,
            16,
            Arc::new(Event::auto()),
            Arc::new(Event::auto()),
            stats.clone(),
        ));
        let identity = Arc::new(IdentityService::new(
            NodeIdentity {
                node_id: 4,
                node_type: 1,
                hardware_revision: 1,
                software_revision: 1,
                name: "test".into(),
            },
            stats.clone(),
        ));
        (
            Dispatcher::new(transport.clone(), params.clone(), identity, stats),
            params,
            transport,
        )
    }

    fn frame(message: CanasMessage) -> CanFrame {
        codec::encode(&message).unwrap()
    }

    #[test]
    fn test_parameter_frame_is_delivered() {
        let (d, params, _) = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        params.register(
            1034,
            "test",
            Arc::new(move |u: &ParameterUpdate| -> HandlerResult {
                sink.lock().push((u.node_id, u.value));
                Ok(())
            }),
        );

        let outcome = d.dispatch_frame(&frame(CanasMessage::new(
            1034,
            9,
            0,
            1,
            ParameterValue::UShort(1013),
        )));
        assert_eq!(outcome, Outcome::Delivered(Delivery { delivered: 1, failed: 0 }));
        assert_eq!(*seen.lock(), vec![(9, ParameterValue::UShort(1013))]);
    }

    #[test]
    fn test_malformed_frame_is_counted() {
        let (d, _, _) = dispatcher();
        // USHORT declared, four data bytes carried
        let bad = CanFrame::new(1034, &[9, 7, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!(matches!(
            d.dispatch_frame(&bad),
            Outcome::Dropped(DecodeError::LengthMismatch { .. })
        ));
        assert_eq!(d.stats.snapshot().decode_errors, 1);
    }

    #[test]
    fn test_type_mismatch_is_dropped() {
        let (d, params, _) = dispatcher();
        params
            .define(&ParameterDefinition::new(1034, "qnh", DataType::UShort))
            .unwrap();
        let outcome = d.dispatch_frame(&frame(CanasMessage::new(
            1034,
            9,
            0,
            0,
            ParameterValue::Float(1013.0),
        )));
        assert!(matches!(outcome, Outcome::Dropped(DecodeError::TypeMismatch { .. })));
        assert!(params.get_latest(1034).is_none());
    }

    #[test]
    fn test_identity_query_is_answered() {
        let (d, _, transport) = dispatcher();
        let outcome = d.dispatch_frame(&frame(IdentityService::query(0)));
        assert_eq!(outcome, Outcome::Service);

        let reply = codec::decode(&transport.tx_queue().pop().unwrap()).unwrap();
        assert_eq!(reply.id, 129);
        assert_eq!(reply.node_id, 4);
    }

    #[test]
    fn test_drain_never_delivers_an_older_value() {
        let (d, params, transport) = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        params.register(
            500,
            "order",
            Arc::new(move |u: &ParameterUpdate| -> HandlerResult {
                sink.lock().push((u.value, u.sequence));
                Ok(())
            }),
        );

        // Received first, published locally second
        transport
            .enqueue_receive(frame(CanasMessage::new(500, 2, 0, 0, ParameterValue::Short(2))))
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        params.publish_local(500, ParameterValue::Short(1)).unwrap();

        assert_eq!(d.drain(), 2);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].0, ParameterValue::Short(1));
        assert_eq!(params.get_latest(500).unwrap().value, ParameterValue::Short(1));

        // A frame received after the publish is newer and delivered
        transport
            .enqueue_receive(frame(CanasMessage::new(500, 2, 0, 1, ParameterValue::Short(3))))
            .unwrap();
        assert_eq!(d.drain(), 1);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0, ParameterValue::Short(3));
        assert!(seen[1].1 > seen[0].1);
        assert_eq!(params.get_latest(500).unwrap().value, ParameterValue::Short(3));
    }
}
