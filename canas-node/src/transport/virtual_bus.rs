//! In-process CAN bus
//!
//! Connects any number of nodes living in one process. A frame transmitted
//! by one port is delivered to every other started port, like a real bus
//! without loop-back. Taps observe every frame on the bus, which is how the
//! CLI monitor and the tests watch traffic.

use super::{BusStatus, CanDriver, RxSink};
use crate::types::{now_ns, BusError, CanFrame, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct BusInner {
    ports: Vec<(usize, RxSink)>,
    taps: Vec<Sender<CanFrame>>,
    next_port: usize,
}

/// A shared in-memory bus
#[derive(Clone, Default)]
pub struct VirtualBus {
    inner: Arc<Mutex<BusInner>>,
    bus_off: Arc<AtomicBool>,
}

impl VirtualBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new port, usable as a node's driver
    pub fn attach(&self) -> Arc<VirtualPort> {
        let mut inner = self.inner.lock();
        let id = inner.next_port;
        inner.next_port += 1;

        Arc::new(VirtualPort {
            id,
            bus: self.clone(),
            name: format!("virtual:{}", id),
            started: AtomicBool::new(false),
        })
    }

    /// Receive a copy of every frame put on the bus from now on
    pub fn tap(&self) -> Receiver<CanFrame> {
        let (tx, rx) = unbounded();
        self.inner.lock().taps.push(tx);
        rx
    }

    /// Put a frame on the bus as if sent by a node outside this process
    pub fn inject(&self, frame: CanFrame) {
        self.deliver(usize::MAX, frame);
    }

    /// Force every port into (or out of) the bus-off state
    pub fn set_bus_off(&self, bus_off: bool) {
        self.bus_off.store(bus_off, Ordering::SeqCst);
    }

    fn is_bus_off(&self) -> bool {
        self.bus_off.load(Ordering::SeqCst)
    }

    fn deliver(&self, from: usize, frame: CanFrame) {
        let frame = frame.with_timestamp_ns(now_ns());
        let mut inner = self.inner.lock();

        for (id, sink) in &inner.ports {
            if *id != from {
                // Overflow is accounted for by the receiving node
                let _ = sink.enqueue_receive(frame);
            }
        }
        inner.taps.retain(|tap| tap.send(frame).is_ok());
    }
}

/// One node's connection to a [`VirtualBus`]
pub struct VirtualPort {
    id: usize,
    bus: VirtualBus,
    name: String,
    started: AtomicBool,
}

impl CanDriver for VirtualPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, rx: RxSink) -> Result<()> {
        self.bus.inner.lock().ports.push((self.id, rx));
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn transmit(&self, frame: &CanFrame) -> std::result::Result<(), BusError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(BusError::NotStarted);
        }
        if self.bus.is_bus_off() {
            return Err(BusError::BusOff);
        }
        self.bus.deliver(self.id, *frame);
        Ok(())
    }

    fn status(&self) -> BusStatus {
        if self.bus.is_bus_off() {
            BusStatus::BusOff
        } else {
            BusStatus::Active
        }
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.bus.inner.lock().ports.retain(|(id, _)| *id != self.id);
    }
}
