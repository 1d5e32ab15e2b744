//! Transport interface between CAN drivers and the node runtime
//!
//! A driver pushes received frames through an [`RxSink`] (non-blocking, safe
//! from interrupt or callback context) and transmits frames the node hands
//! it through [`CanDriver::transmit`]. The [`Transport`] owns both frame
//! rings and is the only thing the dispatcher and publisher talk to.

use crate::queue::{FrameQueue, QueueFull};
use crate::stats::NodeStats;
use crate::sync::Event;
use crate::types::{next_sequence, BusError, CanFrame, Result};
use std::sync::Arc;
use std::time::Duration;

pub mod slcan;
pub mod virtual_bus;

pub use slcan::SlcanDriver;
pub use virtual_bus::{VirtualBus, VirtualPort};

/// Controller state reported by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    /// Normal operation
    Active,
    /// Error passive, still able to transmit
    Passive,
    /// Controller has left the bus
    BusOff,
}

/// A CAN controller driver
pub trait CanDriver: Send + Sync {
    /// Short driver name for logs
    fn name(&self) -> &str;

    /// Begin delivering received frames into `rx`
    fn start(&self, rx: RxSink) -> Result<()>;

    /// Transmit one frame
    fn transmit(&self, frame: &CanFrame) -> std::result::Result<(), BusError>;

    /// Current controller state
    fn status(&self) -> BusStatus {
        BusStatus::Active
    }

    /// Stop delivering frames
    fn stop(&self) {}
}

/// Producer handle onto the RX queue given to drivers
#[derive(Clone)]
pub struct RxSink {
    queue: Arc<FrameQueue>,
    stats: Arc<NodeStats>,
}

impl RxSink {
    /// Queue a received frame without blocking
    ///
    /// If the RX queue is full the frame is dropped and the overflow counter
    /// incremented; the caller is never blocked.
    pub fn enqueue_receive(&self, mut frame: CanFrame) -> std::result::Result<(), QueueFull> {
        frame.sequence = next_sequence();
        match self.queue.push(frame) {
            Ok(()) => {
                self.stats.frame_received();
                Ok(())
            }
            Err(full) => {
                self.stats.rx_overflow();
                log::trace!("RX queue full, dropped {}", frame);
                Err(full)
            }
        }
    }
}

/// The RX and TX frame rings plus the driver that feeds and drains them
pub struct Transport {
    driver: Arc<dyn CanDriver>,
    rx: Arc<FrameQueue>,
    tx: Arc<FrameQueue>,
    stats: Arc<NodeStats>,
}

impl Transport {
    /// Create both rings
    ///
    /// `rx_ready` is set whenever a frame is received, `tx_ready` whenever a
    /// frame is queued for transmission.
    pub fn new(
        driver: Arc<dyn CanDriver>,
        rx_length: usize,
        tx_length: usize,
        rx_ready: Arc<Event>,
        tx_ready: Arc<Event>,
        stats: Arc<NodeStats>,
    ) -> Self {
        Self {
            driver,
            rx: Arc::new(FrameQueue::new("rx", rx_length, rx_ready)),
            tx: Arc::new(FrameQueue::new("tx", tx_length, tx_ready)),
            stats,
        }
    }

    /// Producer handle for the driver
    pub fn rx_sink(&self) -> RxSink {
        RxSink {
            queue: self.rx.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Start the driver
    pub fn start(&self) -> Result<()> {
        log::info!(
            "Starting CAN driver '{}' (rx {} frames, tx {} frames)",
            self.driver.name(),
            self.rx.capacity(),
            self.tx.capacity()
        );
        self.driver.start(self.rx_sink())
    }

    /// Stop the driver
    pub fn stop(&self) {
        self.driver.stop();
    }

    /// Queue a received frame (interrupt-context entry point)
    pub fn enqueue_receive(&self, frame: CanFrame) -> std::result::Result<(), QueueFull> {
        self.rx_sink().enqueue_receive(frame)
    }

    /// Queue a frame for transmission, waiting up to `timeout` for space
    ///
    /// Fails immediately if the controller is bus-off.
    pub fn send(&self, frame: CanFrame, timeout: Duration) -> Result<()> {
        if self.driver.status() == BusStatus::BusOff {
            return Err(BusError::BusOff.into());
        }
        self.tx
            .push_timeout(frame, timeout)
            .map_err(|_| BusError::TxTimeout)?;
        Ok(())
    }

    /// Queue a frame for transmission without waiting
    pub fn try_send(&self, frame: CanFrame) -> std::result::Result<(), QueueFull> {
        self.tx.push(frame)
    }

    /// Next received frame, if any
    pub fn receive(&self) -> Option<CanFrame> {
        self.rx.pop()
    }

    /// Hand every queued TX frame to the driver, returning the number sent
    ///
    /// Transmit failures are counted and logged; the frame is discarded.
    pub fn pump_tx(&self) -> usize {
        let mut sent = 0;
        while let Some(frame) = self.tx.pop() {
            match self.driver.transmit(&frame) {
                Ok(()) => {
                    self.stats.transmitted();
                    sent += 1;
                }
                Err(e) => {
                    self.stats.tx_error();
                    log::error!("Transmit of {} failed: {}", frame, e);
                }
            }
        }
        sent
    }

    /// The receive ring
    pub fn rx_queue(&self) -> &FrameQueue {
        &self.rx
    }

    /// The transmit ring
    pub fn tx_queue(&self) -> &FrameQueue {
        &self.tx
    }

    /// Driver status
    pub fn status(&self) -> BusStatus {
        self.driver.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingDriver {
        sent: Mutex<Vec<CanFrame>>,
        bus_off: std::sync::atomic::AtomicBool,
    }

    impl CanDriver for RecordingDriver {
        fn name(&self) -> &str {
            "recording"
        }

        fn start(&self, _rx: RxSink) -> Result<()> {
            Ok(())
        }

        fn transmit(&self, frame: &CanFrame) -> std::result::Result<(), BusError> {
            self.sent.lock().push(*frame);
            Ok(())
        }

        fn status(&self) -> BusStatus {
            if self.bus_off.load(std::sync::atomic::Ordering::SeqCst) {
                BusStatus::BusOff
            } else {
                BusStatus::Active
            }
        }
    }

    fn transport(driver: Arc<RecordingDriver>, rx: usize, tx: usize) -> (Transport, Arc<NodeStats>) {
        let stats = Arc::new(NodeStats::new());
        let t = Transport::new(
            driver,
            rx,
            tx,
            Arc::new(Event::auto()),
            Arc::new(Event::auto()),
            stats.clone(),
        );
        (t, stats)
    }

    #[test]
    fn test_rx_overflow_is_counted() {
        let (t, stats) = transport(Arc::new(RecordingDriver::default()), 4, 4);
        let frame = CanFrame::new(300, &[1]).unwrap();

        for _ in 0..4 {
            t.enqueue_receive(frame).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(t.enqueue_receive(frame), Err(QueueFull));
        }

        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 4);
        assert_eq!(snap.rx_overflows, 3);
        assert_eq!(t.rx_queue().len(), 4);
    }

    #[test]
    fn test_send_and_pump() {
        let driver = Arc::new(RecordingDriver::default());
        let (t, stats) = transport(driver.clone(), 4, 4);
        let frame = CanFrame::new(300, &[1, 2]).unwrap();

        t.send(frame, Duration::from_millis(10)).unwrap();
        assert_eq!(t.pump_tx(), 1);
        assert_eq!(driver.sent.lock().len(), 1);
        assert_eq!(stats.snapshot().frames_transmitted, 1);
    }

    #[test]
    fn test_send_times_out_when_tx_full() {
        let (t, _) = transport(Arc::new(RecordingDriver::default()), 1, 1);
        let frame = CanFrame::new(300, &[]).unwrap();
        t.send(frame, Duration::from_millis(1)).unwrap();

        let err = t.send(frame, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, NodeError::Bus(BusError::TxTimeout)));
    }

    #[test]
    fn test_send_fails_when_bus_off() {
        let driver = Arc::new(RecordingDriver::default());
        driver.bus_off.store(true, std::sync::atomic::Ordering::SeqCst);
        let (t, _) = transport(driver, 1, 1);

        let err = t.send(CanFrame::new(300, &[]).unwrap(), Duration::ZERO).unwrap_err();
        assert!(matches!(err, NodeError::Bus(BusError::BusOff)));
    }
}
