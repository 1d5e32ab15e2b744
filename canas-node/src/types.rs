//! Core types for the node runtime
//!
//! This module defines the raw frame that moves through the RX/TX queues and
//! the error types shared by every component. Frames are plain `Copy` values
//! so they can be pushed from interrupt context without touching the heap.

use crate::codec::DecodeError;
use crate::registry::RegistryError;
use crate::settings::SettingsError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Timestamp type used throughout the runtime
pub type Timestamp = DateTime<Utc>;

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Largest CAN 2.0A identifier
pub const MAX_CAN_ID: u16 = 0x7FF;

/// Classic CAN payload limit
pub const MAX_DLC: usize = 8;

/// Raw CAN frame as handed between the driver and the node runtime
///
/// The identifier is the 11-bit CANaerospace message identifier. Data is
/// stored inline so a frame never owns heap memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// CAN message identifier (11-bit)
    pub id: u16,
    /// Number of valid bytes in `data`
    pub len: u8,
    /// Frame data bytes, only `len` of them are meaningful
    pub data: [u8; MAX_DLC],
    /// Arrival (or creation) time in nanoseconds since epoch
    pub timestamp_ns: u64,
    /// Receive order stamp, assigned when the frame enters the RX queue (0 before)
    pub sequence: u64,
}

impl CanFrame {
    /// Create a frame from an identifier and payload, stamped with the current time
    pub fn new(id: u16, payload: &[u8]) -> Result<Self> {
        if id > MAX_CAN_ID {
            return Err(NodeError::InvalidFrame(format!(
                "identifier 0x{:X} exceeds 11 bits",
                id
            )));
        }
        if payload.len() > MAX_DLC {
            return Err(NodeError::InvalidFrame(format!(
                "payload of {} bytes exceeds {} bytes",
                payload.len(),
                MAX_DLC
            )));
        }

        let mut data = [0u8; MAX_DLC];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            id,
            len: payload.len() as u8,
            data,
            timestamp_ns: now_ns(),
            sequence: 0,
        })
    }

    /// Replace the timestamp (drivers stamp frames on arrival)
    pub fn with_timestamp_ns(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    /// Valid payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc()]
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        (self.len as usize).min(MAX_DLC)
    }

    /// Convert timestamp from nanoseconds to DateTime<Utc>
    pub fn timestamp(&self) -> Timestamp {
        from_ns(self.timestamp_ns)
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X} [{}]", self.id, self.len)?;
        for byte in self.payload() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Current wall-clock time in nanoseconds since epoch
pub fn now_ns() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64
}

/// Next value of the process-wide update order (starts at 1)
///
/// Received frames and local publications draw from the same counter, so
/// comparing two stamps tells which update entered the node first.
pub fn next_sequence() -> u64 {
    static SEQUENCE: AtomicU64 = AtomicU64::new(1);
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Convert nanoseconds since epoch into a timestamp
pub fn from_ns(ns: u64) -> Timestamp {
    let secs = (ns / 1_000_000_000) as i64;
    let nsecs = (ns % 1_000_000_000) as u32;
    DateTime::from_timestamp(secs, nsecs).unwrap_or_else(Utc::now)
}

/// Errors reported by the CAN driver or the TX path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Controller is bus-off")]
    BusOff,

    #[error("No TX queue space within the send timeout")]
    TxTimeout,

    #[error("Driver has not been started")]
    NotStarted,

    #[error("Driver failure: {0}")]
    Driver(String),
}

/// Errors that can occur in the node runtime
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Queue full: {0}")]
    QueueFull(&'static str),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Protocol error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Duplicate node id {0} detected on bus")]
    DuplicateNode(u8),

    #[error("Worker '{0}' did not stop within the shutdown timeout")]
    ShutdownTimeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_payload_and_dlc() {
        let frame = CanFrame::new(0x40A, &[1, 2, 3]).unwrap();
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert_eq!(frame.data[3..], [0; 5]);
    }

    #[test]
    fn test_frame_rejects_bad_input() {
        assert!(CanFrame::new(0x800, &[]).is_err());
        assert!(CanFrame::new(0x100, &[0; 9]).is_err());
    }

    #[test]
    fn test_frame_display() {
        let frame = CanFrame::new(0x12C, &[0xDE, 0xAD]).unwrap();
        assert_eq!(format!("{}", frame), "12C [2] DE AD");
    }

    #[test]
    fn test_timestamp_round_trip() {
        let frame = CanFrame::new(1, &[]).unwrap().with_timestamp_ns(1_500_000_000);
        let ts = frame.timestamp();
        assert_eq!(ts.timestamp(), 1);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }
}
