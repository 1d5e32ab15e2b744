//! CANaerospace frame codec
//!
//! Converts between raw [`CanFrame`]s and typed CANaerospace messages.
//!
//! ## Frame layout
//! - CAN identifier (11-bit): message identifier, i.e. the parameter id
//! - byte 0: node id of the sender (or target, for service requests)
//! - byte 1: data type code
//! - byte 2: service code
//! - byte 3: message code
//! - bytes 4..8: payload, big-endian, `datatype.size()` bytes
//!
//! The DLC therefore always equals `4 + datatype.size()`; anything else is a
//! malformed frame.

use crate::types::{CanFrame, MAX_CAN_ID, MAX_DLC};
use std::fmt;

mod datatype;

pub use datatype::{DataType, ParameterValue};

/// Size of the CANaerospace header in front of the payload
pub const HEADER_LEN: usize = 4;

/// Node id used in service requests to address every node
pub const BROADCAST_NODE: u8 = 0;

/// Number of node service channels (0..36 high priority, 36..52 low priority)
pub const SERVICE_CHANNELS: u8 = 52;

/// Protocol errors found while decoding a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame has {0} bytes, shorter than the 4-byte header")]
    TooShort(usize),

    #[error("unknown data type code {0}")]
    UnknownDataType(u8),

    #[error("{datatype} payload must be {expected} bytes, frame carries {actual}")]
    LengthMismatch {
        datatype: DataType,
        expected: usize,
        actual: usize,
    },

    #[error("parameter {id} is {expected}, frame declares {actual}")]
    TypeMismatch {
        id: u16,
        expected: DataType,
        actual: DataType,
    },

    #[error("identifier {0} is outside the 11-bit range")]
    IdentifierOutOfRange(u16),
}

/// Identifier ranges defined by the standard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierClass {
    /// Emergency event data (0..=127)
    EmergencyEvent,
    /// High priority node service data (128..=199)
    NodeServiceHigh,
    /// High priority user defined data (200..=299)
    UserDefinedHigh,
    /// Normal operation data (300..=1799)
    NormalOperation,
    /// Low priority user defined data (1800..=1899)
    UserDefinedLow,
    /// Debug service data (1900..=1999)
    DebugService,
    /// Low priority node service data (2000..=2031)
    NodeServiceLow,
    /// Not assigned by the standard (2032..=2047)
    Reserved,
}

impl IdentifierClass {
    /// Classify a CAN identifier
    pub fn of(id: u16) -> Self {
        match id {
            0..=127 => IdentifierClass::EmergencyEvent,
            128..=199 => IdentifierClass::NodeServiceHigh,
            200..=299 => IdentifierClass::UserDefinedHigh,
            300..=1799 => IdentifierClass::NormalOperation,
            1800..=1899 => IdentifierClass::UserDefinedLow,
            1900..=1999 => IdentifierClass::DebugService,
            2000..=2031 => IdentifierClass::NodeServiceLow,
            _ => IdentifierClass::Reserved,
        }
    }

    /// True for the node service ranges
    pub fn is_node_service(self) -> bool {
        matches!(
            self,
            IdentifierClass::NodeServiceHigh | IdentifierClass::NodeServiceLow
        )
    }
}

/// Location of a frame on a node service channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceChannel {
    /// Channel number (0..52)
    pub channel: u8,
    /// True for the response identifier of the channel
    pub is_response: bool,
}

impl ServiceChannel {
    /// Map a node-service identifier to its channel
    pub fn from_id(id: u16) -> Option<Self> {
        let (channel, offset) = match id {
            128..=199 => ((id - 128) / 2, (id - 128) % 2),
            2000..=2031 => (36 + (id - 2000) / 2, (id - 2000) % 2),
            _ => return None,
        };
        Some(Self {
            channel: channel as u8,
            is_response: offset == 1,
        })
    }

    /// Request identifier for a channel
    pub fn request_id(channel: u8) -> u16 {
        if channel < 36 {
            128 + 2 * channel as u16
        } else {
            2000 + 2 * (channel as u16 - 36)
        }
    }

    /// Response identifier for a channel
    pub fn response_id(channel: u8) -> u16 {
        Self::request_id(channel) + 1
    }
}

/// A decoded CANaerospace message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanasMessage {
    /// Message (parameter) identifier
    pub id: u16,
    /// Node id field (byte 0)
    pub node_id: u8,
    /// Service code (byte 2)
    pub service_code: u8,
    /// Message code (byte 3)
    pub message_code: u8,
    /// Typed payload
    pub value: ParameterValue,
}

impl CanasMessage {
    /// Build a message with the given header fields
    pub fn new(id: u16, node_id: u8, service_code: u8, message_code: u8, value: ParameterValue) -> Self {
        Self {
            id,
            node_id,
            service_code,
            message_code,
            value,
        }
    }

    /// Data type of the payload
    pub fn datatype(&self) -> DataType {
        self.value.datatype()
    }

    /// Class of the identifier
    pub fn class(&self) -> IdentifierClass {
        IdentifierClass::of(self.id)
    }
}

impl fmt::Display for CanasMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} node={} {}={} svc={} msg={}",
            self.id,
            self.node_id,
            self.datatype(),
            self.value,
            self.service_code,
            self.message_code
        )
    }
}

/// Decode a raw frame
///
/// Validates that the frame carries a full header, that the declared data type
/// exists, and that the DLC matches the declared data type exactly.
pub fn decode(frame: &CanFrame) -> Result<CanasMessage, DecodeError> {
    if frame.id > MAX_CAN_ID {
        return Err(DecodeError::IdentifierOutOfRange(frame.id));
    }

    let bytes = frame.payload();
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TooShort(bytes.len()));
    }

    let datatype = DataType::from_code(bytes[1]).ok_or(DecodeError::UnknownDataType(bytes[1]))?;
    let value = ParameterValue::decode(datatype, &bytes[HEADER_LEN..])?;

    Ok(CanasMessage {
        id: frame.id,
        node_id: bytes[0],
        service_code: bytes[2],
        message_code: bytes[3],
        value,
    })
}

/// Encode a message into a frame stamped with the current time
pub fn encode(message: &CanasMessage) -> Result<CanFrame, DecodeError> {
    if message.id > MAX_CAN_ID {
        return Err(DecodeError::IdentifierOutOfRange(message.id));
    }

    let mut data = [0u8; MAX_DLC];
    data[0] = message.node_id;
    data[1] = message.datatype().code();
    data[2] = message.service_code;
    data[3] = message.message_code;
    let len = HEADER_LEN + message.value.encode(&mut data[HEADER_LEN..]);

    Ok(CanFrame {
        id: message.id,
        len: len as u8,
        data,
        timestamp_ns: crate::types::now_ns(),
        sequence: 0,
    })
}
