//! Serial-line CAN (Lawicel SLCAN) driver
//!
//! Speaks the ASCII SLCAN protocol over any byte stream, typically a USB CAN
//! adapter exposed as a tty. Standard frames look like `tIIILDD..\r`: three
//! hex digits of identifier, one digit of DLC, then two hex digits per byte.
//!
//! A reader thread assembles lines and pushes decoded frames through the
//! [`RxSink`]. The thread blocks in `read`, so on `stop` it is flagged and
//! exits after the next read returns rather than being joined.

use super::{CanDriver, RxSink};
use crate::types::{BusError, CanFrame, NodeError, Result, MAX_CAN_ID, MAX_DLC};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Longest line the reader accepts before discarding input
const MAX_LINE: usize = 32;

/// SLCAN bit rate command for 1 Mbit/s, the CANaerospace default
const OPEN_SEQUENCE: &[&[u8]] = &[b"C\r", b"S8\r", b"O\r"];

/// SLCAN driver over a pair of byte streams
pub struct SlcanDriver {
    name: String,
    writer: Mutex<Box<dyn Write + Send>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    running: Arc<AtomicBool>,
}

impl SlcanDriver {
    /// Open a serial device (or any file-like path) for reading and writing
    ///
    /// Line settings of the tty are expected to be configured beforehand.
    pub fn open(path: &Path) -> Result<Self> {
        log::info!("Opening SLCAN device: {:?}", path);
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let reader = file.try_clone()?;
        Ok(Self::from_streams(
            format!("slcan:{}", path.display()),
            Box::new(reader),
            Box::new(file),
        ))
    }

    /// Build a driver over existing streams
    pub fn from_streams(
        name: String,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            name,
            writer: Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(bytes)?;
        writer.flush()
    }
}

impl CanDriver for SlcanDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, rx: RxSink) -> Result<()> {
        let mut reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| NodeError::Config(format!("{} already started", self.name)))?;

        for command in OPEN_SEQUENCE {
            self.write_all(command)?;
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let name = self.name.clone();

        std::thread::Builder::new()
            .name("slcan-rx".to_string())
            .spawn(move || {
                let mut line = LineAssembler::default();
                let mut buf = [0u8; 64];

                while running.load(Ordering::SeqCst) {
                    let n = match reader.read(&mut buf) {
                        Ok(0) => {
                            log::info!("{}: end of stream", name);
                            break;
                        }
                        Ok(n) => n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            log::error!("{}: read failed: {}", name, e);
                            break;
                        }
                    };

                    for &byte in &buf[..n] {
                        if let Some(text) = line.push(byte) {
                            match parse_frame(text) {
                                Some(frame) => {
                                    let _ = rx.enqueue_receive(frame);
                                }
                                None => log::trace!("{}: ignored line {:?}", name, text),
                            }
                        }
                    }
                }
            })?;

        Ok(())
    }

    fn transmit(&self, frame: &CanFrame) -> std::result::Result<(), BusError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BusError::NotStarted);
        }
        self.write_all(format_frame(frame).as_bytes())
            .map_err(|e| BusError::Driver(e.to_string()))
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.write_all(b"C\r") {
                log::warn!("{}: close command failed: {}", self.name, e);
            }
        }
    }
}

/// Collects bytes into carriage-return terminated lines
#[derive(Default)]
struct LineAssembler {
    buf: Vec<u8>,
    text: String,
}

impl LineAssembler {
    fn push(&mut self, byte: u8) -> Option<&str> {
        match byte {
            b'\r' | b'\n' => {
                if self.buf.is_empty() {
                    return None;
                }
                self.text = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                Some(&self.text)
            }
            // BEL is the adapter's error reply
            0x07 => {
                self.buf.clear();
                None
            }
            _ => {
                if self.buf.len() >= MAX_LINE {
                    self.buf.clear();
                }
                self.buf.push(byte);
                None
            }
        }
    }
}

/// Format a standard frame as an SLCAN transmit command
pub fn format_frame(frame: &CanFrame) -> String {
    let mut out = format!("t{:03X}{:X}", frame.id & MAX_CAN_ID, frame.dlc());
    for byte in frame.payload() {
        out.push_str(&format!("{:02X}", byte));
    }
    out.push('\r');
    out
}

/// Parse an SLCAN standard frame line (without the terminator)
///
/// Extended (`T`) and remote (`r`/`R`) frames are not used by CANaerospace and
/// yield `None`, as do malformed lines.
pub fn parse_frame(line: &str) -> Option<CanFrame> {
    let rest = line.strip_prefix('t')?;
    if rest.len() < 4 || !rest.is_ascii() {
        return None;
    }

    let id = u16::from_str_radix(&rest[..3], 16).ok()?;
    let dlc = usize::from_str_radix(&rest[3..4], 16).ok()?;
    if id > MAX_CAN_ID || dlc > MAX_DLC || rest.len() < 4 + dlc * 2 {
        return None;
    }

    let mut data = [0u8; MAX_DLC];
    for (i, byte) in data.iter_mut().take(dlc).enumerate() {
        let at = 4 + i * 2;
        *byte = u8::from_str_radix(&rest[at..at + 2], 16).ok()?;
    }

    CanFrame::new(id, &data[..dlc]).ok()
}
