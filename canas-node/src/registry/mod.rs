//! Persistent key/value registry
//!
//! The registry is a fixed array of equally sized rows addressed by a 16-bit
//! memory id. Node configuration lives here and survives restarts.
//!
//! ## On-media layout
//! ```text
//! header (16 bytes): "CNRG" | version u16 | capacity u16 | row_size u16 | reserved
//! row r:             slot A | slot B
//! slot:              seq u32 | data[row_size] | commit u32
//! ```
//! A slot is valid when `seq != 0` and `commit == seq`. A row's current value
//! is the valid slot with the highest sequence number. Writes always go to the
//! other slot with the next sequence number, and the commit word is written
//! last, so a write interrupted at any point leaves the previous value intact.
//!
//! Rows are cached after first access. `sync` makes every write durable.
//!
//! With `sync_on_write` the store is flushed between a slot's body and its
//! commit word, so the commit word never reaches the media ahead of the data
//! it covers. A [`FileStore`] opened with `sync_on_write` is the crash-safe
//! configuration; without it only rows written before a completed `sync`
//! survive a power loss.

mod error;
mod store;

pub use error::RegistryError;
pub use store::{BlockStore, FileStore, MemoryStore};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

type Result<T> = std::result::Result<T, RegistryError>;

/// Registry memory id (row index)
pub type MemId = u16;

const MAGIC: &[u8; 4] = b"CNRG";
const VERSION: u16 = 1;
const HEADER_LEN: u64 = 16;
const SEQ_LEN: usize = 4;

/// Largest row the registry accepts
pub const MAX_ROW_SIZE: u16 = 4096;

/// Open parameters for a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Wipe and re-initialize the store
    pub factory_reset: bool,
    /// Number of rows
    pub capacity: u16,
    /// Bytes per row
    pub row_size: u16,
    /// Byte every row holds after a factory reset (0xFF, like erased EEPROM)
    pub default_fill: u8,
    /// Flush the store inside and after every row write
    pub sync_on_write: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            factory_reset: false,
            capacity: 256,
            row_size: 32,
            default_fill: 0xFF,
            sync_on_write: false,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedRow {
    data: Vec<u8>,
    seq: u32,
    slot: u8,
    dirty: bool,
}

struct RegistryInner {
    store: Box<dyn BlockStore>,
    rows: HashMap<MemId, CachedRow>,
}

/// Fixed-row persistent store
pub struct Registry {
    inner: Mutex<RegistryInner>,
    options: RegistryOptions,
}

impl Registry {
    /// Open a registry on `store`, formatting it if empty or on factory reset
    pub fn open(mut store: Box<dyn BlockStore>, options: RegistryOptions) -> Result<Self> {
        if options.capacity == 0 {
            return Err(RegistryError::Geometry("capacity must be at least one row".into()));
        }
        if options.row_size == 0 || options.row_size > MAX_ROW_SIZE {
            return Err(RegistryError::Geometry(format!(
                "row size must be between 1 and {} bytes, got {}",
                MAX_ROW_SIZE, options.row_size
            )));
        }

        let registry_len = Self::total_len(&options);

        if options.factory_reset || store.len()? == 0 {
            log::info!(
                "Formatting registry: {} rows of {} bytes",
                options.capacity,
                options.row_size
            );
            Self::format(store.as_mut(), &options)?;
        } else {
            Self::check_header(store.as_mut(), &options)?;
            let len = store.len()?;
            if len < registry_len {
                return Err(RegistryError::Format(format!(
                    "store holds {} bytes, expected {}",
                    len, registry_len
                )));
            }
            log::debug!("Opened registry with {} rows", options.capacity);
        }

        Ok(Self {
            inner: Mutex::new(RegistryInner {
                store,
                rows: HashMap::new(),
            }),
            options,
        })
    }

    /// Open (or create) a file-backed registry
    pub fn open_file(path: &Path, options: RegistryOptions) -> Result<Self> {
        log::info!("Opening registry file: {:?}", path);
        Self::open(Box::new(FileStore::open(path)?), options)
    }

    /// Open a registry over a shared in-memory store
    pub fn open_memory(store: MemoryStore, options: RegistryOptions) -> Result<Self> {
        Self::open(Box::new(store), options)
    }

    /// Number of rows
    pub fn capacity(&self) -> u16 {
        self.options.capacity
    }

    /// Bytes per row
    pub fn row_size(&self) -> u16 {
        self.options.row_size
    }

    /// Byte value of an erased row
    pub fn default_fill(&self) -> u8 {
        self.options.default_fill
    }

    /// Read `length` bytes (whole rows) starting at row `memid` into `buf`
    pub fn read_block(&self, memid: MemId, length: usize, buf: &mut [u8]) -> Result<()> {
        let rows = self.check_range(memid, length, buf.len())?;
        let row_size = self.options.row_size as usize;
        let mut inner = self.inner.lock();

        for (i, chunk) in buf[..length].chunks_mut(row_size).enumerate() {
            let row = self.load(&mut inner, memid + i as MemId)?;
            chunk.copy_from_slice(&row.data);
        }
        log::trace!("Read rows {}..{}", memid, memid as u32 + rows);
        Ok(())
    }

    /// Write `length` bytes (whole rows) from `data` starting at row `memid`
    ///
    /// Each row is replaced atomically. A multi-row write that fails part way
    /// leaves the rows before the failure updated and the rest unchanged.
    pub fn write_block(&self, memid: MemId, length: usize, data: &[u8]) -> Result<()> {
        self.check_range(memid, length, data.len())?;
        let row_size = self.options.row_size as usize;
        let mut inner = self.inner.lock();

        for (i, chunk) in data[..length].chunks(row_size).enumerate() {
            self.store_row(&mut inner, memid + i as MemId, chunk)?;
        }

        if self.options.sync_on_write {
            self.sync_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Read a single row
    pub fn read_row(&self, memid: MemId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.options.row_size as usize];
        self.read_block(memid, buf.len(), &mut buf)?;
        Ok(buf)
    }

    /// Replace a single row
    pub fn write_row(&self, memid: MemId, data: &[u8]) -> Result<()> {
        self.write_block(memid, self.options.row_size as usize, data)
    }

    /// Flush all written rows to the backing store
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.sync_locked(&mut inner)
    }

    /// Rows written since the last sync
    pub fn dirty_rows(&self) -> usize {
        self.inner.lock().rows.values().filter(|r| r.dirty).count()
    }

    /// Erase every row back to the default fill
    pub fn factory_reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        log::warn!("Factory reset of registry ({} rows)", self.options.capacity);
        inner.rows.clear();
        Self::format(inner.store.as_mut(), &self.options)
    }

    fn slot_len(options: &RegistryOptions) -> u64 {
        (SEQ_LEN * 2 + options.row_size as usize) as u64
    }

    fn total_len(options: &RegistryOptions) -> u64 {
        HEADER_LEN + Self::slot_len(options) * 2 * options.capacity as u64
    }

    fn slot_offset(&self, memid: MemId, slot: u8) -> u64 {
        HEADER_LEN + Self::slot_len(&self.options) * (memid as u64 * 2 + slot as u64)
    }

    fn check_range(&self, memid: MemId, length: usize, available: usize) -> Result<u32> {
        let row_size = self.options.row_size;
        if length == 0 || length % row_size as usize != 0 {
            return Err(RegistryError::Misaligned { length, row_size });
        }
        if available < length {
            return Err(RegistryError::BufferTooSmall {
                length,
                actual: available,
            });
        }

        let rows = (length / row_size as usize) as u32;
        let end = memid as u32 + rows;
        if end > self.options.capacity as u32 {
            return Err(RegistryError::OutOfRange {
                start: memid as u32,
                end,
                capacity: self.options.capacity,
            });
        }
        Ok(rows)
    }

    fn format(store: &mut dyn BlockStore, options: &RegistryOptions) -> Result<()> {
        let mut header = [0u8; HEADER_LEN as usize];
        header[..4].copy_from_slice(MAGIC);
        BigEndian::write_u16(&mut header[4..6], VERSION);
        BigEndian::write_u16(&mut header[6..8], options.capacity);
        BigEndian::write_u16(&mut header[8..10], options.row_size);

        store.set_len(0)?;
        store.set_len(Self::total_len(options))?;
        store.write_at(0, &header)?;

        // Slot A of every row holds the fill pattern at sequence 1; slot B
        // stays zeroed and therefore invalid.
        let slot_len = Self::slot_len(options) as usize;
        let mut slot = vec![options.default_fill; slot_len];
        BigEndian::write_u32(&mut slot[..SEQ_LEN], 1);
        BigEndian::write_u32(&mut slot[slot_len - SEQ_LEN..], 1);

        for memid in 0..options.capacity as u64 {
            store.write_at(HEADER_LEN + memid * 2 * slot_len as u64, &slot)?;
        }
        store.flush()?;
        Ok(())
    }

    fn check_header(store: &mut dyn BlockStore, options: &RegistryOptions) -> Result<()> {
        let mut header = [0u8; HEADER_LEN as usize];
        store.read_at(0, &mut header)?;

        if &header[..4] != MAGIC {
            return Err(RegistryError::Format("bad magic".into()));
        }
        let version = BigEndian::read_u16(&header[4..6]);
        if version != VERSION {
            return Err(RegistryError::Format(format!("unsupported version {}", version)));
        }
        let capacity = BigEndian::read_u16(&header[6..8]);
        let row_size = BigEndian::read_u16(&header[8..10]);
        if capacity != options.capacity || row_size != options.row_size {
            return Err(RegistryError::Format(format!(
                "store has {} rows of {} bytes, requested {} rows of {} bytes",
                capacity, row_size, options.capacity, options.row_size
            )));
        }
        Ok(())
    }

    /// Fetch a row into the cache, resolving which slot is current
    fn load<'a>(&self, inner: &'a mut RegistryInner, memid: MemId) -> Result<&'a CachedRow> {
        if !inner.rows.contains_key(&memid) {
            let row_size = self.options.row_size as usize;
            let mut best: Option<CachedRow> = None;
            let mut raw = vec![0u8; row_size + SEQ_LEN * 2];

            for slot in 0..2u8 {
                inner.store.read_at(self.slot_offset(memid, slot), &mut raw)?;
                let seq = BigEndian::read_u32(&raw[..SEQ_LEN]);
                let commit = BigEndian::read_u32(&raw[SEQ_LEN + row_size..]);
                if seq == 0 || seq != commit {
                    continue;
                }
                if best.as_ref().map_or(true, |b| seq > b.seq) {
                    best = Some(CachedRow {
                        data: raw[SEQ_LEN..SEQ_LEN + row_size].to_vec(),
                        seq,
                        slot,
                        dirty: false,
                    });
                }
            }

            let row = best.unwrap_or_else(|| {
                log::warn!("Registry row {} has no valid slot, using default fill", memid);
                CachedRow {
                    data: vec![self.options.default_fill; row_size],
                    seq: 0,
                    slot: 1,
                    dirty: false,
                }
            });
            inner.rows.insert(memid, row);
        }

        inner
            .rows
            .get(&memid)
            .ok_or_else(|| RegistryError::Format(format!("row {} missing from cache", memid)))
    }

    fn store_row(&self, inner: &mut RegistryInner, memid: MemId, data: &[u8]) -> Result<()> {
        let (seq, slot) = {
            let current = self.load(inner, memid)?;
            (current.seq.wrapping_add(1).max(1), current.slot ^ 1)
        };
        let offset = self.slot_offset(memid, slot);
        let row_size = self.options.row_size as usize;

        let mut body = vec![0u8; SEQ_LEN + row_size];
        BigEndian::write_u32(&mut body[..SEQ_LEN], seq);
        body[SEQ_LEN..].copy_from_slice(data);
        inner.store.write_at(offset, &body)?;
        if self.options.sync_on_write {
            inner.store.flush()?;
        }

        let mut commit = [0u8; SEQ_LEN];
        BigEndian::write_u32(&mut commit, seq);
        inner.store.write_at(offset + (SEQ_LEN + row_size) as u64, &commit)?;

        inner.rows.insert(
            memid,
            CachedRow {
                data: data.to_vec(),
                seq,
                slot,
                dirty: true,
            },
        );
        Ok(())
    }

    fn sync_locked(&self, inner: &mut RegistryInner) -> Result<()> {
        inner.store.flush()?;
        for row in inner.rows.values_mut() {
            row.dirty = false;
        }
        Ok(())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            log::error!("Failed to sync registry on close: {}", e);
        }
    }
}
