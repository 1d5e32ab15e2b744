//! Backing stores for the registry
//!
//! A store is a flat, byte-addressed medium: a file on a hosted system, or a
//! shared in-memory buffer for tests and volatile nodes.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed persistent medium
pub trait BlockStore: Send {
    /// Current size in bytes
    fn len(&mut self) -> io::Result<u64>;

    /// Resize the medium, zero-filling any growth
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Fill `buf` from `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` at `offset`
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Make previous writes durable
    fn flush(&mut self) -> io::Result<()>;
}

/// File-backed store
pub struct FileStore {
    file: File,
}

impl FileStore {
    /// Open or create a registry file
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }
}

impl BlockStore for FileStore {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

/// In-memory store; clones share the same bytes
#[derive(Clone, Default)]
pub struct MemoryStore {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl BlockStore for MemoryStore {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.bytes.lock().resize(len as usize, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let bytes = self.bytes.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {}..{} past end {}", start, end, bytes.len()),
            ));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut bytes = self.bytes.lock();
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_shares_bytes() {
        let mut a = MemoryStore::new();
        let mut b = a.clone();
        a.write_at(4, &[1, 2]).unwrap();
        assert_eq!(b.len().unwrap(), 6);

        let mut buf = [0u8; 2];
        b.read_at(4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        assert!(b.read_at(5, &mut buf).is_err());
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.reg");

        let mut store = FileStore::open(&path).unwrap();
        store.set_len(16).unwrap();
        store.write_at(8, b"abcd").unwrap();
        store.flush().unwrap();

        let mut reopened = FileStore::open(&path).unwrap();
        let mut buf = [0u8; 4];
        reopened.read_at(8, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        assert_eq!(reopened.len().unwrap(), 16);
    }
}
