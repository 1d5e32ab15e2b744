//! Hierarchical settings stored in registry rows
//!
//! Each row holds one named entry: either a key (a directory) or a typed
//! value. Entries point at their parent by memory id, and memory id 0 is the
//! implicit root, so `slcan/device` is the `device` entry under the key
//! `slcan` under the root.
//!
//! ## Row layout
//! ```text
//! 0      kind (0x00 / 0xFF = free)
//! 1..3   parent memid, big-endian
//! 3      name length
//! 4..20  name, UTF-8, zero padded
//! 20..   value
//! ```

use crate::registry::{MemId, Registry, RegistryError};
use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Memory id of the root key
pub const ROOT: MemId = 0;

/// Longest entry name
pub const MAX_NAME_LEN: usize = 16;

const KIND: usize = 0;
const PARENT: usize = 1;
const NAME_LEN: usize = 3;
const NAME: usize = 4;
const VALUE: usize = NAME + MAX_NAME_LEN;

/// Smallest row that can hold a 4-byte value
pub const MIN_ROW_SIZE: u16 = (VALUE + 4) as u16;

const KIND_KEY: u8 = 1;
const KIND_U8: u8 = 2;
const KIND_U16: u8 = 3;
const KIND_U32: u8 = 4;
const KIND_I16: u8 = 5;
const KIND_I32: u8 = 6;
const KIND_F32: u8 = 7;
const KIND_BOOL: u8 = 8;
const KIND_STR: u8 = 9;

/// Errors from the settings tree
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no setting at '{0}'")]
    NotFound(String),

    #[error("'{0}' is a key, not a value")]
    NotAValue(String),

    #[error("'{0}' is a value, not a key")]
    NotAKey(String),

    #[error("'{path}' holds a {found}, expected {expected}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid path '{0}'")]
    InvalidPath(String),

    #[error("name '{0}' is longer than 16 bytes")]
    NameTooLong(String),

    #[error("string of {len} bytes does not fit in {max} bytes")]
    ValueTooLong { len: usize, max: usize },

    #[error("registry rows of {0} bytes are too small for settings")]
    RowTooSmall(u16),

    #[error("no free registry rows")]
    Full,

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

type Result<T> = std::result::Result<T, SettingsError>;

/// A typed setting value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SettingValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I16(i16),
    I32(i32),
    F32(f32),
    Bool(bool),
    Str(String),
}

impl SettingValue {
    /// Short type name, as used on the command line
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::U8(_) => "u8",
            Self::U16(_) => "u16",
            Self::U32(_) => "u32",
            Self::I16(_) => "i16",
            Self::I32(_) => "i32",
            Self::F32(_) => "f32",
            Self::Bool(_) => "bool",
            Self::Str(_) => "str",
        }
    }

    /// Parse a value of the named type from text
    pub fn parse(type_name: &str, text: &str) -> Option<Self> {
        let value = match type_name {
            "u8" => Self::U8(text.parse().ok()?),
            "u16" => Self::U16(text.parse().ok()?),
            "u32" => Self::U32(text.parse().ok()?),
            "i16" => Self::I16(text.parse().ok()?),
            "i32" => Self::I32(text.parse().ok()?),
            "f32" => Self::F32(text.parse().ok()?),
            "bool" => Self::Bool(text.parse().ok()?),
            "str" => Self::Str(text.to_string()),
            _ => return None,
        };
        Some(value)
    }

    /// Unsigned integer view (u8, u16, u32 widen losslessly)
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Self::U8(v) => Some(v as u32),
            Self::U16(v) => Some(v as u32),
            Self::U32(v) => Some(v),
            _ => None,
        }
    }

    /// Signed integer view
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I16(v) => Some(v as i64),
            Self::I32(v) => Some(v as i64),
            _ => self.as_u32().map(|v| v as i64),
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Self::U8(_) => KIND_U8,
            Self::U16(_) => KIND_U16,
            Self::U32(_) => KIND_U32,
            Self::I16(_) => KIND_I16,
            Self::I32(_) => KIND_I32,
            Self::F32(_) => KIND_F32,
            Self::Bool(_) => KIND_BOOL,
            Self::Str(_) => KIND_STR,
        }
    }

    fn encode(&self, out: &mut [u8]) -> Result<()> {
        match self {
            Self::U8(v) => out[0] = *v,
            Self::U16(v) => BigEndian::write_u16(out, *v),
            Self::U32(v) => BigEndian::write_u32(out, *v),
            Self::I16(v) => BigEndian::write_i16(out, *v),
            Self::I32(v) => BigEndian::write_i32(out, *v),
            Self::F32(v) => BigEndian::write_f32(out, *v),
            Self::Bool(v) => out[0] = *v as u8,
            Self::Str(s) => {
                let max = (out.len() - 1).min(u8::MAX as usize);
                if s.len() > max {
                    return Err(SettingsError::ValueTooLong { len: s.len(), max });
                }
                out[0] = s.len() as u8;
                out[1..=s.len()].copy_from_slice(s.as_bytes());
            }
        }
        Ok(())
    }

    fn decode(kind: u8, bytes: &[u8]) -> Option<Self> {
        let value = match kind {
            KIND_U8 => Self::U8(bytes[0]),
            KIND_U16 => Self::U16(BigEndian::read_u16(bytes)),
            KIND_U32 => Self::U32(BigEndian::read_u32(bytes)),
            KIND_I16 => Self::I16(BigEndian::read_i16(bytes)),
            KIND_I32 => Self::I32(BigEndian::read_i32(bytes)),
            KIND_F32 => Self::F32(BigEndian::read_f32(bytes)),
            KIND_BOOL => Self::Bool(bytes[0] != 0),
            KIND_STR => {
                let len = (bytes[0] as usize).min(bytes.len() - 1);
                Self::Str(String::from_utf8_lossy(&bytes[1..=len]).into_owned())
            }
            _ => return None,
        };
        Some(value)
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{}", v),
            Self::U16(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::F32(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{}", v),
        }
    }
}

/// A decoded settings row
#[derive(Debug, Clone)]
struct Entry {
    memid: MemId,
    parent: MemId,
    name: String,
    kind: u8,
    value: Option<SettingValue>,
}

impl Entry {
    fn is_key(&self) -> bool {
        self.kind == KIND_KEY
    }

    fn kind_name(&self) -> &'static str {
        match &self.value {
            Some(v) => v.type_name(),
            None => "key",
        }
    }
}

/// One child of a key, as listed by [`Settings::children`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Child {
    pub memid: MemId,
    pub name: String,
    /// `None` for a key
    pub value: Option<SettingValue>,
}

/// Path-addressed settings over a registry
pub struct Settings {
    registry: Arc<Registry>,
    // Serializes find-then-write sequences
    lock: Mutex<()>,
}

impl Settings {
    /// Wrap a registry
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        if registry.row_size() < MIN_ROW_SIZE {
            return Err(SettingsError::RowTooSmall(registry.row_size()));
        }
        Ok(Self {
            registry,
            lock: Mutex::new(()),
        })
    }

    /// The underlying registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Memory id of the key `name` under `parent`
    pub fn open_key(&self, parent: MemId, name: &str) -> Result<MemId> {
        let _guard = self.lock.lock();
        match self.find(parent, name)? {
            Some(entry) if entry.is_key() => Ok(entry.memid),
            Some(_) => Err(SettingsError::NotAKey(name.to_string())),
            None => Err(SettingsError::NotFound(name.to_string())),
        }
    }

    /// Memory id of the key `name` under `parent`, creating it if needed
    pub fn create_key(&self, parent: MemId, name: &str) -> Result<MemId> {
        let _guard = self.lock.lock();
        self.ensure_key(parent, name)
    }

    /// Value at `path`, `None` if any component is missing
    pub fn get(&self, path: &str) -> Result<Option<SettingValue>> {
        let _guard = self.lock.lock();
        let (parents, leaf) = split_path(path)?;

        let mut parent = ROOT;
        for name in parents {
            match self.find(parent, name)? {
                Some(entry) if entry.is_key() => parent = entry.memid,
                Some(_) => return Err(SettingsError::NotAKey(name.to_string())),
                None => return Ok(None),
            }
        }

        match self.find(parent, leaf)? {
            Some(entry) if entry.is_key() => Err(SettingsError::NotAValue(path.to_string())),
            Some(entry) => Ok(entry.value),
            None => Ok(None),
        }
    }

    /// Unsigned integer at `path` (any of u8, u16, u32)
    pub fn get_uint(&self, path: &str) -> Result<Option<u32>> {
        self.get_typed(path, "unsigned integer", |v| v.as_u32())
    }

    /// Signed integer at `path` (any integer kind)
    pub fn get_int(&self, path: &str) -> Result<Option<i64>> {
        self.get_typed(path, "integer", |v| v.as_i64())
    }

    /// Float at `path`
    pub fn get_f32(&self, path: &str) -> Result<Option<f32>> {
        self.get_typed(path, "f32", |v| match v {
            SettingValue::F32(f) => Some(*f),
            _ => None,
        })
    }

    /// Boolean at `path`
    pub fn get_bool(&self, path: &str) -> Result<Option<bool>> {
        self.get_typed(path, "bool", |v| match v {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        })
    }

    /// String at `path`
    pub fn get_str(&self, path: &str) -> Result<Option<String>> {
        self.get_typed(path, "str", |v| match v {
            SettingValue::Str(s) => Some(s.clone()),
            _ => None,
        })
    }

    /// Store `value` at `path`, creating intermediate keys
    pub fn set(&self, path: &str, value: SettingValue) -> Result<()> {
        let _guard = self.lock.lock();
        let (parents, leaf) = split_path(path)?;

        let mut parent = ROOT;
        for name in parents {
            parent = self.ensure_key(parent, name)?;
        }

        let memid = match self.find(parent, leaf)? {
            Some(entry) if entry.is_key() => {
                return Err(SettingsError::NotAValue(path.to_string()))
            }
            Some(entry) => entry.memid,
            None => self.free_row()?,
        };

        let mut row = self.new_row(value.kind(), parent, leaf)?;
        value.encode(&mut row[VALUE..])?;
        self.registry.write_row(memid, &row)?;
        log::debug!("Setting {} = {} ({})", path, value, value.type_name());
        Ok(())
    }

    /// Remove the entry at `path` (and everything below it), returning whether it existed
    pub fn remove(&self, path: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let (parents, leaf) = split_path(path)?;

        let mut parent = ROOT;
        for name in parents {
            match self.find(parent, name)? {
                Some(entry) if entry.is_key() => parent = entry.memid,
                _ => return Ok(false),
            }
        }

        match self.find(parent, leaf)? {
            Some(entry) => {
                self.erase(entry.memid)?;
                log::debug!("Removed setting {}", path);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Entries directly under the key `parent`
    pub fn children(&self, parent: MemId) -> Result<Vec<Child>> {
        let _guard = self.lock.lock();
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.parent == parent)
            .map(|e| Child {
                memid: e.memid,
                name: e.name,
                value: e.value,
            })
            .collect())
    }

    /// Every value in the tree keyed by its full path
    pub fn tree(&self) -> Result<BTreeMap<String, SettingValue>> {
        let _guard = self.lock.lock();
        let entries = self.entries()?;
        let by_id: BTreeMap<MemId, &Entry> = entries.iter().map(|e| (e.memid, e)).collect();

        let mut out = BTreeMap::new();
        for entry in entries.iter() {
            let Some(value) = &entry.value else { continue };

            let mut parts = vec![entry.name.as_str()];
            let mut parent = entry.parent;
            let mut depth = 0;
            while parent != ROOT && depth < by_id.len() {
                match by_id.get(&parent) {
                    Some(p) => {
                        parts.push(p.name.as_str());
                        parent = p.parent;
                    }
                    None => break,
                }
                depth += 1;
            }
            if parent != ROOT {
                log::warn!("Orphaned setting '{}' at row {}", entry.name, entry.memid);
                continue;
            }

            parts.reverse();
            out.insert(parts.join("/"), value.clone());
        }
        Ok(out)
    }

    fn get_typed<T>(
        &self,
        path: &str,
        expected: &'static str,
        convert: impl Fn(&SettingValue) -> Option<T>,
    ) -> Result<Option<T>> {
        match self.get(path)? {
            None => Ok(None),
            Some(value) => convert(&value).map(Some).ok_or(SettingsError::TypeMismatch {
                path: path.to_string(),
                expected,
                found: value.type_name(),
            }),
        }
    }

    fn ensure_key(&self, parent: MemId, name: &str) -> Result<MemId> {
        match self.find(parent, name)? {
            Some(entry) if entry.is_key() => Ok(entry.memid),
            Some(entry) => Err(SettingsError::TypeMismatch {
                path: name.to_string(),
                expected: "key",
                found: entry.kind_name(),
            }),
            None => {
                let memid = self.free_row()?;
                let row = self.new_row(KIND_KEY, parent, name)?;
                self.registry.write_row(memid, &row)?;
                log::debug!("Created key '{}' at row {}", name, memid);
                Ok(memid)
            }
        }
    }

    /// Clear `memid` and its descendants, deepest rows first
    fn erase(&self, memid: MemId) -> Result<()> {
        let entries = self.entries()?;
        let mut seen = BTreeSet::from([memid]);
        let mut order = vec![memid];
        let mut next = 0;
        while next < order.len() {
            let parent = order[next];
            next += 1;
            for entry in entries.iter().filter(|e| e.parent == parent) {
                // A corrupted row may point back up the tree
                if seen.insert(entry.memid) {
                    order.push(entry.memid);
                }
            }
        }

        let row = vec![self.registry.default_fill(); self.registry.row_size() as usize];
        for memid in order.into_iter().rev() {
            self.registry.write_row(memid, &row)?;
        }
        Ok(())
    }

    fn new_row(&self, kind: u8, parent: MemId, name: &str) -> Result<Vec<u8>> {
        if name.len() > MAX_NAME_LEN {
            return Err(SettingsError::NameTooLong(name.to_string()));
        }
        let mut row = vec![0u8; self.registry.row_size() as usize];
        row[KIND] = kind;
        BigEndian::write_u16(&mut row[PARENT..PARENT + 2], parent);
        row[NAME_LEN] = name.len() as u8;
        row[NAME..NAME + name.len()].copy_from_slice(name.as_bytes());
        Ok(row)
    }

    fn read_entry(&self, memid: MemId) -> Result<Option<Entry>> {
        let row = self.registry.read_row(memid)?;
        let kind = row[KIND];
        if kind == 0x00 || kind == 0xFF {
            return Ok(None);
        }

        let name_len = (row[NAME_LEN] as usize).min(MAX_NAME_LEN);
        let name = String::from_utf8_lossy(&row[NAME..NAME + name_len]).into_owned();
        let value = if kind == KIND_KEY {
            None
        } else {
            match SettingValue::decode(kind, &row[VALUE..]) {
                Some(v) => Some(v),
                None => {
                    log::warn!("Unknown setting kind {} at row {}", kind, memid);
                    return Ok(None);
                }
            }
        };

        Ok(Some(Entry {
            memid,
            parent: BigEndian::read_u16(&row[PARENT..PARENT + 2]),
            name,
            kind,
            value,
        }))
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        for memid in (ROOT + 1)..self.registry.capacity() {
            if let Some(entry) = self.read_entry(memid)? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn find(&self, parent: MemId, name: &str) -> Result<Option<Entry>> {
        for memid in (ROOT + 1)..self.registry.capacity() {
            if let Some(entry) = self.read_entry(memid)? {
                if entry.parent == parent && entry.name == name {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    fn free_row(&self) -> Result<MemId> {
        for memid in (ROOT + 1)..self.registry.capacity() {
            if self.read_entry(memid)?.is_none() {
                return Ok(memid);
            }
        }
        Err(SettingsError::Full)
    }
}

fn split_path(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let leaf = parts
        .pop()
        .ok_or_else(|| SettingsError::InvalidPath(path.to_string()))?;
    if let Some(long) = parts.iter().chain(std::iter::once(&leaf)).find(|p| p.len() > MAX_NAME_LEN) {
        return Err(SettingsError::NameTooLong(long.to_string()));
    }
    Ok((parts, leaf))
}
