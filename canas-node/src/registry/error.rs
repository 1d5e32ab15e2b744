//! Registry error types

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("length {length} is not a positive multiple of the row size {row_size}")]
    Misaligned { length: usize, row_size: u16 },

    #[error("rows {start}..{end} exceed the registry capacity of {capacity} rows")]
    OutOfRange { start: u32, end: u32, capacity: u16 },

    #[error("buffer of {actual} bytes is smaller than the requested {length} bytes")]
    BufferTooSmall { length: usize, actual: usize },

    #[error("invalid registry geometry: {0}")]
    Geometry(String),

    #[error("backing store does not hold a compatible registry: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
