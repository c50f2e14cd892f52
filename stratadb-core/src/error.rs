//! Error types for StrataDB

use thiserror::Error;

/// Result type alias for StrataDB operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// StrataDB error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// IO operation failed
    #[error("IO error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Corrupted WAL entry that is not at the tail of the log
    #[error("WAL corruption in segment {segment} at offset {offset}")]
    WalCorruption { segment: u64, offset: u64 },

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Malformed or unsupported query predicate
    #[error("Query parse error: {0}")]
    QueryParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The database handle has been closed
    #[error("Database is closed")]
    Closed,

    /// A public operation failed; wraps the originating fault
    #[error("{op} failed for {target}: {source}")]
    Operation {
        op: &'static str,
        target: String,
        #[source]
        source: Box<StrataError>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fault categories surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Disk read/write failure
    Io,
    /// Checksum mismatch or malformed on-disk data
    Corruption,
    /// Malformed predicate handed to the query executor
    QueryParse,
    /// Invalid configuration at open
    Config,
    /// Handle already closed
    Closed,
    /// Invariant violation inside the engine
    Internal,
}

impl StrataError {
    /// Build an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StrataError::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap this error with the public operation and its key or range
    pub fn during(self, op: &'static str, target: impl std::fmt::Display) -> Self {
        StrataError::Operation {
            op,
            target: target.to_string(),
            source: Box::new(self),
        }
    }

    /// Fault category, looking through operation wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrataError::Io { .. } => ErrorKind::Io,
            StrataError::Corruption(_)
            | StrataError::ChecksumMismatch { .. }
            | StrataError::WalCorruption { .. }
            | StrataError::Compression(_) => ErrorKind::Corruption,
            StrataError::QueryParse(_) => ErrorKind::QueryParse,
            StrataError::Config(_) => ErrorKind::Config,
            StrataError::Closed => ErrorKind::Closed,
            StrataError::Operation { source, .. } => source.kind(),
            StrataError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Io
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }
}

impl From<std::io::Error> for StrataError {
    fn from(source: std::io::Error) -> Self {
        StrataError::io("io", source)
    }
}

/// Attach context to `std::io::Result`
pub(crate) trait IoContext<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| StrataError::io(context(), e))
    }
}
