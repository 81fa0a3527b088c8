//! Error types for ringtail segment files and segment logs.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all ringtail operations.
///
/// Conditions the format treats as ordinary outcomes are deliberately absent:
/// a write that does not fit is reported through the remaining-row count of
/// [`append`](crate::segment::Segment::append), a refused resize through
/// [`ResizeOutcome::Refused`](crate::segment::ResizeOutcome::Refused), and a
/// file without a ringtail footer opens in raw mode.
#[derive(Error, Debug)]
pub enum RingtailError {
    /// The file is not a valid segment file.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// An open segment handle cannot perform the operation.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Operating-system level I/O on a segment file failed.
    #[error("segment I/O error: {0}")]
    SegmentIo(#[from] SegmentIoError),

    /// Error in the segment rotation layer.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Invalid log configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl RingtailError {
    /// Returns true when the error means the handle's mapping was invalidated
    /// by a resize and the file has to be loaded again.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Segment(SegmentError::StaleMapping { .. }))
    }
}

/// Errors raised while decoding or validating the on-disk layout.
#[derive(Error, Debug)]
pub enum FormatError {
    /// The file ends before the header, data region or footer is complete.
    #[error("'{}' is truncated: {len} bytes, expected at least {expected}", path.display())]
    Truncated {
        /// The segment file path.
        path: PathBuf,
        /// Actual file length.
        len: u64,
        /// Minimum length required by the header.
        expected: u64,
    },

    /// The array header is missing or malformed.
    #[error("invalid array header in '{}': {reason}", path.display())]
    InvalidHeader {
        /// The segment file path.
        path: PathBuf,
        /// What was wrong with the header.
        reason: String,
    },

    /// The stored element type does not match the requested row type.
    #[error("element type mismatch in '{}': expected {expected} {expected_shape:?}, found {found} {found_shape:?}", path.display())]
    ElementMismatch {
        /// The segment file path.
        path: PathBuf,
        /// Descriptor of the requested row type.
        expected: String,
        /// Per-row shape of the requested row type.
        expected_shape: Vec<usize>,
        /// Descriptor stored in the file.
        found: String,
        /// Per-row shape stored in the file.
        found_shape: Vec<usize>,
    },

    /// The data region is not aligned for the row type.
    #[error("data region of '{}' at offset {offset} is not aligned to {align} bytes", path.display())]
    Misaligned {
        /// The segment file path.
        path: PathBuf,
        /// Byte offset of the data region.
        offset: u64,
        /// Required alignment.
        align: usize,
    },

    /// The footer carries the ringtail magic but disagrees with the header.
    #[error("segment '{}' is corrupted: {reason}", path.display())]
    CorruptedFooter {
        /// The segment file path.
        path: PathBuf,
        /// Description of the inconsistency.
        reason: String,
    },

    /// A ring-buffer operation was requested on a file without a footer.
    #[error("'{}' has no ringtail footer; only raw array access is available", path.display())]
    MissingFooter {
        /// The file path.
        path: PathBuf,
    },

    /// The header would not fit the 16-bit length field.
    #[error("array header of {len} bytes exceeds the format limit")]
    HeaderTooLarge {
        /// Encoded header length.
        len: usize,
    },
}

/// Errors raised by an open segment handle.
#[derive(Error, Debug)]
pub enum SegmentError {
    /// The file was resized after this handle mapped it.
    #[error("stale mapping of '{}': mapped {mapped_len} bytes at generation {mapped_generation}, file is now {file_len} bytes", path.display())]
    StaleMapping {
        /// The segment file path.
        path: PathBuf,
        /// File length when the handle was loaded.
        mapped_len: u64,
        /// Trailer generation when the handle was loaded.
        mapped_generation: u64,
        /// Current file length.
        file_len: u64,
    },

    /// Cursor values outside `0..=capacity`.
    #[error("cursors ({start}, {end}) out of range for capacity {capacity}")]
    CursorOutOfRange {
        /// Requested read cursor.
        start: usize,
        /// Requested write cursor.
        end: usize,
        /// Physical capacity of the segment.
        capacity: usize,
    },
}

/// Errors raised by file and mapping I/O on a segment.
#[derive(Error, Debug)]
pub enum SegmentIoError {
    /// Failed to open or read a segment file.
    #[error("failed to read '{}' at offset {offset}: {source}", path.display())]
    ReadFailed {
        /// The segment file path.
        path: PathBuf,
        /// Byte offset of the failed access.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or write a segment file.
    #[error("failed to write '{}' at offset {offset}: {source}", path.display())]
    WriteFailed {
        /// The segment file path.
        path: PathBuf,
        /// Byte offset of the failed access.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping failed.
    #[error("memory mapping failed for '{}': {source}", path.display())]
    MapFailed {
        /// The segment file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to flush the mapping to disk.
    #[error("failed to sync '{}' to disk: {source}", path.display())]
    SyncFailed {
        /// The segment file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to rename or delete a segment file.
    #[error("failed to move or remove '{}': {source}", path.display())]
    FileOp {
        /// The segment file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the segment rotation layer.
#[derive(Error, Debug)]
pub enum LogError {
    /// The log directory could not be created, listed or removed.
    #[error("failed to access log directory '{}': {source}", path.display())]
    DirectoryAccess {
        /// The directory path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The log metadata file is missing fields or has an unknown version.
    #[error("corrupted log metadata: {reason}")]
    CorruptedMetadata {
        /// Description of what was invalid.
        reason: String,
    },

    /// The log was created for a different row type or queue length.
    #[error("log metadata mismatch for {field}: stored {stored}, requested {requested}")]
    MetadataMismatch {
        /// The mismatching field.
        field: &'static str,
        /// Value stored on disk.
        stored: String,
        /// Value supplied by the caller.
        requested: String,
    },

    /// Failed to (de)serialize the log metadata.
    #[error("failed to (de)serialize log metadata: {0}")]
    MetadataSerialize(#[from] serde_json::Error),

    /// The rotation queue file has an unexpected size.
    #[error("rotation queue '{}' is {found} bytes, expected {expected}", path.display())]
    QueueSizeMismatch {
        /// The queue file path.
        path: PathBuf,
        /// Expected length in bytes.
        expected: u64,
        /// Actual length in bytes.
        found: u64,
    },

    /// The rotation queue file could not be opened or mapped.
    #[error("failed to map rotation queue '{}': {source}", path.display())]
    QueueMap {
        /// The queue file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The system clock cannot produce a segment timestamp.
    #[error("system clock unusable for segment timestamps: {reason}")]
    Clock {
        /// Why the clock reading was rejected.
        reason: &'static str,
    },
}

/// Errors raised while validating a [`LogConfig`](crate::config::LogConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Segments must hold at least one row.
    #[error("capacity_per_segment must be > 0")]
    ZeroCapacity,

    /// The rotation queue needs room for an old and a new segment.
    #[error("queue_len {len} is too short (must be >= 2)")]
    QueueTooShort {
        /// The rejected queue length.
        len: usize,
    },
}

/// Type alias for `Result<T, RingtailError>`.
pub type Result<T> = std::result::Result<T, RingtailError>;
