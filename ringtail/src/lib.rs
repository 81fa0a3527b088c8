//! # ringtail
//!
//! Memory-mapped ring-buffer files and an unbounded log built from them.
//!
//! A segment file is a plain `.npy` array (readable by any NPY reader) with a
//! small trailer appended: a resize generation and a footer holding the ring
//! buffer's `start`/`end` cursors. One process appends, any number of processes
//! map the same file read-only and see new rows as soon as `end` moves. There
//! is no RPC and no lock; coordination happens through the shared page cache.
//!
//! ## Key Properties
//!
//! - Appends copy rows straight into the mapping, then publish `end`
//! - Wraparound ring semantics with an explicit two-step write across the wrap point
//! - Reads borrow from the mapping unless the range straddles the wrap point
//! - Resizes invalidate other handles detectably instead of silently
//! - A rotating log keeps a bounded number of active segments on disk
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ringtail::{AppendMode, LogConfig, LogWriter, SegmentReader, SegmentWriter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // A single ring buffer of 1024 u64 rows.
//! let mut seg = SegmentWriter::<u64>::create("ring.seg", &[], 1024, None)?;
//! seg.append(&[1, 2, 3], AppendMode::RING)?;
//!
//! // Another process can tail it without consuming rows.
//! let mut tail = SegmentReader::<u64>::open("ring.seg")?;
//! let rows = tail.read(100, 0)?;
//! assert_eq!(rows.as_ref(), &[1, 2, 3]);
//!
//! // An unbounded log of 4 rotating segments of 65536 rows.
//! let mut log = LogWriter::<u64>::open("./log", LogConfig::new(65_536, 4)?)?;
//! log.append(&[4, 5, 6])?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Segment`]: one open segment file, [`SegmentWriter`] or [`SegmentReader`]
//! - [`SegmentLog`]: a directory of rotating segments, [`LogWriter`] or [`LogReader`]
//! - [`Element`]: the row types a segment can hold
//!
//! ## Modules
//!
//! - [`segment`]: Ring-buffer engine: append, pop, slicing, resize, merge
//! - [`cursor`]: Sequential, non-consuming reads
//! - [`log`]: Segment rotation layer
//! - [`queue`]: Memory-mapped rotation queue
//! - [`config`]: Log configuration
//! - [`format`]: File layout, footer and creation
//! - [`header`]: NPY array header codec
//! - [`element`]: Row types
//! - [`error`]: Error types

pub mod config;
pub mod cursor;
pub mod element;
pub mod error;
pub mod format;
pub mod header;
pub mod log;
pub mod queue;
pub mod segment;

// Re-export primary API types at crate root for convenience.
pub use config::LogConfig;
pub use element::Element;
pub use error::{
    ConfigError, FormatError, LogError, Result, RingtailError, SegmentError, SegmentIoError,
};
pub use format::{Footer, Layout, Mapping, ReadOnly, ReadWrite};
pub use header::ArrayHeader;
pub use log::{LogReader, LogWriter, SegmentLog};
pub use queue::RotationQueue;
pub use segment::{
    AppendMode, Loaded, RawArray, ResizeOutcome, Segment, SegmentInfo, SegmentReader,
    SegmentWriter,
};
