//! Configuration of a segment log.
//!
//! The configuration is persisted in the log's `meta.json` when the log is
//! first created and checked again on every reopen.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default number of rows per segment file.
pub const DEFAULT_CAPACITY_PER_SEGMENT: usize = 1024;

/// Default number of rotation queue slots.
pub const DEFAULT_QUEUE_LEN: usize = 4;

/// Sizing of a segment log.
///
/// # Example
///
/// ```rust
/// use ringtail::LogConfig;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// // 64k rows per segment, 8 live segments.
/// let config = LogConfig::new(65_536, 8)?;
/// assert_eq!(config.queue_len, 8);
///
/// assert!(LogConfig::new(0, 8).is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Rows reserved in each newly created segment.
    ///
    /// A batch larger than this that starts a fresh segment gets a segment
    /// of exactly its own length.
    pub capacity_per_segment: usize,

    /// Number of segments kept in the rotation queue.
    ///
    /// When a new segment is needed and the queue is full, the oldest
    /// segment leaves the queue and is truncated to its live rows.
    pub queue_len: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            capacity_per_segment: DEFAULT_CAPACITY_PER_SEGMENT,
            queue_len: DEFAULT_QUEUE_LEN,
        }
    }
}

impl LogConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `capacity_per_segment` is zero or
    /// `queue_len` is below 2.
    pub fn new(capacity_per_segment: usize, queue_len: usize) -> Result<Self> {
        let config = Self {
            capacity_per_segment,
            queue_len,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a zero segment capacity or a queue shorter
    /// than two slots.
    pub fn validate(&self) -> Result<()> {
        if self.capacity_per_segment == 0 {
            return Err(ConfigError::ZeroCapacity.into());
        }
        if self.queue_len < 2 {
            return Err(ConfigError::QueueTooShort {
                len: self.queue_len,
            }
            .into());
        }
        Ok(())
    }
}
