//! Fixed-length timestamp queue mapped from a sidecar file.
//!
//! The queue is the directory of active segments in a log: slot 0 holds the
//! oldest timestamp, higher slots newer ones, and 0 marks an unused slot.
//! Eviction is FIFO: a left shift drops slot 0 and the new timestamp lands in
//! the last slot.
//!
//! Only the log writer mutates the queue. Readers map it read-only and may
//! briefly see a slot duplicated while a shift is in progress.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::error::{LogError, Result};
use crate::format::{Mapping, ReadWrite, load_word, store_word, word_at};

/// Bytes per queue slot.
const SLOT_SIZE: usize = 8;

/// Memory-mapped rotation queue.
#[derive(Debug)]
pub struct RotationQueue<M: Mapping> {
    path: PathBuf,
    map: M,
    len: usize,
}

impl<M: Mapping> RotationQueue<M> {
    /// Maps an existing queue file of `len` slots.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::QueueMap`] if the file cannot be opened or mapped,
    /// and [`LogError::QueueSizeMismatch`] if it does not hold `len` slots.
    pub fn open(path: impl AsRef<Path>, len: usize) -> Result<Self> {
        let path = path.as_ref();
        let map_err = |e| LogError::QueueMap {
            path: path.to_path_buf(),
            source: e,
        };

        let file = M::open_file(path).map_err(map_err)?;
        let found = file.metadata().map_err(map_err)?.len();
        let expected = (len * SLOT_SIZE) as u64;
        if found != expected || len == 0 {
            return Err(LogError::QueueSizeMismatch {
                path: path.to_path_buf(),
                expected,
                found,
            }
            .into());
        }

        let map = M::map(&file).map_err(map_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            map,
            len,
        })
    }

    /// The queue file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether every slot is unused.
    pub fn is_empty(&self) -> bool {
        self.newest() == 0
    }

    /// Timestamp in slot `index`, or 0 when unused or out of range.
    pub fn get(&self, index: usize) -> u64 {
        if index < self.len {
            load_word(self.slot(index))
        } else {
            0
        }
    }

    /// All slots, oldest first.
    pub fn timestamps(&self) -> Vec<u64> {
        (0..self.len).map(|i| self.get(i)).collect()
    }

    /// Largest timestamp, 0 when empty.
    pub fn newest(&self) -> u64 {
        self.timestamps().into_iter().max().unwrap_or(0)
    }

    /// Slot of the largest timestamp, `None` when empty.
    pub fn newest_index(&self) -> Option<usize> {
        let stamps = self.timestamps();
        let max = stamps.iter().copied().max().filter(|&ts| ts > 0)?;
        stamps.iter().position(|&ts| ts == max)
    }

    /// Timestamp in slot 0.
    pub fn oldest(&self) -> u64 {
        self.get(0)
    }

    /// Whether the last slot is in use.
    pub fn is_full(&self) -> bool {
        self.get(self.len - 1) > 0
    }

    /// Whether `ts` is queued.
    pub fn contains(&self, ts: u64) -> bool {
        ts != 0 && self.timestamps().contains(&ts)
    }

    fn slot(&self, index: usize) -> &std::sync::atomic::AtomicU64 {
        word_at(&self.map, index * SLOT_SIZE)
    }
}

impl RotationQueue<ReadWrite> {
    /// Maps the queue file at `path`, creating a zeroed one of `len` slots
    /// if it does not exist.
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open), plus [`LogError::QueueMap`] if the file
    /// cannot be created.
    pub fn create(path: impl AsRef<Path>, len: usize) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(path)
                .map_err(|e| LogError::QueueMap {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            file.set_len((len * SLOT_SIZE) as u64)
                .map_err(|e| LogError::QueueMap {
                    path: path.to_path_buf(),
                    source: e,
                })?;
        }
        Self::open(path, len)
    }

    /// Shifts every slot left and writes `ts` into the last one, returning
    /// the evicted oldest timestamp.
    pub fn rotate(&mut self, ts: u64) -> u64 {
        let evicted = self.get(0);
        for i in 0..self.len - 1 {
            store_word(self.slot(i), self.get(i + 1));
        }
        store_word(self.slot(self.len - 1), ts);
        evicted
    }

    /// Writes `ts` into the slot after the newest one (slot 0 when empty).
    ///
    /// A full queue rotates instead; the evicted timestamp is returned.
    pub fn advance(&mut self, ts: u64) -> Option<u64> {
        if self.is_full() {
            return Some(self.rotate(ts));
        }
        let index = match self.newest_index() {
            Some(newest) if self.get(0) != 0 => newest + 1,
            _ => 0,
        };
        store_word(self.slot(index), ts);
        None
    }

    /// Clears every slot.
    pub fn reset(&mut self) {
        for i in 0..self.len {
            store_word(self.slot(i), 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ReadOnly;

    #[test]
    fn test_advance_then_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let mut queue = RotationQueue::<ReadWrite>::create(&path, 3).unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.newest_index(), None);

        assert_eq!(queue.advance(10), None);
        assert_eq!(queue.advance(20), None);
        assert_eq!(queue.timestamps(), vec![10, 20, 0]);
        assert_eq!(queue.newest_index(), Some(1));
        assert!(!queue.is_full());

        assert_eq!(queue.advance(30), None);
        assert!(queue.is_full());
        assert_eq!(queue.rotate(40), 10);
        assert_eq!(queue.timestamps(), vec![20, 30, 40]);
        assert_eq!(queue.advance(50), Some(20));
        assert_eq!(queue.oldest(), 30);
        assert_eq!(queue.newest(), 50);
        assert!(queue.contains(40));
        assert!(!queue.contains(20));
        assert!(!queue.contains(0));

        queue.reset();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reader_sees_writer_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let mut writer = RotationQueue::<ReadWrite>::create(&path, 2).unwrap();
        let reader = RotationQueue::<ReadOnly>::open(&path, 2).unwrap();

        writer.advance(7);
        assert_eq!(reader.timestamps(), vec![7, 0]);
    }

    #[test]
    fn test_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        drop(RotationQueue::<ReadWrite>::create(&path, 4).unwrap());

        let err = RotationQueue::<ReadOnly>::open(&path, 5).unwrap_err();
        assert!(err.to_string().contains("expected 40"));

        // An existing file keeps its size.
        assert!(RotationQueue::<ReadWrite>::create(&path, 3).is_err());
    }
}
