//! Sequential read cursor of a segment handle.
//!
//! Each handle keeps a private "tell" position, independent of the shared
//! `start` cursor, so several readers can tail the same segment without
//! consuming rows. Positions are logical: 0 is `start`, `size()` is `end`.
//! The position is stored physically so it stays put while the writer
//! appends; if the writer pops past it, it snaps back to `start`.

use std::borrow::Cow;
use std::io::SeekFrom;

use crate::element::Element;
use crate::error::Result;
use crate::format::Mapping;
use crate::segment::{Segment, live_len};

impl<T: Element, M: Mapping> Segment<T, M> {
    /// Logical position of the read cursor.
    pub fn tell(&self) -> usize {
        let (start, end) = self.cursors();
        logical_of(self.tell, start, end, self.capacity())
    }

    /// Moves the read cursor, clamped to `0..=size()`, and returns the new
    /// position.
    pub fn seek(&mut self, pos: SeekFrom) -> usize {
        let (start, end) = self.cursors();
        let capacity = self.capacity();
        let size = live_len(start, end, capacity);

        let target = match pos {
            SeekFrom::Start(n) => usize::try_from(n).unwrap_or(usize::MAX).min(size),
            SeekFrom::Current(delta) => {
                offset_by(logical_of(self.tell, start, end, capacity), delta, size)
            }
            SeekFrom::End(delta) => offset_by(size, delta, size),
        };

        self.tell = physical_of(target, start, end, capacity);
        target
    }

    /// Moves the read cursor back to `start`.
    pub fn rewind(&mut self) {
        self.tell = self.start();
    }

    /// Reads up to `n` rows from the cursor, preceded by up to `prefetch`
    /// rows before it (never before `start`).
    ///
    /// The cursor advances by the new rows only. An empty result with
    /// `prefetch == 0` means the reader has caught up with the writer.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`](crate::SegmentError::StaleMapping)
    /// after a resize.
    pub fn read(&mut self, n: usize, prefetch: usize) -> Result<Cow<'_, [T]>> {
        self.read_counted(n, prefetch).map(|(rows, _)| rows)
    }

    /// [`read`](Self::read), also returning how many of the rows are new.
    pub(crate) fn read_counted(
        &mut self,
        n: usize,
        prefetch: usize,
    ) -> Result<(Cow<'_, [T]>, usize)> {
        self.ensure_fresh()?;
        let (start, end) = self.cursors();
        let capacity = self.capacity();
        let size = live_len(start, end, capacity);

        let current = logical_of(self.tell, start, end, capacity);
        let from = current.saturating_sub(prefetch);
        let to = current.saturating_add(n).min(size);

        self.tell = physical_of(to, start, end, capacity);
        Ok((self.logical_range((start, end), from, to), to - current.min(to)))
    }
}

/// Logical offset of physical row `physical`, or 0 when it lies outside the
/// live range.
fn logical_of(physical: usize, start: usize, end: usize, capacity: usize) -> usize {
    if end >= start {
        if (start..=end).contains(&physical) {
            physical - start
        } else {
            0
        }
    } else if physical >= start {
        physical - start
    } else if physical <= end {
        capacity - start + physical
    } else {
        0
    }
}

/// Physical row of logical offset `logical`, clamped to the live range.
fn physical_of(logical: usize, start: usize, end: usize, capacity: usize) -> usize {
    let logical = logical.min(live_len(start, end, capacity));
    if end >= start {
        return start + logical;
    }
    let first = capacity - start;
    if logical < first {
        start + logical
    } else {
        logical - first
    }
}

fn offset_by(base: usize, delta: i64, size: usize) -> usize {
    let magnitude = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);
    let moved = if delta >= 0 {
        base.saturating_add(magnitude)
    } else {
        base.saturating_sub(magnitude)
    };
    moved.min(size)
}
