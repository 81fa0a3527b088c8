//! Ring-buffer engine over one memory-mapped segment file.
//!
//! A segment holds `capacity` rows and two cursors in its footer. Live rows
//! occupy `[start, end)` when `end >= start`, and `[start, capacity) ++
//! [0, end)` when the buffer has wrapped. In ring mode one slot stays free, so
//! a full buffer satisfies `(end + 1) % capacity == start`.
//!
//! # Handles
//!
//! - [`SegmentWriter`] maps the file read-write and is the only handle with
//!   mutating operations. It is not `Clone`.
//! - [`SegmentReader`] maps the file read-only. Any number of processes may
//!   hold one while a single writer appends.
//!
//! Readers observe the writer through the footer words: rows are copied into
//! the mapping first, then `end` is published with release ordering.
//!
//! # Stale mappings
//!
//! [`resize`](Segment::resize) replaces the file with a copy of a different
//! length and bumps the generation word of the file it replaced. Every handle
//! remembers the length and generation from load time, and every fallible
//! operation fails with [`SegmentError::StaleMapping`] once either changed.
//! A stale handle keeps mapping the replaced file, so its infallible
//! accessors return the last values written there.
//!
//! # Example
//!
//! ```rust,no_run
//! use ringtail::{AppendMode, SegmentWriter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut seg = SegmentWriter::<u64>::create("ticks.seg", &[], 6, None)?;
//! assert_eq!(seg.append(&[1, 2, 3, 4, 5, 6], AppendMode::RING)?, 0);
//! assert_eq!(seg.head(4)?.as_ref(), &[1, 2, 3, 4]);
//! assert_eq!(seg.pop(true)?.as_ref(), &[1, 2, 3, 4, 5, 6]);
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::fs::{self, File};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;

use tracing::{debug, info, warn};

use crate::element::Element;
use crate::error::{FormatError, Result, SegmentError, SegmentIoError};
use crate::format::{
    END_WORD, Footer, Layout, Mapping, ReadOnly, ReadWrite, START_WORD, load_word, map_file,
    resize_file, save, store_word, word_at,
};
use crate::header::ArrayHeader;

/// A read-only segment handle.
pub type SegmentReader<T> = Segment<T, ReadOnly>;

/// The read-write segment handle.
pub type SegmentWriter<T> = Segment<T, ReadWrite>;

/// How [`Segment::append`] treats the space left in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendMode {
    /// Wrap the write cursor to the front when it reaches the physical end.
    pub ring: bool,
    /// Write the whole batch or nothing.
    pub bulk: bool,
}

impl AppendMode {
    /// Fill towards the physical end, keep the remainder.
    pub const LINEAR: Self = Self {
        ring: false,
        bulk: false,
    };

    /// Wrap to the front when the physical end is reached.
    pub const RING: Self = Self {
        ring: true,
        bulk: false,
    };

    /// Returns this mode with all-or-nothing writes.
    pub const fn bulk(self) -> Self {
        Self { bulk: true, ..self }
    }
}

/// Footer snapshot of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Read cursor.
    pub start: usize,
    /// Write cursor.
    pub end: usize,
    /// Physical row capacity.
    pub capacity: usize,
    /// Byte offset of the data region.
    pub offset: usize,
    /// Resize generation.
    pub generation: u64,
    /// Number of live rows.
    pub size: usize,
    /// Whether live rows wrap around the physical end.
    pub wrapped: bool,
}

/// Result of [`Segment::resize`].
#[derive(Debug)]
pub enum ResizeOutcome<T: Element> {
    /// The file now has `capacity` rows. Load it again to keep using it.
    Done {
        /// The segment file path.
        path: PathBuf,
        /// The new physical capacity.
        capacity: usize,
    },
    /// The buffer is wrapped; nothing changed and the handle is returned.
    Refused(SegmentWriter<T>),
}

/// An opened file, with or without a ringtail footer.
#[derive(Debug)]
pub enum Loaded<T: Element, M: Mapping> {
    /// A segment with a valid footer.
    Ring(Segment<T, M>),
    /// A plain array file; only raw row access is available.
    Raw(RawArray<T, M>),
}

impl<T: Element, M: Mapping> Loaded<T, M> {
    /// Returns the ring-buffer handle.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::MissingFooter`] for a raw array.
    pub fn into_ring(self) -> Result<Segment<T, M>> {
        match self {
            Self::Ring(segment) => Ok(segment),
            Self::Raw(raw) => Err(FormatError::MissingFooter { path: raw.path }.into()),
        }
    }

    /// Whether the file carries a ringtail footer.
    pub fn is_ring(&self) -> bool {
        matches!(self, Self::Ring(_))
    }

    /// The file path.
    pub fn path(&self) -> &Path {
        match self {
            Self::Ring(segment) => segment.path(),
            Self::Raw(raw) => raw.path(),
        }
    }
}

/// A mapped array file without a ringtail footer.
#[derive(Debug)]
pub struct RawArray<T: Element, M: Mapping> {
    path: PathBuf,
    map: M,
    header: ArrayHeader,
    layout: Layout,
    _rows: PhantomData<T>,
}

impl<T: Element, M: Mapping> RawArray<T, M> {
    /// The file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The decoded array header.
    pub fn header(&self) -> &ArrayHeader {
        &self.header
    }

    /// Number of rows declared by the header.
    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    /// All rows of the array.
    pub fn rows(&self) -> &[T] {
        bytemuck::cast_slice(&self.map.bytes()[self.layout.row_range(0, self.layout.capacity)])
    }
}

impl<T: Element> RawArray<T, ReadWrite> {
    /// All rows of the array, mutable.
    pub fn rows_mut(&mut self) -> &mut [T] {
        let range = self.layout.row_range(0, self.layout.capacity);
        bytemuck::cast_slice_mut(&mut self.map.bytes_mut()[range])
    }
}

/// An open ring-buffer segment.
///
/// `M` selects the mapping mode; see [`SegmentReader`] and [`SegmentWriter`].
#[derive(Debug)]
pub struct Segment<T: Element, M: Mapping> {
    path: PathBuf,
    file: File,
    map: M,
    header: ArrayHeader,
    layout: Layout,
    /// File length when mapped.
    mapped_len: u64,
    /// Trailer generation when mapped.
    generation: u64,
    /// Physical row index of the sequential read cursor.
    pub(crate) tell: usize,
    _rows: PhantomData<T>,
}

impl<T: Element, M: Mapping> Segment<T, M> {
    /// Maps `path`, returning a ring handle or, for files without a ringtail
    /// footer, a raw array.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] for truncated or mismatching files and
    /// [`SegmentIoError`] when the file cannot be opened or mapped.
    pub fn load(path: impl AsRef<Path>) -> Result<Loaded<T, M>> {
        let path = path.as_ref();
        let mapped = map_file::<T, M>(path)?;

        if !mapped.has_footer {
            warn!(path = %path.display(), "no ringtail footer, opening as raw array");
            return Ok(Loaded::Raw(RawArray {
                path: path.to_path_buf(),
                map: mapped.map,
                header: mapped.header,
                layout: mapped.layout,
                _rows: PhantomData,
            }));
        }

        let mapped_len = mapped.map.bytes().len() as u64;
        let mut segment = Self {
            path: path.to_path_buf(),
            file: mapped.file,
            map: mapped.map,
            header: mapped.header,
            layout: mapped.layout,
            mapped_len,
            generation: 0,
            tell: 0,
            _rows: PhantomData,
        };
        segment.generation = load_word(segment.generation_word());
        segment.tell = segment.start();
        Ok(Loaded::Ring(segment))
    }

    /// Opens a segment, failing for files without a ringtail footer.
    ///
    /// # Errors
    ///
    /// As [`load`](Self::load), plus [`FormatError::MissingFooter`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(path)?.into_ring()
    }

    /// The segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The decoded array header.
    pub fn header(&self) -> &ArrayHeader {
        &self.header
    }

    /// Byte geometry of the mapped file.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Physical row capacity.
    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    /// Read cursor.
    pub fn start(&self) -> usize {
        self.cursor(START_WORD)
    }

    /// Write cursor.
    pub fn end(&self) -> usize {
        self.cursor(END_WORD)
    }

    /// Whether no rows are live.
    pub fn is_empty(&self) -> bool {
        let (start, end) = self.cursors();
        start == end
    }

    /// Whether the buffer holds `capacity - 1` rows in ring mode.
    pub fn is_full(&self) -> bool {
        let (start, end) = self.cursors();
        let capacity = self.capacity();
        capacity > 0 && (end + 1) % capacity == start
    }

    /// Whether live rows wrap around the physical end.
    pub fn is_wrapped(&self) -> bool {
        let (start, end) = self.cursors();
        end < start
    }

    /// Number of live rows.
    pub fn size(&self) -> usize {
        let (start, end) = self.cursors();
        live_len(start, end, self.capacity())
    }

    /// Footer snapshot.
    pub fn info(&self) -> SegmentInfo {
        let (start, end) = self.cursors();
        SegmentInfo {
            start,
            end,
            capacity: self.capacity(),
            offset: self.layout.data_offset,
            generation: self.generation,
            size: live_len(start, end, self.capacity()),
            wrapped: end < start,
        }
    }

    /// Fails if the file was resized since this handle mapped it.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] when the file length or the
    /// trailer generation changed, and [`SegmentIoError::ReadFailed`] when the
    /// file cannot be inspected.
    pub fn ensure_fresh(&self) -> Result<()> {
        let file_len = self
            .file
            .metadata()
            .map_err(|e| SegmentIoError::ReadFailed {
                path: self.path.clone(),
                offset: 0,
                source: e,
            })?
            .len();

        // Resizes never shorten a mapped file, but other tools might. Only read
        // the generation word while it is still backed by the file.
        if file_len != self.mapped_len || load_word(self.generation_word()) != self.generation {
            return Err(SegmentError::StaleMapping {
                path: self.path.clone(),
                mapped_len: self.mapped_len,
                mapped_generation: self.generation,
                file_len,
            }
            .into());
        }
        Ok(())
    }

    /// All physical rows, live or not.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn raw(&self) -> Result<&[T]> {
        self.ensure_fresh()?;
        Ok(self.rows())
    }

    /// Live rows in logical order.
    ///
    /// Borrowed when contiguous, copy-concatenated when wrapped.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn data(&self) -> Result<Cow<'_, [T]>> {
        self.ensure_fresh()?;
        let cursors = self.cursors();
        Ok(self.logical_range(cursors, 0, usize::MAX))
    }

    /// Up to `n` rows from the front of the live range.
    ///
    /// Copies only when the result straddles the wrap point.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn head(&self, n: usize) -> Result<Cow<'_, [T]>> {
        self.ensure_fresh()?;
        let cursors = self.cursors();
        Ok(self.logical_range(cursors, 0, n))
    }

    /// Up to `n` rows from the back of the live range.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn tail(&self, n: usize) -> Result<Cow<'_, [T]>> {
        self.ensure_fresh()?;
        let (start, end) = self.cursors();
        let size = live_len(start, end, self.capacity());
        Ok(self.logical_range((start, end), size.saturating_sub(n), size))
    }

    /// The two physical runs of live rows; the second is empty unless wrapped.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn halves(&self) -> Result<(&[T], &[T])> {
        self.ensure_fresh()?;
        let (start, end) = self.cursors();
        let rows = self.rows();
        if end >= start {
            Ok((&rows[start..end], &rows[..0]))
        } else {
            Ok((&rows[start..], &rows[..end]))
        }
    }

    /// Start and end, each loaded once.
    pub(crate) fn cursors(&self) -> (usize, usize) {
        (self.start(), self.end())
    }

    /// Rows `[from, to)` of the live range, offsets relative to `start` and
    /// clamped to its size.
    pub(crate) fn logical_range(
        &self,
        (start, end): (usize, usize),
        from: usize,
        to: usize,
    ) -> Cow<'_, [T]> {
        let rows = self.rows();
        let to = to.min(live_len(start, end, self.capacity()));
        let from = from.min(to);

        if end >= start {
            return Cow::Borrowed(&rows[start + from..start + to]);
        }

        let first = self.capacity() - start;
        if to <= first {
            Cow::Borrowed(&rows[start + from..start + to])
        } else if from >= first {
            Cow::Borrowed(&rows[from - first..to - first])
        } else {
            let mut joined = Vec::with_capacity(to - from);
            joined.extend_from_slice(&rows[start + from..]);
            joined.extend_from_slice(&rows[..to - first]);
            Cow::Owned(joined)
        }
    }

    fn rows(&self) -> &[T] {
        bytemuck::cast_slice(&self.map.bytes()[self.layout.row_range(0, self.layout.capacity)])
    }

    fn cursor(&self, index: usize) -> usize {
        let raw = load_word(self.footer_word(index));
        usize::try_from(raw).map_or(self.layout.capacity, |v| v.min(self.layout.capacity))
    }

    fn footer_word(&self, index: usize) -> &AtomicU64 {
        word_at(&self.map, self.layout.footer_offset() + index * 8)
    }

    fn generation_word(&self) -> &AtomicU64 {
        word_at(&self.map, self.layout.generation_offset())
    }
}

impl<T: Element> Segment<T, ReadWrite> {
    /// Creates (or truncates) a segment holding the first `end` rows of
    /// `rows` with room for `max(capacity, rows.len())` rows.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentIoError`] if the file cannot be written or mapped.
    pub fn create(
        path: impl AsRef<Path>,
        rows: &[T],
        capacity: usize,
        end: Option<usize>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let layout = save(path, rows, capacity, end)?;
        debug!(path = %path.display(), capacity = layout.capacity, "created segment");
        Self::open(path)
    }

    /// Opens `path`, creating an empty segment of `capacity` rows first if it
    /// does not exist. An existing file is left untouched.
    ///
    /// # Errors
    ///
    /// As [`create`](Self::create) and [`open`](Segment::open).
    pub fn create_if_missing(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            save::<T>(path, &[], capacity, None)?;
        }
        Self::open(path)
    }

    /// Appends rows, returning how many did not fit.
    ///
    /// Writes one contiguous run from `end`: towards `capacity` when not
    /// wrapped, towards `start - 1` when wrapped. An empty buffer whose tail
    /// cannot take the batch is reset to the front first. With
    /// [`AppendMode::ring`] a write cursor sitting at `capacity` moves to the
    /// front when `start > 0`. With [`AppendMode::bulk`] a batch that does not
    /// fit entirely is not written at all.
    ///
    /// A non-zero return is not an error. Calling again with the remainder
    /// (the last `n` rows) continues the write; see
    /// [`append_wrapping`](Self::append_wrapping).
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn append(&mut self, rows: &[T], mode: AppendMode) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.ensure_fresh()?;

        let capacity = self.capacity();
        let total = rows.len();
        let (mut start, mut end) = self.cursors();

        if start == end && capacity - end < total && end != 0 {
            start = 0;
            end = 0;
            store_word(self.footer_word(START_WORD), 0);
            store_word(self.footer_word(END_WORD), 0);
        }

        if end == capacity && mode.ring && start > 0 {
            end = 0;
        }

        let available = if end >= start {
            capacity - end
        } else {
            start - 1 - end
        };
        let n = available.min(total);
        if n == 0 || (mode.bulk && n < total) {
            return Ok(total);
        }

        let range = self.layout.row_range(end, end + n);
        self.map.bytes_mut()[range].copy_from_slice(bytemuck::cast_slice(&rows[..n]));
        store_word(self.footer_word(END_WORD), (end + n) as u64);

        Ok(total - n)
    }

    /// Ring insertion across the wrap point: at most two non-bulk
    /// [`append`](Self::append) calls, the second with the remainder.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn append_wrapping(&mut self, rows: &[T]) -> Result<usize> {
        let rest = self.append(rows, AppendMode::RING)?;
        if rest == 0 {
            return Ok(0);
        }
        self.append(&rows[rows.len() - rest..], AppendMode::RING)
    }

    /// Consumes rows from the front.
    ///
    /// Not wrapped: returns `[start, end)` and empties the buffer. Wrapped:
    /// returns `[start, capacity)` and moves `start` to 0, so draining a
    /// wrapped buffer takes two pops. With `copy == false` the result borrows
    /// the mapping.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn pop(&mut self, copy: bool) -> Result<Cow<'_, [T]>> {
        self.ensure_fresh()?;
        let (start, end) = self.cursors();
        let (to, next) = if end >= start {
            (end, end)
        } else {
            (self.capacity(), 0)
        };

        let rows = &self.rows()[start..to];
        let popped = if copy {
            Cow::Owned(rows.to_vec())
        } else {
            Cow::Borrowed(rows)
        };
        store_word(self.footer_word(START_WORD), next as u64);
        Ok(popped)
    }

    /// Pops until empty (at most twice), returning the rows in order.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn drain(&mut self) -> Result<Vec<T>> {
        let mut rows = self.pop(true)?.into_owned();
        if !self.is_empty() {
            rows.extend_from_slice(&self.pop(false)?);
        }
        Ok(rows)
    }

    /// Drops all live rows and moves both cursors to the front.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn clear(&mut self) -> Result<()> {
        self.set_cursors(0, 0)
    }

    /// Overrides both cursors. Used by recovery tooling.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::CursorOutOfRange`] when either cursor exceeds
    /// the capacity, and [`SegmentError::StaleMapping`] after a resize.
    pub fn set_cursors(&mut self, start: usize, end: usize) -> Result<()> {
        self.ensure_fresh()?;
        let capacity = self.capacity();
        if start > capacity || end > capacity {
            return Err(SegmentError::CursorOutOfRange {
                start,
                end,
                capacity,
            }
            .into());
        }
        store_word(self.footer_word(START_WORD), start as u64);
        store_word(self.footer_word(END_WORD), end as u64);
        self.tell = start;
        Ok(())
    }

    /// Live rows as one mutable slice, or `None` when wrapped.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn data_mut(&mut self) -> Result<Option<&mut [T]>> {
        let (first, second) = self.halves_mut()?;
        Ok(if second.is_empty() { Some(first) } else { None })
    }

    /// The two physical runs of live rows, mutable.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] after a resize.
    pub fn halves_mut(&mut self) -> Result<(&mut [T], &mut [T])> {
        self.ensure_fresh()?;
        let (start, end) = self.cursors();
        let range = self.layout.row_range(0, self.layout.capacity);
        let rows: &mut [T] = bytemuck::cast_slice_mut(&mut self.map.bytes_mut()[range]);

        if end >= start {
            let (_, live) = rows.split_at_mut(start);
            Ok((&mut live[..end - start], Default::default()))
        } else {
            let (front, back) = rows.split_at_mut(start);
            Ok((back, &mut front[..end]))
        }
    }

    /// Changes the physical capacity to `max(end, capacity.unwrap_or(end))`.
    ///
    /// Refused while wrapped. The handle is consumed because its mapping no
    /// longer matches the file; every other handle of the file turns stale.
    /// Load the returned path again to continue. Resizing to the current
    /// capacity leaves the file untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] if this handle is already stale,
    /// and [`SegmentIoError`] if rewriting the file fails.
    pub fn resize(self, capacity: Option<usize>) -> Result<ResizeOutcome<T>> {
        self.ensure_fresh()?;
        let (start, end) = self.cursors();
        if end < start {
            debug!(path = %self.path.display(), start, end, "resize refused, segment is wrapped");
            return Ok(ResizeOutcome::Refused(self));
        }

        let new_capacity = capacity.unwrap_or(end).max(end);
        if new_capacity == self.capacity() {
            return Ok(ResizeOutcome::Done {
                path: self.path,
                capacity: new_capacity,
            });
        }

        let footer = Footer::new(start as u64, end as u64, self.layout.data_offset as u64);
        let generation = self.generation + 1;
        resize_file::<T>(
            &self.path,
            &self.layout,
            self.map.bytes(),
            &footer,
            new_capacity,
            generation,
        )?;

        // The replaced inode stays alive for whoever still maps it; moving its
        // generation tells them to reload.
        store_word(self.generation_word(), generation);
        let Self { path, layout, .. } = self;
        debug!(
            path = %path.display(),
            from = layout.capacity,
            to = new_capacity,
            generation,
            "resized segment"
        );

        Ok(ResizeOutcome::Done {
            path,
            capacity: new_capacity,
        })
    }

    /// Appends all live rows of `other`, growing this segment if needed, and
    /// deletes `other`'s file on success.
    ///
    /// Returns the (possibly reloaded) handle and whether the merge happened.
    /// On `false` both files are left as they were, apart from a capacity
    /// increase of this one.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::StaleMapping`] if either handle is stale, and
    /// [`SegmentIoError`] on I/O failure.
    pub fn merge(self, other: SegmentReader<T>) -> Result<(Self, bool)> {
        self.ensure_fresh()?;
        let incoming = other.data()?.into_owned();

        let needed = self.end() + incoming.len();
        let mut merged = if needed > self.capacity() && !self.is_wrapped() {
            match self.resize(Some(needed))? {
                ResizeOutcome::Done { path, .. } => Self::open(&path)?,
                ResizeOutcome::Refused(segment) => segment,
            }
        } else {
            self
        };

        if merged.append(&incoming, AppendMode::LINEAR.bulk())? != 0 {
            return Ok((merged, false));
        }

        let other_path = other.path.clone();
        drop(other);
        fs::remove_file(&other_path).map_err(|e| SegmentIoError::FileOp {
            path: other_path.clone(),
            source: e,
        })?;
        debug!(into = %merged.path.display(), from = %other_path.display(), rows = incoming.len(), "merged segment");

        Ok((merged, true))
    }

    /// Renames the file; the mapping stays valid.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentIoError::FileOp`] if the rename fails.
    pub fn rename(&mut self, to: impl AsRef<Path>) -> Result<()> {
        let to = to.as_ref();
        fs::rename(&self.path, to).map_err(|e| SegmentIoError::FileOp {
            path: self.path.clone(),
            source: e,
        })?;
        self.path = to.to_path_buf();
        Ok(())
    }

    /// Flushes the mapping to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentIoError::SyncFailed`] if the flush fails.
    pub fn sync(&self) -> Result<()> {
        self.map.flush().map_err(|e| {
            SegmentIoError::SyncFailed {
                path: self.path.clone(),
                source: e,
            }
            .into()
        })
    }

    /// Unmaps and deletes the file.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentIoError::FileOp`] if the file cannot be removed.
    pub fn remove(self) -> Result<()> {
        let Self { path, file, map, .. } = self;
        drop(map);
        drop(file);
        fs::remove_file(&path).map_err(|e| SegmentIoError::FileOp {
            path: path.clone(),
            source: e,
        })?;
        info!(path = %path.display(), "removed segment");
        Ok(())
    }
}

/// Number of live rows for the given cursors.
#[inline]
pub(crate) fn live_len(start: usize, end: usize, capacity: usize) -> usize {
    if end >= start {
        end - start
    } else {
        capacity - (start - end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(dir: &Path, name: &str, rows: &[u64], capacity: usize) -> SegmentWriter<u64> {
        SegmentWriter::create(dir.join(name), rows, capacity, None).unwrap()
    }

    #[test]
    fn test_create_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let seg = writer(dir.path(), "a.seg", &[1, 2, 3], 8);

        assert_eq!(seg.capacity(), 8);
        assert_eq!((seg.start(), seg.end()), (0, 3));
        assert_eq!(seg.data().unwrap().as_ref(), &[1, 2, 3]);

        let reader = SegmentReader::<u64>::open(seg.path()).unwrap();
        assert_eq!(reader.data().unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(reader.raw().unwrap(), &[1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_append_fills_six() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[], 6);

        assert_eq!(seg.append(&[1, 2, 3, 4, 5, 6], AppendMode::RING).unwrap(), 0);
        assert_eq!(seg.head(4).unwrap().as_ref(), &[1, 2, 3, 4]);
        assert_eq!(seg.tail(4).unwrap().as_ref(), &[3, 4, 5, 6]);

        seg.set_cursors(4, 2).unwrap();
        assert_eq!(seg.head(4).unwrap().as_ref(), &[5, 6, 1, 2]);
        assert_eq!(seg.tail(4).unwrap().as_ref(), &[5, 6, 1, 2]);
    }

    #[test]
    fn test_head_tail_wrapped_borrow_when_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1, 2, 3, 4, 5, 6], 6);
        seg.set_cursors(4, 2).unwrap();

        assert!(matches!(seg.head(2).unwrap(), Cow::Borrowed(&[5, 6])));
        assert!(matches!(seg.tail(2).unwrap(), Cow::Borrowed(&[1, 2])));
        assert!(matches!(seg.head(3).unwrap(), Cow::Owned(_)));
        assert_eq!(seg.head(100).unwrap().as_ref(), &[5, 6, 1, 2]);

        seg.set_cursors(4, 0).unwrap();
        assert_eq!(seg.head(4).unwrap().as_ref(), &[5, 6]);
        assert_eq!(seg.tail(4).unwrap().as_ref(), &[5, 6]);
    }

    #[test]
    fn test_size_matches_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1, 2, 3, 4, 5, 6], 6);

        for (start, end) in [(0, 0), (0, 6), (2, 5), (4, 2), (5, 0), (3, 3)] {
            seg.set_cursors(start, end).unwrap();
            assert_eq!(seg.size(), seg.data().unwrap().len());
            assert_eq!(seg.size() == 0, seg.start() == seg.end());
        }
    }

    #[test]
    fn test_bulk_append_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let rows = [1, 2, 3, 4, 5, 6];
        let mut seg = writer(dir.path(), "a.seg", &rows, 10);

        assert_eq!(seg.append(&rows, AppendMode::LINEAR.bulk()).unwrap(), 6);
        assert_eq!(seg.end(), 6);

        assert_eq!(seg.append(&rows[2..], AppendMode::LINEAR.bulk()).unwrap(), 0);
        assert_eq!(seg.end(), 10);
        assert_eq!(seg.append(&rows[5..], AppendMode::LINEAR).unwrap(), 1);
    }

    #[test]
    fn test_partial_append_returns_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1, 2, 3], 5);

        assert_eq!(seg.append(&[4, 5, 6, 7], AppendMode::LINEAR).unwrap(), 2);
        assert_eq!(seg.data().unwrap().as_ref(), &[1, 2, 3, 4, 5]);
        assert_eq!(seg.append(&[], AppendMode::LINEAR).unwrap(), 0);
    }

    #[test]
    fn test_empty_buffer_resets_to_front() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1, 2, 3, 4], 6);
        seg.pop(false).unwrap();
        assert_eq!((seg.start(), seg.end()), (4, 4));

        assert_eq!(seg.append(&[7, 8, 9], AppendMode::LINEAR).unwrap(), 0);
        assert_eq!((seg.start(), seg.end()), (0, 3));
        assert_eq!(seg.data().unwrap().as_ref(), &[7, 8, 9]);
    }

    #[test]
    fn test_wrapping_append_then_pop_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[0, 0, 0, 1, 2], 6);
        seg.set_cursors(3, 5).unwrap();

        assert_eq!(seg.append_wrapping(&[3, 4, 5]).unwrap(), 0);
        assert!(seg.is_wrapped());
        assert!(seg.is_full());
        assert_eq!(seg.size(), 5);

        let first = seg.pop(true).unwrap().into_owned();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(seg.start(), 0);
        let second = seg.pop(true).unwrap().into_owned();
        assert_eq!(second, vec![4, 5]);
        assert!(seg.is_empty());

        // Full: nothing more fits.
        seg.set_cursors(3, 2).unwrap();
        assert_eq!(seg.append_wrapping(&[9]).unwrap(), 1);
    }

    #[test]
    fn test_drain_concatenates_halves() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1, 2, 3, 4, 5, 6], 6);
        seg.set_cursors(4, 2).unwrap();

        assert_eq!(seg.drain().unwrap(), vec![5, 6, 1, 2]);
        assert!(seg.is_empty());
    }

    #[test]
    fn test_halves_mut_edits_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1, 2, 3, 4, 5, 6], 6);
        seg.set_cursors(4, 2).unwrap();
        assert!(seg.data_mut().unwrap().is_none());

        let (first, second) = seg.halves_mut().unwrap();
        first[0] = 50;
        second[1] = 20;
        assert_eq!(seg.data().unwrap().as_ref(), &[50, 6, 1, 20]);

        seg.set_cursors(1, 3).unwrap();
        let live = seg.data_mut().unwrap().unwrap();
        live.copy_from_slice(&[0, 0]);
        assert_eq!(seg.raw().unwrap(), &[1, 0, 0, 4, 50, 6]);
    }

    #[test]
    fn test_set_cursors_rejects_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1, 2], 4);

        assert!(seg.set_cursors(5, 0).is_err());
        assert!(seg.set_cursors(0, 4).is_ok());
    }

    #[test]
    fn test_resize_truncates_and_grows() {
        let dir = tempfile::tempdir().unwrap();
        let seg = writer(dir.path(), "a.seg", &[1, 2, 3, 4, 5, 6], 10);
        let path = seg.path().to_path_buf();

        let ResizeOutcome::Done { capacity, .. } = seg.resize(None).unwrap() else {
            panic!("resize refused");
        };
        assert_eq!(capacity, 6);
        let first_bytes = fs::read(&path).unwrap();

        // Idempotent: a second truncation leaves the bytes untouched.
        let seg = SegmentWriter::<u64>::open(&path).unwrap();
        seg.resize(None).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first_bytes);

        // Never below the live boundary.
        let seg = SegmentWriter::<u64>::open(&path).unwrap();
        let ResizeOutcome::Done { capacity, .. } = seg.resize(Some(2)).unwrap() else {
            panic!("resize refused");
        };
        assert_eq!(capacity, 6);

        let seg = SegmentWriter::<u64>::open(&path).unwrap();
        seg.resize(Some(8)).unwrap();
        let mut seg = SegmentWriter::<u64>::open(&path).unwrap();
        assert_eq!(seg.capacity(), 8);
        assert_eq!(seg.info().generation, 2);
        assert_eq!(seg.append(&[7, 8], AppendMode::LINEAR).unwrap(), 0);
        assert_eq!(seg.data().unwrap().as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_resize_refused_when_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1, 2, 3, 4, 5, 6], 6);
        seg.set_cursors(4, 2).unwrap();

        let ResizeOutcome::Refused(seg) = seg.resize(Some(12)).unwrap() else {
            panic!("resize of wrapped segment succeeded");
        };
        assert_eq!(seg.capacity(), 6);
        assert_eq!(seg.data().unwrap().as_ref(), &[5, 6, 1, 2]);
    }

    #[test]
    fn test_resize_makes_other_handles_stale() {
        let dir = tempfile::tempdir().unwrap();
        let seg = writer(dir.path(), "a.seg", &[1, 2, 3], 4);
        let reader = SegmentReader::<u64>::open(seg.path()).unwrap();
        assert!(reader.ensure_fresh().is_ok());

        seg.resize(Some(16)).unwrap();

        let err = reader.data().unwrap_err();
        assert!(err.is_stale());
        assert!(reader.ensure_fresh().unwrap_err().is_stale());
    }

    #[test]
    fn test_stale_handle_keeps_last_cursors_after_shrink() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1, 2, 3, 4], 50_000);
        seg.set_cursors(1, 4).unwrap();
        let reader = SegmentReader::<u64>::open(seg.path()).unwrap();

        seg.resize(None).unwrap();

        assert!(reader.ensure_fresh().unwrap_err().is_stale());
        assert_eq!(reader.capacity(), 50_000);
        assert_eq!(reader.size(), 3);
        assert_eq!(reader.info().start, 1);
        assert_eq!(SegmentReader::<u64>::open(reader.path()).unwrap().capacity(), 4);
    }

    #[test]
    fn test_merge_grows_and_removes_other() {
        let dir = tempfile::tempdir().unwrap();
        let seg = writer(dir.path(), "a.seg", &[1, 2, 3], 3);
        let other = writer(dir.path(), "b.seg", &[4, 5], 4);
        let other_path = other.path().to_path_buf();
        drop(other);

        let other = SegmentReader::<u64>::open(&other_path).unwrap();
        let (seg, merged) = seg.merge(other).unwrap();

        assert!(merged);
        assert!(!other_path.exists());
        assert_eq!(seg.data().unwrap().as_ref(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_merge_into_wrapped_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1, 2, 3, 4], 4);
        seg.set_cursors(2, 1).unwrap();
        let other = writer(dir.path(), "b.seg", &[9, 9], 2);
        let other_path = other.path().to_path_buf();
        drop(other);

        let other = SegmentReader::<u64>::open(&other_path).unwrap();
        let (seg, merged) = seg.merge(other).unwrap();

        assert!(!merged);
        assert!(other_path.exists());
        assert_eq!(seg.data().unwrap().as_ref(), &[3, 4, 1]);
    }

    #[test]
    fn test_raw_mode_without_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.npy");
        let mut bytes = ArrayHeader::new(u64::descr(), 3, &[]).encode().unwrap();
        bytes.extend_from_slice(bytemuck::cast_slice(&[7u64, 8, 9]));
        fs::write(&path, &bytes).unwrap();

        let loaded = SegmentReader::<u64>::load(&path).unwrap();
        assert!(!loaded.is_ring());
        let Loaded::Raw(raw) = loaded else {
            panic!("expected raw array");
        };
        assert_eq!(raw.rows(), &[7, 8, 9]);

        let err = SegmentReader::<u64>::open(&path).unwrap_err();
        assert!(matches!(
            err,
            crate::RingtailError::Format(FormatError::MissingFooter { .. })
        ));
    }

    #[test]
    fn test_corrupted_footer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let seg = writer(dir.path(), "a.seg", &[1, 2], 4);
        let path = seg.path().to_path_buf();
        drop(seg);

        // Append junk so the footer is no longer where the header says.
        let mut bytes = fs::read(&path).unwrap();
        let footer = bytes.split_off(bytes.len() - 32);
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&footer);
        fs::write(&path, &bytes).unwrap();

        let err = SegmentReader::<u64>::open(&path).unwrap_err();
        assert!(err.to_string().contains("corrupted"));
    }

    #[test]
    fn test_rename_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = writer(dir.path(), "a.seg", &[1], 2);
        let to = dir.path().join("b.mseg");

        seg.rename(&to).unwrap();
        assert_eq!(seg.path(), to.as_path());
        assert!(!dir.path().join("a.seg").exists());
        seg.sync().unwrap();

        seg.remove().unwrap();
        assert!(!to.exists());
    }

    #[test]
    fn test_create_if_missing_keeps_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.seg");
        drop(writer(dir.path(), "a.seg", &[4, 5], 4));

        let seg = SegmentWriter::<u64>::create_if_missing(&path, 100).unwrap();
        assert_eq!(seg.capacity(), 4);
        assert_eq!(seg.data().unwrap().as_ref(), &[4, 5]);

        let fresh = SegmentWriter::<u64>::create_if_missing(dir.path().join("b.seg"), 3).unwrap();
        assert!(fresh.is_empty());
        assert_eq!(fresh.capacity(), 3);
    }
}
