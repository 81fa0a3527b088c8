//! On-disk layout of a segment file.
//!
//! # File Format
//!
//! ```text
//! [0..H)            NPY header (see `header`), H % 64 == 0
//! [H..D)            data region: capacity * row_bytes, row-major
//! [D..G)            zero padding up to an 8-byte boundary
//! [G..G+8)          generation word (bumped by every resize)
//! [G+8..G+40)       footer: start, end, offset, magic (u64 LE each)
//! ```
//!
//! The footer is always the last 32 bytes of the file. Generic NPY readers
//! stop at `D` and never see the trailer. A file whose last word is not
//! [`FOOTER_MAGIC`] is still readable as a raw array.
//!
//! # Safety
//!
//! Footer and generation words are accessed as `AtomicU64` views into the
//! shared mapping. The trailer starts on an 8-byte file offset and mappings
//! are page aligned, so every word is naturally aligned.
//!
//! A mapped file is never shortened in place: [`resize_file`] writes a
//! replacement and renames it over the segment, so no mapping ever covers
//! pages past the end of its file.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Mmap, MmapMut};

use crate::element::{Element, normalize_descr, row_bytes};
use crate::error::{FormatError, Result, SegmentIoError};
use crate::header::ArrayHeader;

/// Magic word identifying a ringtail footer.
pub const FOOTER_MAGIC: u64 = u64::from_le_bytes(*b"RTAIL\0\0\x01");

/// Number of u64 words in the footer.
pub const FOOTER_WORDS: usize = 4;

/// Size of the footer in bytes.
pub const FOOTER_SIZE: usize = FOOTER_WORDS * 8;

/// Size of the generation word preceding the footer.
const GENERATION_SIZE: usize = 8;

/// Alignment of the trailer within the file.
const TRAILER_ALIGN: usize = 8;

/// Footer word indices.
pub(crate) const START_WORD: usize = 0;
pub(crate) const END_WORD: usize = 1;

/// Snapshot of a segment's control footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Read cursor (row index).
    pub start: u64,
    /// Write cursor (row index).
    pub end: u64,
    /// Byte offset of the data region.
    pub offset: u64,
    /// Format magic, [`FOOTER_MAGIC`] for valid segments.
    pub magic: u64,
}

impl Footer {
    /// Creates a footer carrying the ringtail magic.
    pub fn new(start: u64, end: u64, offset: u64) -> Self {
        Self {
            start,
            end,
            offset,
            magic: FOOTER_MAGIC,
        }
    }

    /// Encodes the footer as four little-endian words.
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut out = [0u8; FOOTER_SIZE];
        for (chunk, word) in out
            .chunks_exact_mut(8)
            .zip([self.start, self.end, self.offset, self.magic])
        {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Decodes a footer from the last 32 bytes of a file.
    pub fn from_bytes(bytes: &[u8; FOOTER_SIZE]) -> Self {
        let mut words = [0u64; FOOTER_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        Self {
            start: words[0],
            end: words[1],
            offset: words[2],
            magic: words[3],
        }
    }

    /// Whether the magic identifies a ringtail footer.
    pub fn is_valid(&self) -> bool {
        self.magic == FOOTER_MAGIC
    }
}

/// Byte geometry of a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Start of the data region (header length).
    pub data_offset: usize,
    /// Size of one row in bytes.
    pub row_bytes: usize,
    /// Physical row capacity.
    pub capacity: usize,
}

impl Layout {
    /// Layout for `capacity` rows of `T` behind a header of `data_offset` bytes.
    pub fn new<T: Element>(data_offset: usize, capacity: usize) -> Self {
        Self {
            data_offset,
            row_bytes: row_bytes::<T>(),
            capacity,
        }
    }

    /// End of the data region.
    pub fn data_end(&self) -> usize {
        data_bytes(self.row_bytes, self.capacity, self.data_offset)
    }

    /// Offset of the generation word.
    pub fn generation_offset(&self) -> usize {
        self.data_end().next_multiple_of(TRAILER_ALIGN)
    }

    /// Offset of the first footer word.
    pub fn footer_offset(&self) -> usize {
        self.generation_offset() + GENERATION_SIZE
    }

    /// Total file length.
    pub fn file_len(&self) -> usize {
        self.footer_offset() + FOOTER_SIZE
    }

    /// Byte range of physical rows `[from, to)`.
    pub fn row_range(&self, from: usize, to: usize) -> std::ops::Range<usize> {
        self.data_offset + from * self.row_bytes..self.data_offset + to * self.row_bytes
    }
}

/// End of the data region for `capacity` rows of `row_bytes` each, starting at
/// byte `offset`.
#[inline]
pub fn data_bytes(row_bytes: usize, capacity: usize, offset: usize) -> usize {
    offset + capacity * row_bytes
}

mod sealed {
    pub trait Sealed {}
}

/// Access mode of a memory-mapped segment.
///
/// Implemented by [`ReadOnly`] and [`ReadWrite`] only. Read-write handles are
/// not `Clone`, so a process holds at most one writable view per handle it
/// opened; cross-process exclusivity remains the caller's discipline.
pub trait Mapping: sealed::Sealed + Send + Sync + Sized + 'static {
    /// Whether the mapping may be written.
    const WRITABLE: bool;

    /// Opens `path` with the permissions this mode needs.
    #[doc(hidden)]
    fn open_file(path: &Path) -> std::io::Result<File>;

    /// Maps the whole file.
    #[doc(hidden)]
    fn map(file: &File) -> std::io::Result<Self>;

    /// Mapped bytes.
    fn bytes(&self) -> &[u8];
}

/// Read-only shared mapping.
#[derive(Debug)]
pub struct ReadOnly(Mmap);

/// Read-write shared mapping.
#[derive(Debug)]
pub struct ReadWrite(MmapMut);

impl sealed::Sealed for ReadOnly {}
impl sealed::Sealed for ReadWrite {}

impl Mapping for ReadOnly {
    const WRITABLE: bool = false;

    fn open_file(path: &Path) -> std::io::Result<File> {
        OpenOptions::new().read(true).open(path)
    }

    fn map(file: &File) -> std::io::Result<Self> {
        // SAFETY: Segment files are shared between processes by design. The
        // single-writer discipline means the only concurrent mutation is the
        // writer appending rows and publishing cursors, which readers observe
        // through atomic footer loads.
        unsafe { Mmap::map(file) }.map(Self)
    }

    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Mapping for ReadWrite {
    const WRITABLE: bool = true;

    fn open_file(path: &Path) -> std::io::Result<File> {
        OpenOptions::new().read(true).write(true).open(path)
    }

    fn map(file: &File) -> std::io::Result<Self> {
        // SAFETY: See `ReadOnly::map`. At most one process writes a segment.
        unsafe { MmapMut::map_mut(file) }.map(Self)
    }

    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl ReadWrite {
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub(crate) fn flush(&self) -> std::io::Result<()> {
        self.0.flush()
    }
}

/// Returns the atomic word at byte `offset` of the mapping.
///
/// `offset` must be 8-byte aligned and at least 8 bytes before the end of the
/// mapping; both are established when the segment is loaded.
pub(crate) fn word_at<M: Mapping>(map: &M, offset: usize) -> &AtomicU64 {
    let bytes = map.bytes();
    debug_assert!(offset + 8 <= bytes.len());
    debug_assert_eq!((bytes.as_ptr() as usize + offset) % 8, 0);
    // SAFETY: The caller passes an in-bounds, 8-byte aligned offset into a
    // live mapping; the returned reference borrows `map`, so the mapping
    // outlives it. AtomicU64 has the same layout as u64 and every bit
    // pattern is valid. Stores only happen through read-write mappings.
    unsafe { &*bytes.as_ptr().add(offset).cast::<AtomicU64>() }
}

/// Loads a little-endian footer word with acquire ordering.
#[inline]
pub(crate) fn load_word(word: &AtomicU64) -> u64 {
    u64::from_le(word.load(Ordering::Acquire))
}

/// Stores a little-endian footer word with release ordering.
#[inline]
pub(crate) fn store_word(word: &AtomicU64, value: u64) {
    word.store(value.to_le(), Ordering::Release);
}

/// A file opened and mapped, with its header validated against `T`.
#[derive(Debug)]
pub(crate) struct MappedFile<M> {
    pub file: File,
    pub map: M,
    pub header: ArrayHeader,
    pub layout: Layout,
    pub has_footer: bool,
}

/// Opens and maps a segment file, validating the header against `T`.
///
/// A missing or foreign footer is not an error; `has_footer` reports it.
///
/// # Errors
///
/// Fails with [`FormatError`] when the file is truncated, its header is
/// invalid, or its element type differs from `T`, and with
/// [`SegmentIoError`] when it cannot be opened or mapped.
pub(crate) fn map_file<T: Element, M: Mapping>(path: &Path) -> Result<MappedFile<M>> {
    let file = M::open_file(path).map_err(|e| SegmentIoError::ReadFailed {
        path: path.to_path_buf(),
        offset: 0,
        source: e,
    })?;
    let len = file
        .metadata()
        .map_err(|e| SegmentIoError::ReadFailed {
            path: path.to_path_buf(),
            offset: 0,
            source: e,
        })?
        .len();

    // Too short for any header; mapping an empty file fails on some platforms.
    if len < 16 {
        return Err(FormatError::Truncated {
            path: path.to_path_buf(),
            len,
            expected: 16,
        }
        .into());
    }

    let map = M::map(&file).map_err(|e| SegmentIoError::MapFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    let bytes = map.bytes();

    let (header, data_offset) = ArrayHeader::parse(bytes, path)?;
    if header.fortran_order && header.shape.len() > 1 {
        return Err(FormatError::InvalidHeader {
            path: path.to_path_buf(),
            reason: "column-major arrays are not supported".to_string(),
        }
        .into());
    }
    if normalize_descr(&header.descr) != normalize_descr(&T::descr())
        || header.sub_shape() != T::sub_shape().as_slice()
    {
        return Err(FormatError::ElementMismatch {
            path: path.to_path_buf(),
            expected: T::descr(),
            expected_shape: T::sub_shape(),
            found: header.descr.clone(),
            found_shape: header.sub_shape().to_vec(),
        }
        .into());
    }

    let layout = Layout::new::<T>(data_offset, header.capacity());
    if (bytes.as_ptr() as usize + data_offset) % std::mem::align_of::<T>() != 0 {
        return Err(FormatError::Misaligned {
            path: path.to_path_buf(),
            offset: data_offset as u64,
            align: std::mem::align_of::<T>(),
        }
        .into());
    }
    if bytes.len() < layout.data_end() {
        return Err(FormatError::Truncated {
            path: path.to_path_buf(),
            len,
            expected: layout.data_end() as u64,
        }
        .into());
    }

    let has_footer = match bytes.len().checked_sub(FOOTER_SIZE) {
        Some(at) if at >= layout.data_end() => {
            let mut raw = [0u8; FOOTER_SIZE];
            raw.copy_from_slice(&bytes[at..]);
            let footer = Footer::from_bytes(&raw);
            if footer.is_valid() {
                validate_footer(path, &footer, &layout, bytes.len())?;
            }
            footer.is_valid()
        }
        _ => false,
    };

    Ok(MappedFile {
        file,
        map,
        header,
        layout,
        has_footer,
    })
}

/// Checks a footer carrying the ringtail magic against the header geometry.
fn validate_footer(path: &Path, footer: &Footer, layout: &Layout, len: usize) -> Result<()> {
    let corrupted = |reason: String| FormatError::CorruptedFooter {
        path: path.to_path_buf(),
        reason,
    };

    if len != layout.file_len() {
        return Err(corrupted(format!(
            "file is {len} bytes, layout requires {}",
            layout.file_len()
        ))
        .into());
    }
    if footer.offset != layout.data_offset as u64 {
        return Err(corrupted(format!(
            "footer offset {} does not match header length {}",
            footer.offset, layout.data_offset
        ))
        .into());
    }
    let capacity = layout.capacity as u64;
    if footer.start > capacity || footer.end > capacity {
        return Err(corrupted(format!(
            "cursors ({}, {}) exceed capacity {capacity}",
            footer.start, footer.end
        ))
        .into());
    }
    Ok(())
}

/// Writes the generation word and footer at the layout's trailer position.
///
/// # Errors
///
/// Returns [`SegmentIoError::WriteFailed`] if seeking or writing fails.
pub fn write_footer(
    file: &mut File,
    path: &Path,
    layout: &Layout,
    footer: &Footer,
    generation: u64,
) -> Result<()> {
    let offset = layout.generation_offset() as u64;
    let write_failed = |e| SegmentIoError::WriteFailed {
        path: path.to_path_buf(),
        offset,
        source: e,
    };

    let mut trailer = [0u8; GENERATION_SIZE + FOOTER_SIZE];
    trailer[..GENERATION_SIZE].copy_from_slice(&generation.to_le_bytes());
    trailer[GENERATION_SIZE..].copy_from_slice(&footer.to_bytes());

    file.seek(SeekFrom::Start(offset)).map_err(write_failed)?;
    file.write_all(&trailer).map_err(write_failed)?;
    Ok(())
}

/// Creates (or truncates) a segment file holding the first `end` rows of
/// `rows`.
///
/// The capacity is `max(capacity, rows.len())`; `end` defaults to
/// `rows.len()` and is clamped to it. Rows past `end` are zero.
///
/// # Errors
///
/// Returns [`SegmentIoError::WriteFailed`] on any I/O failure and
/// [`FormatError::HeaderTooLarge`] for unrepresentable element types.
pub fn save<T: Element>(path: &Path, rows: &[T], capacity: usize, end: Option<usize>) -> Result<Layout> {
    let end = end.unwrap_or(rows.len()).min(rows.len());
    let capacity = capacity.max(rows.len());
    let header = ArrayHeader::new(T::descr(), capacity, &T::sub_shape()).encode()?;
    let layout = Layout::new::<T>(header.len(), capacity);

    let write_failed = |offset: usize| {
        let path = path.to_path_buf();
        move |e| SegmentIoError::WriteFailed {
            path,
            offset: offset as u64,
            source: e,
        }
    };

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(write_failed(0))?;

    file.write_all(&header).map_err(write_failed(0))?;
    file.write_all(bytemuck::cast_slice(&rows[..end]))
        .map_err(write_failed(layout.data_offset))?;
    file.set_len(layout.file_len() as u64)
        .map_err(write_failed(layout.data_end()))?;
    write_footer(
        &mut file,
        path,
        &layout,
        &Footer::new(0, end as u64, layout.data_offset as u64),
        0,
    )?;
    file.flush().map_err(write_failed(layout.file_len()))?;

    Ok(layout)
}

/// Extension of the replacement file written by [`resize_file`].
const STAGING_EXT: &str = "resize";

/// Replaces a segment file with a copy at a new capacity.
///
/// The rows `[0, footer.end)` are copied from `data` (the bytes of the
/// current file) into a sibling file with the new header, zero fill and
/// trailer, which is then renamed over `path`. Rows keep their physical
/// positions. The old inode is never truncated, so mappings of it stay
/// valid until their owners notice the new generation and reload.
///
/// # Errors
///
/// Returns [`SegmentIoError`] on I/O failure; the replacement file is
/// removed and `path` is left as it was.
pub fn resize_file<T: Element>(
    path: &Path,
    old: &Layout,
    data: &[u8],
    footer: &Footer,
    new_capacity: usize,
    generation: u64,
) -> Result<Layout> {
    let header = ArrayHeader::new(T::descr(), new_capacity, &T::sub_shape()).encode()?;
    let layout = Layout::new::<T>(header.len(), new_capacity);
    let staging = path.with_extension(STAGING_EXT);

    let written = write_replacement(&staging, &header, &layout, old, data, footer, generation)
        .and_then(|()| {
            fs::rename(&staging, path).map_err(|e| {
                SegmentIoError::FileOp {
                    path: staging.clone(),
                    source: e,
                }
                .into()
            })
        });
    if written.is_err() {
        let _ = fs::remove_file(&staging);
    }
    written.map(|()| layout)
}

fn write_replacement(
    staging: &Path,
    header: &[u8],
    layout: &Layout,
    old: &Layout,
    data: &[u8],
    footer: &Footer,
    generation: u64,
) -> Result<()> {
    let write_failed = |offset: usize| {
        let path = staging.to_path_buf();
        move |e| SegmentIoError::WriteFailed {
            path,
            offset: offset as u64,
            source: e,
        }
    };

    let end = usize::try_from(footer.end).map_or(layout.capacity, |e| e.min(layout.capacity));
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(staging)
        .map_err(write_failed(0))?;

    file.write_all(header).map_err(write_failed(0))?;
    file.write_all(&data[old.row_range(0, end.min(old.capacity))])
        .map_err(write_failed(layout.data_offset))?;
    file.set_len(layout.file_len() as u64)
        .map_err(write_failed(layout.data_end()))?;
    write_footer(
        &mut file,
        staging,
        layout,
        &Footer::new(footer.start, footer.end, layout.data_offset as u64),
        generation,
    )?;
    file.sync_data().map_err(write_failed(layout.file_len()))?;
    Ok(())
}
