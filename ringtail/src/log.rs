//! Unbounded append-only log built from rotating segment files.
//!
//! A log is a directory of segments named by their creation timestamp in
//! nanoseconds. A fixed-length [`RotationQueue`] lists the active ones,
//! oldest first. When the newest segment is full the writer creates the next
//! one; once the queue is full, the oldest segment leaves it and is truncated
//! to its live rows. Retired segments stay on disk as history until
//! [`merge`](SegmentLog::merge) consolidates them.
//!
//! # File Layout
//!
//! ```text
//! log_dir/
//! ├── meta.json                 <- version, element type, config
//! ├── .lock                     <- rotation queue (queue_len u64 slots)
//! ├── 1718000000000000000.seg   <- segments, one per timestamp
//! ├── 1718000000000000001.seg
//! └── 1717000000000000000.mseg  <- consolidated history
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ringtail::{LogConfig, LogReader, LogWriter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut log = LogWriter::<u64>::open("./ticks", LogConfig::new(1024, 4)?)?;
//! log.append(&[1, 2, 3])?;
//!
//! // Another process tails the same log.
//! let mut reader = LogReader::<u64>::open_read_only("./ticks")?;
//! let rows = reader.read(100, 0)?;
//! assert_eq!(rows, vec![1, 2, 3]);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::element::{Element, normalize_descr};
use crate::error::{LogError, Result};
use crate::format::{Mapping, ReadOnly, ReadWrite};
use crate::queue::RotationQueue;
use crate::segment::{AppendMode, ResizeOutcome, Segment, SegmentReader, SegmentWriter};

/// Metadata file format version.
const METADATA_VERSION: u32 = 1;

/// Name of the metadata file in the log directory.
pub const METADATA_FILE: &str = "meta.json";

/// Name of the rotation queue file in the log directory.
pub const QUEUE_FILE: &str = ".lock";

/// Extension of segment files.
pub const SEGMENT_EXT: &str = "seg";

/// Extension of consolidated history files.
pub const MERGED_EXT: &str = "mseg";

/// The writing end of a log.
pub type LogWriter<T> = SegmentLog<T, ReadWrite>;

/// A read-only view of a log.
pub type LogReader<T> = SegmentLog<T, ReadOnly>;

/// Metadata stored in the log's meta.json file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Metadata format version.
    pub version: u32,
    /// Element descriptor of every segment.
    pub descr: String,
    /// Per-row shape of every segment.
    pub sub_shape: Vec<usize>,
    /// Log sizing.
    pub config: LogConfig,
}

impl LogMetadata {
    fn for_element<T: Element>(config: LogConfig) -> Self {
        Self {
            version: METADATA_VERSION,
            descr: T::descr(),
            sub_shape: T::sub_shape(),
            config,
        }
    }

    /// Reads `meta.json` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::DirectoryAccess`] if the file cannot be read,
    /// [`LogError::MetadataSerialize`] if it is not valid JSON and
    /// [`LogError::CorruptedMetadata`] for an unknown version.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let json = fs::read_to_string(&path).map_err(|e| LogError::DirectoryAccess {
            path: path.clone(),
            source: e,
        })?;
        let meta: Self = serde_json::from_str(&json).map_err(LogError::from)?;
        if meta.version != METADATA_VERSION {
            return Err(LogError::CorruptedMetadata {
                reason: format!(
                    "unsupported version {}, expected {METADATA_VERSION}",
                    meta.version
                ),
            }
            .into());
        }
        meta.config.validate()?;
        Ok(meta)
    }

    fn store(&self, dir: &Path) -> Result<()> {
        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(self).map_err(LogError::from)?;
        fs::write(&path, json).map_err(|e| LogError::DirectoryAccess { path, source: e })?;
        Ok(())
    }

    /// Fails unless the stored element type is `T`.
    fn check_element<T: Element>(&self) -> Result<()> {
        if normalize_descr(&self.descr) != normalize_descr(&T::descr()) {
            return Err(LogError::MetadataMismatch {
                field: "descr",
                stored: self.descr.clone(),
                requested: T::descr(),
            }
            .into());
        }
        if self.sub_shape != T::sub_shape() {
            return Err(LogError::MetadataMismatch {
                field: "sub_shape",
                stored: format!("{:?}", self.sub_shape),
                requested: format!("{:?}", T::sub_shape()),
            }
            .into());
        }
        Ok(())
    }
}

/// A log of rows of type `T` spread over rotating segment files.
///
/// `M` is the access mode: [`LogWriter`] appends, [`LogReader`] only reads.
/// Both keep their own sequential read position.
#[derive(Debug)]
pub struct SegmentLog<T: Element, M: Mapping> {
    dir: PathBuf,
    config: LogConfig,
    queue: RotationQueue<M>,
    /// Newest segment and its timestamp; writers only.
    active: Option<(u64, Segment<T, M>)>,
    /// Segment the sequential reader is pinned to.
    reader: Option<SegmentReader<T>>,
    /// Timestamp of the pinned segment, 0 before the first read.
    reader_ts: u64,
    /// Physical read position to restore when the pinned segment reopens.
    reader_tell: Option<usize>,
}

impl<T: Element> SegmentLog<T, ReadWrite> {
    /// Opens the log in `dir` for writing, creating it if needed.
    ///
    /// An existing log must hold the same element type and queue length; a
    /// different `capacity_per_segment` is accepted and applies to segments
    /// created from now on. If the queue's oldest segment is gone, the queue
    /// is rebuilt from the newest segment files on disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::ConfigError) for an invalid config,
    /// [`LogError::MetadataMismatch`] when the stored log differs, and
    /// [`LogError`] or [`SegmentIoError`](crate::SegmentIoError) for I/O
    /// failures.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        let dir = dir.as_ref();
        config.validate()?;
        fs::create_dir_all(dir).map_err(|e| LogError::DirectoryAccess {
            path: dir.to_path_buf(),
            source: e,
        })?;

        if dir.join(METADATA_FILE).exists() {
            let mut meta = LogMetadata::load(dir)?;
            meta.check_element::<T>()?;
            if meta.config.queue_len != config.queue_len {
                return Err(LogError::MetadataMismatch {
                    field: "queue_len",
                    stored: meta.config.queue_len.to_string(),
                    requested: config.queue_len.to_string(),
                }
                .into());
            }
            if meta.config != config {
                info!(
                    dir = %dir.display(),
                    from = meta.config.capacity_per_segment,
                    to = config.capacity_per_segment,
                    "segment capacity changed"
                );
                meta.config = config;
                meta.store(dir)?;
            }
        } else {
            LogMetadata::for_element::<T>(config).store(dir)?;
            info!(dir = %dir.display(), descr = %T::descr(), "created log");
        }

        let mut queue = RotationQueue::<ReadWrite>::create(dir.join(QUEUE_FILE), config.queue_len)?;
        let oldest = queue.oldest();
        if oldest == 0 || !segment_path(dir, oldest).exists() {
            rebuild_queue(dir, &mut queue)?;
        }

        let active = match queue.newest() {
            0 => None,
            ts => {
                let path = segment_path(dir, ts);
                if path.exists() {
                    Some((ts, SegmentWriter::open(&path)?))
                } else {
                    None
                }
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            queue,
            active,
            reader: None,
            reader_ts: 0,
            reader_tell: None,
        })
    }

    /// Appends rows, creating new segments as needed.
    ///
    /// Rows that do not fit the newest segment go to a freshly created one;
    /// the return value is therefore always 0.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentIoError`](crate::SegmentIoError) or [`LogError`] if a
    /// segment or the queue cannot be written.
    pub fn append(&mut self, rows: &[T]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let left = match self.active.as_mut() {
            Some((_, segment)) => segment.append(rows, AppendMode::LINEAR)?,
            None => rows.len(),
        };
        if left > 0 {
            self.roll(&rows[rows.len() - left..])?;
        }
        Ok(0)
    }

    /// Creates the next segment holding `rows` and publishes it.
    fn roll(&mut self, rows: &[T]) -> Result<()> {
        let ts = now_ns()?.max(self.queue.newest() + 1);
        let path = segment_path(&self.dir, ts);
        let capacity = self.config.capacity_per_segment.max(rows.len());

        // The file exists before its timestamp becomes visible to readers.
        let segment = SegmentWriter::create(&path, rows, capacity, None)?;
        info!(path = %path.display(), capacity, rows = rows.len(), "opened segment");

        if let Some(evicted) = self.queue.advance(ts) {
            self.retire(evicted)?;
        }
        self.active = Some((ts, segment));
        Ok(())
    }

    /// Truncates a segment that left the rotation queue to its live rows.
    fn retire(&mut self, ts: u64) -> Result<()> {
        if ts == 0 {
            return Ok(());
        }
        let path = segment_path(&self.dir, ts);
        if !path.exists() {
            warn!(path = %path.display(), "evicted segment is missing");
            return Ok(());
        }

        if self.reader_ts == ts
            && let Some(reader) = self.reader.take()
        {
            warn!(
                path = %path.display(),
                "retiring the segment this reader is pinned to; the rotation queue may be too short"
            );
            self.reader_tell = Some(reader.tell);
        }

        match SegmentWriter::<T>::open(&path)?.resize(None)? {
            ResizeOutcome::Done { capacity, .. } => {
                info!(path = %path.display(), capacity, "retired segment");
            }
            ResizeOutcome::Refused(_) => {
                debug!(path = %path.display(), "retired wrapped segment without truncation");
            }
        }
        Ok(())
    }

    /// Consolidates history segments (those no longer queued) in batches of
    /// `max(batch_size, 2)`, oldest first, returning how many consolidated
    /// files were written.
    ///
    /// Each batch is merged into its first file, which is then renamed to
    /// `{timestamp}.mseg` so it is never merged again. A batch whose merge
    /// does not fully succeed is abandoned with a warning; the rotation queue
    /// is never touched. The segment this log's reader is pinned to is left
    /// out until the reader moves on. Leftover files that do not fill a
    /// batch wait for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentIoError`](crate::SegmentIoError) or [`LogError`] on
    /// I/O failure.
    pub fn merge(&mut self, batch_size: usize) -> Result<usize> {
        let queued: HashSet<u64> = self.queue.timestamps().into_iter().collect();
        let history: Vec<(u64, PathBuf)> = list_files(&self.dir, SEGMENT_EXT)?
            .into_iter()
            .filter(|(ts, _)| !queued.contains(ts))
            .filter(|(ts, _)| {
                let pinned = *ts == self.reader_ts;
                if pinned {
                    debug!(segment = ts, "not merging the segment the reader is pinned to");
                }
                !pinned
            })
            .collect();

        let mut merged = 0;
        for batch in history.chunks_exact(batch_size.max(2)) {
            let (ts, first) = &batch[0];
            let mut target = SegmentWriter::<T>::open(first)?;
            let mut complete = true;

            for (_, path) in &batch[1..] {
                let (next, ok) = target.merge(SegmentReader::open(path)?)?;
                target = next;
                if !ok {
                    warn!(into = %first.display(), from = %path.display(), "merge failed, abandoning batch");
                    complete = false;
                    break;
                }
            }
            if !complete {
                continue;
            }

            let to = self.dir.join(format!("{ts}.{MERGED_EXT}"));
            target.rename(&to)?;
            info!(path = %to.display(), files = batch.len(), rows = target.size(), "consolidated history");
            merged += 1;
        }
        Ok(merged)
    }

    /// Flushes the newest segment.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentIoError::SyncFailed`](crate::SegmentIoError::SyncFailed)
    /// if the flush fails.
    pub fn sync(&self) -> Result<()> {
        match &self.active {
            Some((_, segment)) => segment.sync(),
            None => Ok(()),
        }
    }

    /// Deletes the whole log directory.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::DirectoryAccess`] if the directory cannot be
    /// removed.
    pub fn remove(self) -> Result<()> {
        let dir = self.dir.clone();
        drop(self);
        fs::remove_dir_all(&dir).map_err(|e| LogError::DirectoryAccess {
            path: dir.clone(),
            source: e,
        })?;
        info!(dir = %dir.display(), "removed log");
        Ok(())
    }
}

impl<T: Element> SegmentLog<T, ReadOnly> {
    /// Opens an existing log for reading.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the metadata or queue is missing or invalid,
    /// and [`LogError::MetadataMismatch`] if the log holds another element
    /// type.
    pub fn open_read_only(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let meta = LogMetadata::load(dir)?;
        meta.check_element::<T>()?;
        let queue = RotationQueue::<ReadOnly>::open(dir.join(QUEUE_FILE), meta.config.queue_len)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            config: meta.config,
            queue,
            active: None,
            reader: None,
            reader_ts: 0,
            reader_tell: None,
        })
    }
}

impl<T: Element, M: Mapping> SegmentLog<T, M> {
    /// The log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The log configuration.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// The rotation queue.
    pub fn queue(&self) -> &RotationQueue<M> {
        &self.queue
    }

    /// Paths of the queued segments, oldest first.
    pub fn segments(&self) -> Vec<PathBuf> {
        self.queued()
            .map(|ts| segment_path(&self.dir, ts))
            .collect()
    }

    /// Paths of every `*.seg` file in the directory, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::DirectoryAccess`] if the directory cannot be
    /// listed.
    pub fn history(&self) -> Result<Vec<PathBuf>> {
        Ok(list_files(&self.dir, SEGMENT_EXT)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    /// Reads up to `n` rows from the sequential read position, preceded by
    /// up to `prefetch` already-read rows of the same segment.
    ///
    /// When the pinned segment is exhausted the reader moves to the next
    /// queued segment. An empty result (with `prefetch == 0`) means the
    /// reader has caught up. A pinned segment resized by the writer is
    /// reopened at the same position.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`](crate::FormatError) or
    /// [`SegmentIoError`](crate::SegmentIoError) if a segment cannot be
    /// opened.
    pub fn read(&mut self, n: usize, prefetch: usize) -> Result<Vec<T>> {
        let mut rechecked = false;
        loop {
            let Some(reader) = self.pinned()? else {
                return Ok(Vec::new());
            };

            let outcome = reader
                .read_counted(n, prefetch)
                .map(|(rows, fresh)| (rows.into_owned(), fresh));
            match outcome {
                Err(e) if e.is_stale() => {
                    warn!(segment = self.reader_ts, "pinned segment was resized, reopening");
                    self.reader_tell = self.reader.take().map(|r| r.tell);
                }
                Err(e) => return Err(e),
                Ok((rows, fresh)) if fresh > 0 || n == 0 => return Ok(rows),
                Ok((rows, _)) => match self.next_queued(self.reader_ts) {
                    // A segment is complete before its successor is queued,
                    // so look once more now that the successor is visible.
                    Some(_) if !rechecked => rechecked = true,
                    Some(next) => {
                        rechecked = false;
                        debug!(from = self.reader_ts, to = next, "reader moving to next segment");
                        self.reader = None;
                        self.reader_tell = None;
                        self.reader_ts = next;
                    }
                    None => return Ok(rows),
                },
            }
        }
    }

    /// Up to `n` rows from the oldest queued segments, one entry per segment.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`](crate::FormatError) or
    /// [`SegmentIoError`](crate::SegmentIoError) if a segment cannot be
    /// opened.
    pub fn head(&self, n: usize) -> Result<Vec<Vec<T>>> {
        let mut out = Vec::new();
        let mut remaining = n;
        for ts in self.queued() {
            if remaining == 0 {
                break;
            }
            let Some(segment) = self.open_segment(ts)? else {
                continue;
            };
            let rows = segment.head(remaining)?.into_owned();
            remaining -= rows.len();
            if !rows.is_empty() {
                out.push(rows);
            }
        }
        Ok(out)
    }

    /// Up to `n` rows from the newest queued segments, one entry per segment,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`](crate::FormatError) or
    /// [`SegmentIoError`](crate::SegmentIoError) if a segment cannot be
    /// opened.
    pub fn tail(&self, n: usize) -> Result<Vec<Vec<T>>> {
        let mut out = Vec::new();
        let mut remaining = n;
        let stamps: Vec<u64> = self.queued().collect();
        for &ts in stamps.iter().rev() {
            if remaining == 0 {
                break;
            }
            let Some(segment) = self.open_segment(ts)? else {
                continue;
            };
            let rows = segment.tail(remaining)?.into_owned();
            remaining -= rows.len();
            if !rows.is_empty() {
                out.insert(0, rows);
            }
        }
        Ok(out)
    }

    /// Queued timestamps, oldest first, skipping unused slots.
    fn queued(&self) -> impl Iterator<Item = u64> + use<T, M> {
        self.queue.timestamps().into_iter().filter(|&ts| ts != 0)
    }

    /// Smallest queued timestamp newer than `after`.
    fn next_queued(&self, after: u64) -> Option<u64> {
        self.queued().filter(|&ts| ts > after).min()
    }

    fn open_segment(&self, ts: u64) -> Result<Option<SegmentReader<T>>> {
        let path = segment_path(&self.dir, ts);
        if !path.exists() {
            return Ok(None);
        }
        SegmentReader::open(&path).map(Some)
    }

    /// The pinned reader, opening the next available segment if needed.
    fn pinned(&mut self) -> Result<Option<&mut SegmentReader<T>>> {
        while self.reader.is_none() {
            let ts = match self.reader_ts {
                0 => match self.queued().next() {
                    Some(ts) => ts,
                    None => return Ok(None),
                },
                ts => ts,
            };

            match self.open_segment(ts)? {
                Some(mut segment) => {
                    if let Some(tell) = self.reader_tell.take() {
                        segment.tell = tell;
                    }
                    self.reader_ts = ts;
                    self.reader = Some(segment);
                }
                None => {
                    self.reader_tell = None;
                    match self.next_queued(ts) {
                        Some(next) => self.reader_ts = next,
                        None => return Ok(None),
                    }
                }
            }
        }
        Ok(self.reader.as_mut())
    }
}

/// Path of the segment created at `ts`.
pub fn segment_path(dir: &Path, ts: u64) -> PathBuf {
    dir.join(format!("{ts}.{SEGMENT_EXT}"))
}

/// Files in `dir` with extension `ext` and a numeric stem, sorted by stem.
fn list_files(dir: &Path, ext: &str) -> Result<Vec<(u64, PathBuf)>> {
    let access = |e| LogError::DirectoryAccess {
        path: dir.to_path_buf(),
        source: e,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(access)? {
        let path = entry.map_err(access)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        let Some(ts) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        files.push((ts, path));
    }
    files.sort_unstable_by_key(|(ts, _)| *ts);
    Ok(files)
}

/// Refills the queue with the newest segment files on disk.
fn rebuild_queue(dir: &Path, queue: &mut RotationQueue<ReadWrite>) -> Result<()> {
    let files = list_files(dir, SEGMENT_EXT)?;
    let newest = &files[files.len().saturating_sub(queue.len())..];

    queue.reset();
    for (ts, _) in newest {
        queue.advance(*ts);
    }
    if !newest.is_empty() {
        debug!(dir = %dir.display(), segments = newest.len(), "rebuilt rotation queue from disk");
    }
    Ok(())
}

/// Wall-clock time in nanoseconds since the Unix epoch.
fn now_ns() -> Result<u64> {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| LogError::Clock {
            reason: "system time is before the Unix epoch",
        })?;
    u64::try_from(since.as_nanos()).map_err(|_| {
        LogError::Clock {
            reason: "timestamp does not fit in 64 bits",
        }
        .into()
    })
}
