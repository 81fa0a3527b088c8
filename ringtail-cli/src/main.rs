//! CLI for ringtail segment files and segment logs.
//!
//! Provides commands for inspecting, slicing, resizing, consolidating and
//! benchmarking segments.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use ringtail::format::{FOOTER_SIZE, Footer};
use ringtail::log::{LogMetadata, MERGED_EXT, QUEUE_FILE, SEGMENT_EXT};
use ringtail::{
    AppendMode, ArrayHeader, Element, LogWriter, ReadOnly, ResizeOutcome, RotationQueue,
    SegmentReader, SegmentWriter,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Largest prefix that can hold a version 1.0 header.
const MAX_HEADER_LEN: u64 = 10 + u16::MAX as u64;

/// Trailer bytes: the generation word followed by the footer.
const TRAILER_LEN: usize = 8 + FOOTER_SIZE;

/// ringtail: memory-mapped ring-buffer segment files.
#[derive(Parser)]
#[command(name = "ringtail", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display a segment's header, footer and wrap state.
    Info {
        /// Path to the segment file.
        path: PathBuf,
    },

    /// Print the oldest rows of a segment.
    Head {
        /// Path to the segment file.
        path: PathBuf,

        /// Number of rows to print.
        #[arg(long, default_value = "10")]
        rows: usize,

        /// Row type stored in the file.
        #[arg(long)]
        dtype: Dtype,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Print the newest rows of a segment.
    Tail {
        /// Path to the segment file.
        path: PathBuf,

        /// Number of rows to print.
        #[arg(long, default_value = "10")]
        rows: usize,

        /// Row type stored in the file.
        #[arg(long)]
        dtype: Dtype,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Change a segment's capacity (default: truncate to its live rows).
    Resize {
        /// Path to the segment file.
        path: PathBuf,

        /// New capacity in rows; never below the write cursor.
        #[arg(long)]
        capacity: Option<usize>,

        /// Row type stored in the file.
        #[arg(long)]
        dtype: Dtype,
    },

    /// Display a log's metadata, rotation queue and files on disk.
    LogInfo {
        /// Path to the log directory.
        dir: PathBuf,
    },

    /// Consolidate a log's retired segments.
    Merge {
        /// Path to the log directory.
        dir: PathBuf,

        /// Number of segments folded into each consolidated file.
        #[arg(long, default_value = "8")]
        batch_size: usize,
    },

    /// Run an append-path microbenchmark.
    Bench {
        /// Number of rows to append.
        #[arg(long, default_value = "10000000")]
        rows: usize,

        /// Rows per append call.
        #[arg(long, default_value = "64")]
        batch: usize,
    },
}

/// Primitive row types the CLI can decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Dtype {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl Dtype {
    const ALL: [Self; 10] = [
        Self::U8,
        Self::U16,
        Self::U32,
        Self::U64,
        Self::I8,
        Self::I16,
        Self::I32,
        Self::I64,
        Self::F32,
        Self::F64,
    ];

    fn descr(self) -> String {
        match self {
            Self::U8 => u8::descr(),
            Self::U16 => u16::descr(),
            Self::U32 => u32::descr(),
            Self::U64 => u64::descr(),
            Self::I8 => i8::descr(),
            Self::I16 => i16::descr(),
            Self::I32 => i32::descr(),
            Self::I64 => i64::descr(),
            Self::F32 => f32::descr(),
            Self::F64 => f64::descr(),
        }
    }

    /// Finds the type written with descriptor `descr`.
    fn from_descr(descr: &str) -> Option<Self> {
        let wanted: String = descr.chars().filter(|c| !c.is_whitespace()).collect();
        let wanted = wanted.replace('"', "'");
        Self::ALL.into_iter().find(|dtype| dtype.descr() == wanted)
    }
}

/// Calls `$f::<T>(args)` with `T` picked by a [`Dtype`].
macro_rules! with_dtype {
    ($dtype:expr, $f:ident($($arg:expr),* $(,)?)) => {
        match $dtype {
            Dtype::U8 => $f::<u8>($($arg),*),
            Dtype::U16 => $f::<u16>($($arg),*),
            Dtype::U32 => $f::<u32>($($arg),*),
            Dtype::U64 => $f::<u64>($($arg),*),
            Dtype::I8 => $f::<i8>($($arg),*),
            Dtype::I16 => $f::<i16>($($arg),*),
            Dtype::I32 => $f::<i32>($($arg),*),
            Dtype::I64 => $f::<i64>($($arg),*),
            Dtype::F32 => $f::<f32>($($arg),*),
            Dtype::F64 => $f::<f64>($($arg),*),
        }
    };
}

/// Output format for printed rows.
#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// One value per line.
    Csv,
    /// JSON object with the rows as an array.
    Json,
}

/// Which end of the buffer to print.
#[derive(Clone, Copy)]
enum End {
    Head,
    Tail,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { path } => cmd_info(&path),
        Commands::Head {
            path,
            rows,
            dtype,
            format,
        } => with_dtype!(dtype, cmd_rows(&path, End::Head, rows, format)),
        Commands::Tail {
            path,
            rows,
            dtype,
            format,
        } => with_dtype!(dtype, cmd_rows(&path, End::Tail, rows, format)),
        Commands::Resize {
            path,
            capacity,
            dtype,
        } => with_dtype!(dtype, cmd_resize(&path, capacity)),
        Commands::LogInfo { dir } => cmd_log_info(&dir),
        Commands::Merge { dir, batch_size } => cmd_merge(&dir, batch_size),
        Commands::Bench { rows, batch } => cmd_bench(rows, batch),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// What `info` learns from a file without knowing its row type.
#[derive(Debug)]
struct FileSummary {
    header: ArrayHeader,
    data_offset: usize,
    file_len: u64,
    /// Generation and footer, `None` for a plain array.
    trailer: Option<(u64, Footer)>,
}

/// Reads the header and trailer of the file at `path`.
fn summarize(path: &Path) -> CliResult<FileSummary> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let mut prefix = Vec::new();
    (&mut file).take(MAX_HEADER_LEN).read_to_end(&mut prefix)?;
    let (header, data_offset) = ArrayHeader::parse(&prefix, path)?;

    let mut trailer = None;
    if file_len >= (data_offset + TRAILER_LEN) as u64 {
        let mut raw = [0u8; TRAILER_LEN];
        file.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
        file.read_exact(&mut raw)?;

        let mut words = [0u8; 8];
        words.copy_from_slice(&raw[..8]);
        let mut footer_bytes = [0u8; FOOTER_SIZE];
        footer_bytes.copy_from_slice(&raw[8..]);
        let footer = Footer::from_bytes(&footer_bytes);
        if footer.is_valid() {
            trailer = Some((u64::from_le_bytes(words), footer));
        }
    }

    Ok(FileSummary {
        header,
        data_offset,
        file_len,
        trailer,
    })
}

/// Live row count for footer cursors, `None` when either exceeds `capacity`.
fn live_rows(capacity: u64, start: u64, end: u64) -> Option<u64> {
    if start > capacity || end > capacity {
        return None;
    }
    Some(if end >= start {
        end - start
    } else {
        capacity - start + end
    })
}

/// Implements `ringtail info <path>`.
fn cmd_info(path: &Path) -> CliResult {
    let summary = summarize(path)?;
    let header = &summary.header;

    println!("File: {}", path.display());
    println!("  Size: {} ({} bytes)", format_bytes(summary.file_len), summary.file_len);
    println!("  Descr: {}", header.descr);
    println!("  Shape: {:?}", header.shape);
    println!("  Data offset: {}", summary.data_offset);
    if let Some(dtype) = Dtype::from_descr(&header.descr) {
        println!("  Row type: {dtype:?}");
    }

    let Some((generation, footer)) = summary.trailer else {
        println!("  Mode: raw (no ring-buffer footer)");
        return Ok(());
    };

    let capacity = header.capacity() as u64;
    let (start, end) = (footer.start, footer.end);
    println!("  Mode: ring buffer");
    println!("  Capacity: {capacity}");
    println!("  Start: {start}");
    println!("  End: {end}");
    match live_rows(capacity, start, end) {
        Some(size) => println!("  Live rows: {size}"),
        None => {
            warn!(path = %path.display(), start, end, capacity, "footer cursors out of range");
            println!("  Live rows: unknown (cursors exceed capacity)");
        }
    }
    println!("  Wrapped: {}", end < start);
    println!("  Generation: {generation}");
    Ok(())
}

/// Implements `ringtail head|tail <path>`.
fn cmd_rows<T: Element + std::fmt::Display + Into<serde_json::Value>>(
    path: &Path,
    end: End,
    n: usize,
    format: OutputFormat,
) -> CliResult {
    let seg = SegmentReader::<T>::open(path)?;
    let rows = match end {
        End::Head => seg.head(n)?,
        End::Tail => seg.tail(n)?,
    };

    match format {
        OutputFormat::Csv => {
            println!("# file={}, rows={}", path.display(), rows.len());
            for row in rows.iter() {
                println!("{row}");
            }
        }
        OutputFormat::Json => {
            let values: Vec<serde_json::Value> = rows.iter().map(|&row| row.into()).collect();
            let output = serde_json::json!({
                "file": path.display().to_string(),
                "start": seg.start(),
                "end": seg.end(),
                "count": values.len(),
                "rows": values,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Implements `ringtail resize <path>`.
fn cmd_resize<T: Element>(path: &Path, capacity: Option<usize>) -> CliResult {
    let seg = SegmentWriter::<T>::open(path)?;
    let from = seg.capacity();
    match seg.resize(capacity)? {
        ResizeOutcome::Done { capacity, .. } => {
            println!("Resized {}: {from} -> {capacity} rows", path.display());
            Ok(())
        }
        ResizeOutcome::Refused(seg) => Err(format!(
            "'{}' is wrapped (start={}, end={}); drain it before resizing",
            path.display(),
            seg.start(),
            seg.end()
        )
        .into()),
    }
}

/// Implements `ringtail log-info <dir>`.
fn cmd_log_info(dir: &Path) -> CliResult {
    let meta = LogMetadata::load(dir)?;
    let queue = RotationQueue::<ReadOnly>::open(dir.join(QUEUE_FILE), meta.config.queue_len)?;

    println!("Log: {}", dir.display());
    println!("  Descr: {}", meta.descr);
    if !meta.sub_shape.is_empty() {
        println!("  Row shape: {:?}", meta.sub_shape);
    }
    println!("  Capacity per segment: {}", meta.config.capacity_per_segment);
    println!("  Queue length: {}", meta.config.queue_len);
    println!();

    println!("Rotation queue (oldest first):");
    for (slot, ts) in queue.timestamps().into_iter().enumerate() {
        if ts == 0 {
            println!("  [{slot}] -");
        } else {
            println!("  [{slot}] {ts}");
        }
    }
    println!();

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str());
        if ext == Some(SEGMENT_EXT) || ext == Some(MERGED_EXT) {
            files.push((path, entry.metadata()?.len()));
        }
    }
    files.sort();

    println!("Files: {}", files.len());
    for (path, len) in &files {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let is_segment = path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXT);
        let queued = is_segment
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
                .is_some_and(|ts| queue.contains(ts));
        let marker = if queued { " (queued)" } else { "" };
        println!("  {name}: {}{marker}", format_bytes(*len));
    }

    let total: u64 = files.iter().map(|(_, len)| len).sum();
    println!();
    println!("Total segment bytes: {} ({total} bytes)", format_bytes(total));
    Ok(())
}

/// Implements `ringtail merge <dir>`.
fn cmd_merge(dir: &Path, batch_size: usize) -> CliResult {
    let meta = LogMetadata::load(dir)?;
    if !meta.sub_shape.is_empty() {
        return Err(format!("rows of shape {:?} are not supported by the CLI", meta.sub_shape).into());
    }
    let dtype = Dtype::from_descr(&meta.descr)
        .ok_or_else(|| format!("unsupported row type {}", meta.descr))?;

    debug!(dir = %dir.display(), ?dtype, batch_size, "merging log history");
    let merged = with_dtype!(dtype, merge_log(dir, meta.config, batch_size))?;
    println!("Wrote {merged} consolidated file(s) in {}", dir.display());
    Ok(())
}

fn merge_log<T: Element>(dir: &Path, config: ringtail::LogConfig, batch_size: usize) -> CliResult<usize> {
    let mut log = LogWriter::<T>::open(dir, config)?;
    Ok(log.merge(batch_size)?)
}

/// Implements `ringtail bench`.
#[allow(clippy::cast_precision_loss)] // Benchmark stats are fine with f64 precision
fn cmd_bench(rows: usize, batch: usize) -> CliResult {
    if rows == 0 || batch == 0 {
        return Err("--rows and --batch must be positive".into());
    }

    println!("ringtail append-path benchmark");
    println!("  Rows: {rows}");
    println!("  Batch: {batch}");
    println!();

    let temp_dir = std::env::temp_dir().join("ringtail_bench");
    let _ = std::fs::remove_dir_all(&temp_dir);
    std::fs::create_dir_all(&temp_dir)?;

    let path = temp_dir.join("bench.seg");
    let mut seg = SegmentWriter::<u64>::create(&path, &[], rows, None)?;
    let chunk: Vec<u64> = (0..batch as u64).collect();

    println!("Appending {rows} rows in batches of {batch}...");

    let start = Instant::now();
    let mut written = 0;
    while written < rows {
        let take = batch.min(rows - written);
        let left = seg.append(&chunk[..take], AppendMode::LINEAR)?;
        written += take - left;
        if left > 0 {
            break;
        }
    }
    seg.sync()?;
    let elapsed = start.elapsed();

    let ns_per_row = elapsed.as_nanos() as f64 / written as f64;
    let rows_per_sec = written as f64 / elapsed.as_secs_f64();
    let bytes_per_sec = rows_per_sec * 8.0;

    println!();
    println!("Results:");
    println!("  Rows written: {written}");
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_row:.1} ns/row");
    println!("  Throughput: {rows_per_sec:.0} rows/sec ({}/sec)", format_bytes(bytes_per_sec as u64));
    println!();

    let reader = SegmentReader::<u64>::open(&path)?;
    println!("  Verified live rows: {}", reader.size());

    drop(reader);
    drop(seg);
    let _ = std::fs::remove_dir_all(&temp_dir);

    Ok(())
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_from_descr() {
        assert_eq!(Dtype::from_descr(&u64::descr()), Some(Dtype::U64));
        assert_eq!(Dtype::from_descr("'|u1'"), Some(Dtype::U8));
        assert_eq!(Dtype::from_descr("[('a', '<f8')]"), None);
    }

    #[test]
    fn test_summarize_ring_and_raw_files() {
        let temp_dir = tempfile::tempdir().unwrap();

        let ring = temp_dir.path().join("ring.seg");
        let mut seg = SegmentWriter::<i32>::create(&ring, &[1, 2, 3], 8, None).unwrap();
        seg.pop(true).unwrap();
        drop(seg);

        let summary = summarize(&ring).unwrap();
        assert_eq!(summary.header.capacity(), 8);
        let (generation, footer) = summary.trailer.unwrap();
        assert_eq!(generation, 0);
        assert_eq!((footer.start, footer.end), (3, 3));

        let raw = temp_dir.path().join("plain.npy");
        let mut bytes = ArrayHeader::new(i32::descr(), 2, &[]).encode().unwrap();
        bytes.extend_from_slice(&[0u8; 8]);
        std::fs::write(&raw, bytes).unwrap();
        assert!(summarize(&raw).unwrap().trailer.is_none());
    }

    #[test]
    fn test_info_tolerates_corrupt_cursors() {
        assert_eq!(live_rows(8, 2, 5), Some(3));
        assert_eq!(live_rows(8, 6, 2), Some(4));
        assert_eq!(live_rows(8, 100, 3), None);
        assert_eq!(live_rows(8, 0, u64::MAX), None);

        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bad.seg");
        drop(SegmentWriter::<u64>::create(&path, &[1, 2, 3], 8, None).unwrap());
        let mut bytes = std::fs::read(&path).unwrap();
        let start_at = bytes.len() - FOOTER_SIZE;
        bytes[start_at..start_at + 8].copy_from_slice(&100u64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let (_, footer) = summarize(&path).unwrap().trailer.unwrap();
        assert_eq!((footer.start, footer.end), (100, 3));
        assert!(cmd_info(&path).is_ok());
    }
}
