//! Integration tests for segment logs.
//!
//! These cover rotation across many segments, a reader process tailing a
//! writer, and consolidation of retired history.

use std::thread;

use ringtail::log::{MERGED_EXT, QUEUE_FILE};
use ringtail::{
    LogConfig, LogReader, LogWriter, Mapping, ResizeOutcome, SegmentLog, SegmentReader,
    SegmentWriter,
};
use tempfile::tempdir;

/// Reads from `reader` until it reports no new rows.
fn read_all<M: Mapping>(reader: &mut SegmentLog<u64, M>) -> Vec<u64> {
    let mut seen = Vec::new();
    loop {
        let rows = reader.read(3, 0).unwrap();
        if rows.is_empty() {
            return seen;
        }
        seen.extend(rows);
    }
}

#[test]
fn test_rows_spread_over_segments_in_order() {
    let temp_dir = tempdir().unwrap();
    let mut log = LogWriter::<u64>::open(temp_dir.path(), LogConfig::new(4, 8).unwrap()).unwrap();

    for row in 0..10u64 {
        assert_eq!(log.append(&[row]).unwrap(), 0);
    }
    log.sync().unwrap();

    // ceil(10 / 4) segments, every one still queued.
    let segments = log.segments();
    assert_eq!(segments.len(), 3);
    let sizes: Vec<usize> = segments
        .iter()
        .map(|path| SegmentReader::<u64>::open(path).unwrap().size())
        .collect();
    assert_eq!(sizes, vec![4, 4, 2]);

    let mut reader = LogReader::<u64>::open_read_only(temp_dir.path()).unwrap();
    assert_eq!(read_all(&mut reader), (0..10).collect::<Vec<_>>());

    // Caught up; later appends show up on the next read.
    log.append(&[10, 11, 12]).unwrap();
    assert_eq!(read_all(&mut reader), vec![10, 11, 12]);
}

#[test]
fn test_large_batch_gets_its_own_segment() {
    let temp_dir = tempdir().unwrap();
    let mut log = LogWriter::<u64>::open(temp_dir.path(), LogConfig::new(4, 4).unwrap()).unwrap();

    log.append(&[0, 1]).unwrap();
    log.append(&(2..12).collect::<Vec<_>>()).unwrap();

    let segments = log.segments();
    assert_eq!(segments.len(), 2);
    let second = SegmentReader::<u64>::open(&segments[1]).unwrap();
    assert_eq!(second.capacity(), 8);
    assert_eq!(second.data().unwrap().as_ref(), &[4, 5, 6, 7, 8, 9, 10, 11]);
}

#[test]
fn test_rotation_keeps_history_on_disk() {
    let temp_dir = tempdir().unwrap();
    let mut log = LogWriter::<u64>::open(temp_dir.path(), LogConfig::new(2, 2).unwrap()).unwrap();

    for row in 0..7u64 {
        log.append(&[row]).unwrap();
    }

    assert_eq!(log.history().unwrap().len(), 4);
    assert_eq!(log.segments().len(), 2);
    assert_eq!(log.tail(3).unwrap(), vec![vec![4, 5], vec![6]]);
    assert_eq!(log.head(3).unwrap(), vec![vec![4, 5], vec![6]]);

    // The queue file holds exactly one slot per queued segment.
    let queue_len = std::fs::metadata(temp_dir.path().join(QUEUE_FILE)).unwrap().len();
    assert_eq!(queue_len, 16);
}

#[test]
fn test_reopen_continues_newest_segment() {
    let temp_dir = tempdir().unwrap();
    let config = LogConfig::new(4, 3).unwrap();
    {
        let mut log = LogWriter::<u64>::open(temp_dir.path(), config).unwrap();
        log.append(&[1, 2]).unwrap();
    }

    let mut log = LogWriter::<u64>::open(temp_dir.path(), config).unwrap();
    log.append(&[3, 4, 5]).unwrap();
    assert_eq!(log.head(10).unwrap(), vec![vec![1, 2, 3, 4], vec![5]]);
}

#[test]
fn test_merge_consolidates_history() {
    let temp_dir = tempdir().unwrap();
    let mut log = LogWriter::<u64>::open(temp_dir.path(), LogConfig::new(2, 2).unwrap()).unwrap();

    for row in 0..7u64 {
        log.append(&[row]).unwrap();
    }
    let history = log.history().unwrap();
    let first = history[0].clone();

    assert_eq!(log.merge(2).unwrap(), 1);

    // Queued segments are untouched; the two retired ones became one file.
    assert_eq!(log.history().unwrap(), log.segments());
    let merged = first.with_extension(MERGED_EXT);
    assert!(!first.exists());
    let merged = SegmentReader::<u64>::open(&merged).unwrap();
    assert_eq!(merged.data().unwrap().as_ref(), &[0, 1, 2, 3]);

    // Nothing left to merge.
    assert_eq!(log.merge(2).unwrap(), 0);
}

#[test]
fn test_reader_resumes_in_retired_segment() {
    let temp_dir = tempdir().unwrap();
    let mut log = LogWriter::<u64>::open(temp_dir.path(), LogConfig::new(4, 2).unwrap()).unwrap();
    log.append(&[1, 2, 3]).unwrap();

    let mut reader = LogReader::<u64>::open_read_only(temp_dir.path()).unwrap();
    assert_eq!(reader.read(2, 0).unwrap(), vec![1, 2]);

    // Two rotations push the reader's segment out of the queue.
    for row in 4..=12u64 {
        log.append(&[row]).unwrap();
    }
    let history = log.history().unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(log.segments(), history[1..].to_vec());

    // Resizing the retired file under the reader makes its mapping stale.
    let retired = SegmentWriter::<u64>::open(&history[0]).unwrap();
    let ResizeOutcome::Done { capacity, .. } = retired.resize(Some(8)).unwrap() else {
        panic!("resize refused");
    };
    assert_eq!(capacity, 8);

    assert_eq!(read_all(&mut reader), (3..=12).collect::<Vec<_>>());
    assert!(reader.read(3, 0).unwrap().is_empty());
}

#[test]
fn test_merge_skips_segment_under_reader() {
    let temp_dir = tempdir().unwrap();
    let mut log = LogWriter::<u64>::open(temp_dir.path(), LogConfig::new(2, 2).unwrap()).unwrap();
    for row in 0..10u64 {
        log.append(&[row]).unwrap();
    }
    assert_eq!(log.read(1, 0).unwrap(), vec![6]);

    // Retires the segment holding the unread row 7.
    log.append(&[10, 11]).unwrap();
    let history = log.history().unwrap();
    assert_eq!(history.len(), 6);
    let pinned = history[3].clone();

    assert_eq!(log.merge(2).unwrap(), 1);
    assert!(pinned.exists());
    assert_eq!(read_all(&mut log), vec![7, 8, 9, 10, 11]);

    // Once the reader moved on the leftover can be merged.
    assert_eq!(log.merge(2).unwrap(), 1);
    assert!(!pinned.exists());
}

#[test]
fn test_reader_thread_follows_writer() {
    let temp_dir = tempdir().unwrap();
    let total = 1000u64;
    // Enough queue slots that the writer never retires a segment the
    // reader still needs.
    let config = LogConfig::new(64, 32).unwrap();
    let mut log = LogWriter::<u64>::open(temp_dir.path(), config).unwrap();
    let mut reader = LogReader::<u64>::open_read_only(temp_dir.path()).unwrap();

    let consumer = thread::spawn(move || {
        let mut seen = Vec::with_capacity(total as usize);
        while (seen.len() as u64) < total {
            let rows = reader.read(50, 0).unwrap();
            if rows.is_empty() {
                thread::yield_now();
            }
            seen.extend(rows);
        }
        seen
    });

    for chunk in (0..total).collect::<Vec<_>>().chunks(7) {
        log.append(chunk).unwrap();
    }

    let seen = consumer.join().unwrap();
    assert_eq!(seen, (0..total).collect::<Vec<_>>());
    assert_eq!(log.segments().len(), 16);
}

#[test]
fn test_remove_deletes_everything() {
    let temp_dir = tempdir().unwrap();
    let dir = temp_dir.path().join("log");
    let mut log = LogWriter::<u64>::open(&dir, LogConfig::default()).unwrap();
    log.append(&[1, 2, 3]).unwrap();

    log.remove().unwrap();
    assert!(!dir.exists());
    assert!(LogReader::<u64>::open_read_only(&dir).is_err());
}
