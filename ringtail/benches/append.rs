//! Microbenchmarks for the append and read paths.
//!
//! Run with: `cargo bench -p ringtail -- append`

#![allow(missing_docs, clippy::cast_possible_truncation)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ringtail::{AppendMode, LogConfig, LogWriter, SegmentReader, SegmentWriter};
use tempfile::tempdir;

const CAPACITY: usize = 1 << 16;

fn setup_segment() -> (SegmentWriter<u64>, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let seg = SegmentWriter::create(temp_dir.path().join("bench.seg"), &[], CAPACITY, None).unwrap();
    (seg, temp_dir)
}

fn bench_append_single(c: &mut Criterion) {
    let (mut seg, _dir) = setup_segment();
    let mut value = 0u64;

    c.bench_function("append/single_row", |b| {
        b.iter(|| {
            value += 1;
            if seg.append(black_box(&[value]), AppendMode::RING).unwrap() != 0 {
                seg.clear().unwrap();
            }
        });
    });
}

fn bench_append_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("append/batch_size");

    for size in [16usize, 256, 4096] {
        let (mut seg, _dir) = setup_segment();
        let rows: Vec<u64> = (0..size as u64).collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                if seg.append(black_box(&rows), AppendMode::LINEAR.bulk()).unwrap() != 0 {
                    seg.clear().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_reader_tail(c: &mut Criterion) {
    let (mut seg, dir) = setup_segment();
    let rows: Vec<u64> = (0..CAPACITY as u64).collect();
    seg.append(&rows, AppendMode::LINEAR).unwrap();
    let mut reader = SegmentReader::<u64>::open(dir.path().join("bench.seg")).unwrap();

    c.bench_function("read/256_rows", |b| {
        b.iter(|| {
            if reader.read(black_box(256), 0).unwrap().is_empty() {
                reader.rewind();
            }
        });
    });
}

fn bench_log_append(c: &mut Criterion) {
    let temp_dir = tempdir().unwrap();
    let mut log =
        LogWriter::<u64>::open(temp_dir.path(), LogConfig::new(CAPACITY, 4).unwrap()).unwrap();
    let rows: Vec<u64> = (0..256).collect();

    c.bench_function("log/append_256_rows", |b| {
        b.iter(|| {
            log.append(black_box(&rows)).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_append_single,
    bench_append_batch,
    bench_reader_tail,
    bench_log_append,
);
criterion_main!(benches);
