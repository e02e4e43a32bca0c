//! Benchmarks for the dispatcher and resource table

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use resio::error::classify_errno;
use resio::ops::fs::OpenOptions;
use resio::{Op, OpValue, Runtime};
use std::io::SeekFrom;

/// Open and close a cancel handle: table insert plus removal
fn bench_handle_churn(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    c.bench_function("cancel_handle_open_close", |b| {
        b.iter(|| {
            let rid = rt
                .dispatch_sync(Op::CancelHandle)
                .and_then(OpValue::into_handle)
                .unwrap();
            rt.dispatch_sync(Op::Close { rid }).unwrap();
            black_box(rid)
        })
    });
}

/// Async read through the full dispatch path on a regular file
fn bench_file_read(c: &mut Criterion) {
    let path = std::env::temp_dir().join(format!("resio_bench_{}", std::process::id()));
    std::fs::write(&path, vec![0xA5u8; 64 * 1024]).unwrap();

    let rt = Runtime::new().unwrap();
    let rid = rt
        .dispatch_sync(Op::OpenSync {
            path: path.clone(),
            options: OpenOptions::new().read(true),
        })
        .and_then(OpValue::into_handle)
        .unwrap();

    let mut group = c.benchmark_group("file_read");
    for &len in &[512usize, 4096, 65536] {
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(format!("{}_bytes", len), |b| {
            b.iter(|| {
                rt.dispatch_sync(Op::Seek {
                    rid,
                    from: SeekFrom::Start(0),
                })
                .unwrap();
                let bytes = rt
                    .block_on(rt.dispatch_async(Op::Read { rid, len }, None))
                    .and_then(OpValue::into_bytes)
                    .unwrap();
                black_box(bytes)
            })
        });
    }
    group.finish();

    rt.close(rid).unwrap();
    let _ = std::fs::remove_file(&path);
}

/// Error classification lookups
fn bench_classify(c: &mut Criterion) {
    let codes = [libc::ENOENT, libc::ECONNRESET, libc::EAGAIN, libc::ENOSYS, 4095];
    c.bench_function("classify_errno", |b| {
        b.iter(|| {
            for &code in &codes {
                black_box(classify_errno(black_box(code)));
            }
        })
    });
}

criterion_group!(benches, bench_handle_churn, bench_file_read, bench_classify);
criterion_main!(benches);
