// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use libdd_crash_reporter::dump::DumpWriter;
use libdd_crash_reporter::shared::memory_map::parse_maps;
use libdd_crash_reporter::{Frame, FrameSink};

fn synthetic_maps(entries: usize) -> String {
    let mut maps = String::new();
    for i in 0..entries {
        let start = 0x7f00_0000_0000usize + i * 0x10000;
        let perms = if i % 3 == 0 { "r-xp" } else { "rw-p" };
        let path = if i % 4 == 0 {
            String::new()
        } else {
            format!("/usr/lib/x86_64-linux-gnu/libbench{}.so", i / 4)
        };
        maps.push_str(&format!(
            "{:x}-{:x} {perms} {:08x} 08:01 {}                 {path}\n",
            start,
            start + 0x10000,
            (i % 4) * 0x1000,
            1000 + i
        ));
    }
    maps
}

fn bench_parse_maps(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_maps");
    for entries in [16, 256, 2048] {
        let maps = synthetic_maps(entries);
        group.throughput(Throughput::Bytes(maps.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(entries), &maps, |b, maps| {
            b.iter(|| parse_maps(black_box(maps)).unwrap())
        });
    }
    group.finish();
}

fn bench_frame_lines(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_lines");
    let frames: Vec<Frame<'static>> = (0..128)
        .map(|index| Frame {
            index,
            rel_pc: 0x1000 + index * 0x40,
            module: (index % 5 != 0).then_some("/usr/lib/libbench.so"),
            function: (index % 2 == 0).then_some("_ZN5bench8function17h0123456789abcdefE"),
            offset: index * 4,
        })
        .collect();
    group.throughput(Throughput::Elements(frames.len() as u64));

    // No file and no system log: only formatting into the line buffer.
    group.bench_function("dump_writer", |b| {
        let mut writer = DumpWriter::new(-1, false);
        b.iter(|| {
            for frame in &frames {
                writer.emit(black_box(frame));
            }
        })
    });
    group.bench_function("to_string", |b| {
        b.iter(|| {
            let mut lines: Vec<String> = Vec::with_capacity(frames.len());
            for frame in &frames {
                lines.emit(black_box(frame));
            }
            lines
        })
    });
    group.finish();
}

criterion_group!(benches, bench_parse_maps, bench_frame_lines);
criterion_main!(benches);
