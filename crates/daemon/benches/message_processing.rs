//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths between a socket and a PTY:
//! - Packet encoding of terminal output
//! - Packet decoding and validation of terminal input
//! - UTF-8 stream decoding of PTY reads

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use webterm_protocol::{ClientEvent, Packet, ServerEvent, Utf8StreamDecoder};

/// Benchmark encoding `terminal_output_<id>` packets.
fn bench_output_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_encoding");

    for (name, size) in [("small_1B", 1usize), ("medium_4KB", 4096), ("large_20KB", 20480)] {
        let output = "x".repeat(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let packet = ServerEvent::output("term-1", black_box(output.clone()))
                    .to_packet()
                    .unwrap();
                black_box(packet.encode().unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark decoding a keystroke packet into a validated event.
fn bench_input_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("input_decoding");

    let keystroke =
        r#"{"type":"event","event":"terminal_input","data":{"terminal_id":"term-1","input":"l"}}"#;
    group.bench_function("keystroke", |b| {
        b.iter(|| {
            let Packet::Event { event, data, .. } = Packet::decode(black_box(keystroke)).unwrap()
            else {
                unreachable!()
            };
            black_box(ClientEvent::from_parts(&event, data).unwrap())
        });
    });

    let paste = format!(
        r#"{{"type":"event","event":"terminal_input","data":{{"terminal_id":"term-1","input":"{}"}}}}"#,
        "y".repeat(4096)
    );
    group.throughput(Throughput::Bytes(paste.len() as u64));
    group.bench_function("paste_4KB", |b| {
        b.iter(|| {
            let Packet::Event { event, data, .. } = Packet::decode(black_box(&paste)).unwrap()
            else {
                unreachable!()
            };
            black_box(ClientEvent::from_parts(&event, data).unwrap())
        });
    });

    group.finish();
}

/// Benchmark UTF-8 reassembly of PTY reads.
fn bench_utf8_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8_stream");

    let ascii = vec![b'a'; 20480];
    group.throughput(Throughput::Bytes(ascii.len() as u64));
    group.bench_function("ascii_20KB", |b| {
        let mut decoder = Utf8StreamDecoder::new();
        b.iter(|| black_box(decoder.decode(black_box(&ascii))));
    });

    // Chunks that each end mid-character
    let text = "✓ ok ".repeat(4096);
    let bytes = text.as_bytes();
    let chunks: Vec<&[u8]> = bytes.chunks(4095).collect();
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("split_multibyte", |b| {
        b.iter(|| {
            let mut decoder = Utf8StreamDecoder::new();
            for chunk in &chunks {
                black_box(decoder.decode(chunk));
            }
            black_box(decoder.finish())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_output_encoding,
    bench_input_decoding,
    bench_utf8_stream,
);

criterion_main!(benches);
