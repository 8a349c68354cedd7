// Benchmark suite for the MSRP frame decoder and URI parser.

use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use msrp::codec::{BufferState, MessageBuffer, ParseMode};
use msrp::{Message, Uri};

fn sample_send(body_len: usize) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(
        b"MSRP d93kswow SEND\r\n\
          To-Path: msrp://bob.example.com:8888/9di4ea;tcp\r\n\
          From-Path: msrp://alicepc.example.com:7777/iau39;tcp\r\n\
          Content-Type: text/plain\r\n\
          Message-ID: 12339sdqwer\r\n\
          \r\n",
    );
    frame.extend((0..body_len).map(|i| b'a' + (i % 23) as u8));
    frame.extend_from_slice(b"-------d93kswow$");
    frame
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    group.measurement_time(Duration::from_secs(10));

    for body_len in [64usize, 4096] {
        let frame = sample_send(body_len);

        group.bench_function(format!("send_{body_len}"), |b| {
            b.iter(|| {
                let mut buffer = MessageBuffer::new(frame.len());
                buffer.writable()[..frame.len()].copy_from_slice(black_box(&frame));
                buffer.read(frame.len()).unwrap();
                assert_eq!(buffer.state(), BufferState::Complete);
                buffer.parse(ParseMode::CopyContents).unwrap()
            })
        });
    }

    // Chunked arrival exercises the rescan and end-token search paths.
    let frame = sample_send(4096);
    group.bench_function("send_4096_chunked", |b| {
        b.iter(|| {
            let mut buffer = MessageBuffer::new(frame.len());
            for piece in black_box(&frame).chunks(512) {
                buffer.writable()[..piece.len()].copy_from_slice(piece);
                buffer.read(piece.len()).unwrap();
            }
            assert_eq!(buffer.state(), BufferState::Complete);
        })
    });

    group.finish();
}

fn bench_message_encode(c: &mut Criterion) {
    let frame = sample_send(256);
    let mut buffer = MessageBuffer::new(frame.len());
    buffer.writable()[..frame.len()].copy_from_slice(&frame);
    buffer.read(frame.len()).unwrap();
    let message: Message = buffer.parse(ParseMode::CopyContents).unwrap();

    c.bench_function("message_encode", |b| {
        b.iter(|| black_box(&message).to_bytes().unwrap())
    });
}

fn bench_uri_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("uri_parse");

    for uri in [
        "msrp:127.0.0.1",
        "msrps://alice.example.com:9892/98cjs;tcp",
        "msrp://user@[a1b0::159:3cff:0a11:0cea]:956/sessionid",
    ] {
        group.bench_function(uri, |b| b.iter(|| black_box(uri).parse::<Uri>().unwrap()));
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_decode,
    bench_message_encode,
    bench_uri_parse
);
criterion_main!(benches);
