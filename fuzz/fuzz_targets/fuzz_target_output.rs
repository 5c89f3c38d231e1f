// Run locally (from the repo root):
//   cargo +nightly fuzz run fuzz_target_output -- -runs=1000
#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use modbridge_wire::wire::codec::{decode_line, Line, LineCodec};
use tokio_util::codec::Decoder as _;

mod utils;

fuzz_target!(|data: &[u8]| {
    let input = utils::truncate(data);
    // First byte picks a small line cap so chunking gets exercised.
    let Some((&cap, rest)) = input.split_first() else {
        return;
    };
    let max_len = usize::from(cap >> 1).max(1);

    // Feed the stream in pieces the way a pipe delivers it. The low bit picks
    // the control codec, which also recognises frames.
    let mut codec = if cap & 1 == 1 {
        LineCodec::control(max_len)
    } else {
        LineCodec::new(max_len)
    };
    let mut buf = BytesMut::new();
    for piece in rest.chunks(7) {
        buf.extend_from_slice(piece);
        while let Some(line) = codec.decode(&mut buf).expect("decode is infallible") {
            check(&line, max_len);
        }
    }
    while let Some(line) = codec.decode_eof(&mut buf).expect("decode_eof is infallible") {
        check(&line, max_len);
    }
    assert!(buf.is_empty(), "bytes left after EOF");
});

fn check(line: &Line, max_len: usize) {
    match line {
        // A chunk may run past the cap to finish one character. Lossy UTF-8
        // turns each invalid byte into a 3-byte replacement.
        Line::Partial(text) => assert!(text.len() <= (max_len + 3) * 3),
        Line::Oversized { len, .. } => assert!(*len >= max_len),
        Line::Complete(_) => {}
    }
    // Interpreting the line never panics, whatever it contains.
    let _ = decode_line(line);
}
