//! The framer must produce identical output for a byte stream however it is
//! chunked, and must never panic on garbage input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pglink::protocol::Framer;

fuzz_target!(|data: &[u8]| {
    let Some((&chunk_seed, stream)) = data.split_first() else {
        return;
    };
    let chunk_len = usize::from(chunk_seed).max(1);

    // whole stream at once
    let mut whole = Framer::new();
    whole.extend(stream);
    let mut whole_out = Vec::new();
    let whole_err = loop {
        match whole.next_message() {
            Ok(Some(msg)) => whole_out.push(format!("{:?}", msg)),
            Ok(None) => break false,
            Err(_) => break true,
        }
    };

    // same stream, fixed-size chunks
    let mut chunked = Framer::new();
    let mut chunked_out = Vec::new();
    let mut chunked_err = false;
    'outer: for chunk in stream.chunks(chunk_len) {
        chunked.extend(chunk);
        loop {
            match chunked.next_message() {
                Ok(Some(msg)) => chunked_out.push(format!("{:?}", msg)),
                Ok(None) => break,
                Err(_) => {
                    chunked_err = true;
                    break 'outer;
                }
            }
        }
    }

    assert_eq!(whole_err, chunked_err);
    let shared = whole_out.len().min(chunked_out.len());
    assert_eq!(whole_out[..shared], chunked_out[..shared]);
    if !whole_err && !chunked_err {
        assert_eq!(whole_out, chunked_out);
    }
});
