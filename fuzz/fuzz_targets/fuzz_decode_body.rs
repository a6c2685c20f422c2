//! Backend-message body decoding must never panic, whatever the bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pglink::protocol::decode_body;

fuzz_target!(|data: &[u8]| {
    let Some((&tag, body)) = data.split_first() else {
        return;
    };
    // errors are fine; panics and hangs are the bug
    let _ = decode_body(tag, body);
});
