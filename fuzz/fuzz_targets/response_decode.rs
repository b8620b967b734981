#![no_main]

//! Fuzz target for response decoding.
//!
//! Server responses are untrusted. Decoding must return an error for
//! anything malformed, sealed or not, and never panic.

use ferry_delivery::codec::{self, SecretKey};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&status_byte, body)) = data.split_first() else {
        return;
    };
    let status = 100 + u16::from(status_byte) * 2;
    let key = SecretKey::from_secret("fuzzing-secret");

    let _ = codec::decode(body, status, None);
    let _ = codec::decode(body, status, Some(&key));
    let _ = key.open(body);
});
