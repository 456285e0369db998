//! Fuzz target for the message codec
//!
//! Arbitrary datagrams must decode to `Ok` or `Err`, never panic, and
//! anything that decodes must re-encode to something that decodes the same.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rudp_core::{Message, wire};

fuzz_target!(|data: &[u8]| {
    let _ = wire::is_sealed(data);

    if let Ok(message) = Message::decode(data) {
        let encoded = message.encode();
        assert_eq!(Message::decode(&encoded).ok(), Some(message));
    }
});
