//! Fuzz target for the receiving half of a transfer
//!
//! Feeds an arbitrary stream of DATA units and checks the receiver never
//! accepts a unit out of order or past the sentinel.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rudp_core::Receiver;
use rudp_core::transfer::Delivery;

const FIRST: u64 = 1_000;

fuzz_target!(|data: &[u8]| {
    let mut rx = Receiver::new(FIRST);
    for chunk in data.chunks(2) {
        let seq = FIRST + u64::from(chunk[0] % 16);
        let payload = &chunk[1..];

        let expected = rx.next_expected();
        let finished = rx.is_finished();
        let out = match rx.on_data(seq, payload) {
            Ok(out) => out,
            Err(_) => return,
        };

        if out.delivery == Delivery::Applied {
            assert_eq!(seq, expected);
            assert!(!finished);
            assert_eq!(rx.next_expected(), expected + 1);
        } else {
            assert_eq!(rx.next_expected(), expected);
        }
    }
});
