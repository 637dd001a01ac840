//! Fuzz target for lock key derivation.
//!
//! Distinct stream keys must never produce the same lock key.

#![no_main]

use change_feed_sync::lock::lock_key;
use change_feed_sync::types::StreamKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: ((&str, &str), (&str, &str))| {
    let ((c1, e1), (c2, e2)) = data;
    let a = StreamKey::new(c1, e1);
    let b = StreamKey::new(c2, e2);

    let same_lock = lock_key("fuzz", &a) == lock_key("fuzz", &b);
    assert_eq!(same_lock, a == b);
});
