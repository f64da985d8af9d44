//! Fuzz target for record and packet parsing
//!
//! `decode_record` must never panic and never hand back a slice that reads
//! past the declared length.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qlic_core::record::{decode_record, FrameReader, MAX_RECORD_LEN};

fuzz_target!(|data: &[u8]| {
    if let Ok(Some((body, consumed))) = decode_record(data, MAX_RECORD_LEN) {
        assert!(consumed <= data.len());
        assert!(body.len() <= MAX_RECORD_LEN);
    }

    // The borrowing reader over arbitrary bytes: errors, never panics.
    let mut reader = FrameReader::new(data);
    while !reader.is_empty() {
        if reader.record().is_err() {
            break;
        }
    }
});
