//! Fuzz target for the varint codec
//!
//! The decoder must never panic on arbitrary bytes, and anything it
//! decodes must re-encode to a value-identical result.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qlic_core::varint::{decode_varint, put_varint};

fuzz_target!(|data: &[u8]| {
    if let Some((value, consumed)) = decode_varint(data) {
        assert!(consumed <= data.len());
        // Re-encode at minimum width; the value must survive the trip even
        // when the input used a wider encoding.
        let mut buf = Vec::new();
        put_varint(&mut buf, value).expect("decoded value is in range");
        let (back, _) = decode_varint(&buf).expect("fresh encoding decodes");
        assert_eq!(back, value);
    }
});
