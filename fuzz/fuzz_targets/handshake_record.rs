//! Fuzz target for handshake record parsing
//!
//! Decoding arbitrary bytes must never panic, and anything that decodes
//! must survive a re-encode/decode trip unchanged. Byte-exact re-encoding
//! is not required: the decoder tolerates non-minimal varint widths the
//! encoder would never emit.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qlic_core::handshake::HandshakeRecord;
use qlic_core::record::FrameReader;

fuzz_target!(|data: &[u8]| {
    let mut reader = FrameReader::new(data);
    if let Ok(record) = HandshakeRecord::decode(&mut reader) {
        let encoded = record.to_bytes().expect("decoded record re-encodes");
        let mut reader = FrameReader::new(&encoded);
        let back = HandshakeRecord::decode(&mut reader).expect("fresh encoding decodes");
        assert_eq!(back, record);
    }
});
