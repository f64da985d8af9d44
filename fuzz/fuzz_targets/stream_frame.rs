//! Fuzz target for stream frame parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use qlic_core::frame::StreamFrame;
use qlic_core::record::FrameReader;

fuzz_target!(|data: &[u8]| {
    let mut reader = FrameReader::new(data);
    if let Ok(frame) = StreamFrame::decode(&mut reader) {
        let mut encoded = Vec::new();
        frame.encode(&mut encoded).expect("decoded frame re-encodes");
        assert_eq!(encoded.len(), frame.encoded_len());

        let mut reader = FrameReader::new(&encoded);
        let back = StreamFrame::decode(&mut reader).expect("fresh encoding decodes");
        assert_eq!(back, frame);
    }
});
