//! Wire-codec properties checked against the public API.

use proptest::prelude::*;
use qlic_core::frame::StreamFrame;
use qlic_core::record::{decode_record, put_record, FrameReader, PacketWriter, MAX_RECORD_LEN};
use qlic_core::varint::{decode_varint, put_varint, varint_len, VARINT_MAX};
use qlic_core::{StreamId, WireError};

proptest! {
    #[test]
    fn varint_roundtrips(value in 0u64..=VARINT_MAX) {
        let mut buf = Vec::new();
        put_varint(&mut buf, value).unwrap();
        let (decoded, consumed) = decode_varint(&buf).unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(consumed, buf.len());
    }

    #[test]
    fn varint_encoding_is_minimum_width(value in 0u64..=VARINT_MAX) {
        let mut buf = Vec::new();
        put_varint(&mut buf, value).unwrap();
        let expected = match value {
            0..=63 => 1,
            64..=16_383 => 2,
            16_384..=1_073_741_823 => 4,
            _ => 8,
        };
        prop_assert_eq!(buf.len(), expected);
        prop_assert_eq!(varint_len(value).unwrap(), expected);
    }

    #[test]
    fn truncated_varint_is_incomplete_not_wrong(value in 0u64..=VARINT_MAX) {
        let mut buf = Vec::new();
        put_varint(&mut buf, value).unwrap();
        for cut in 0..buf.len() {
            prop_assert_eq!(decode_varint(&buf[..cut]), None);
        }
    }

    #[test]
    fn record_roundtrips(body in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let mut buf = Vec::new();
        put_record(&mut buf, &body).unwrap();
        let (decoded, consumed) = decode_record(&buf, MAX_RECORD_LEN).unwrap().unwrap();
        prop_assert_eq!(decoded, &body[..]);
        prop_assert_eq!(consumed, buf.len());
    }

    #[test]
    fn record_decode_never_reads_past_the_declared_length(
        body in proptest::collection::vec(any::<u8>(), 0..256),
        trailer in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut buf = Vec::new();
        put_record(&mut buf, &body).unwrap();
        let record_len = buf.len();
        buf.extend_from_slice(&trailer);

        let (decoded, consumed) = decode_record(&buf, MAX_RECORD_LEN).unwrap().unwrap();
        prop_assert_eq!(decoded, &body[..]);
        prop_assert_eq!(consumed, record_len);
    }

    #[test]
    fn declared_length_over_ceiling_is_fatal(excess in 1u64..1024) {
        let mut buf = Vec::new();
        put_varint(&mut buf, MAX_RECORD_LEN as u64 + excess).unwrap();
        let rejected = matches!(
            decode_record(&buf, MAX_RECORD_LEN),
            Err(WireError::RecordTooLong { .. })
        );
        prop_assert!(rejected);
    }

    #[test]
    fn packet_writer_output_decodes_to_its_payload(
        payload in proptest::collection::vec(any::<u8>(), 0..900),
    ) {
        let mut writer = PacketWriter::new(1024).unwrap();
        writer.put(&payload).unwrap();
        let packet = writer.finish().unwrap();

        prop_assert!(packet.len() <= 1024);
        let (body, consumed) = decode_record(&packet, MAX_RECORD_LEN).unwrap().unwrap();
        prop_assert_eq!(body, &payload[..]);
        prop_assert_eq!(consumed, packet.len());
    }

    #[test]
    fn stream_frame_roundtrips(
        index in 0u64..1_000_000,
        client in any::<bool>(),
        uni in any::<bool>(),
        fin in any::<bool>(),
        data in proptest::collection::vec(any::<u8>(), 0..1024),
    ) {
        let frame = StreamFrame::Data {
            id: StreamId::new(index, client, uni),
            fin,
            data,
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        prop_assert_eq!(buf.len(), frame.encoded_len());

        let mut reader = FrameReader::new(&buf);
        let decoded = StreamFrame::decode(&mut reader).unwrap();
        prop_assert!(reader.is_empty());
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn arbitrary_bytes_never_panic_the_parsers(
        bytes in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let _ = decode_varint(&bytes);
        let _ = decode_record(&bytes, MAX_RECORD_LEN);
        let mut reader = FrameReader::new(&bytes);
        let _ = StreamFrame::decode(&mut reader);
    }
}
