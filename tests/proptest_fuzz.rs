//! Property-based fuzzing of the wire codecs.
//!
//! The framing is the compatibility surface between mixed-version
//! replicas, so it must hold up against arbitrary and corrupted bytes:
//! parsers never panic, tampered delta headers degrade to headerless
//! delivery, and snapshot bodies that do not decompress to their declared
//! length are rejected.

use proptest::prelude::*;
use uuid::Uuid;

use replistate::codec::delta::{decode_frame, encode_frame, DeltaHeader, DELTA_HEADER_SIZE};
use replistate::codec::snapshot::{self, SnapshotHeader, FORMAT_BASE, FORMAT_WITH_READ_PTR};
use replistate::Lsn;

proptest! {
    #[test]
    fn delta_frame_roundtrips(payload in proptest::collection::vec(any::<u8>(), 0..1024),
                              uuid_bytes in any::<[u8; 16]>()) {
        let uuid = Uuid::from_bytes(uuid_bytes);
        let framed = encode_frame(uuid, &payload);

        let (header, body) = decode_frame(&framed);
        prop_assert_eq!(header.uuid, uuid);
        prop_assert_eq!(header.header_sz as usize, DELTA_HEADER_SIZE);
        prop_assert_eq!(body, &payload[..]);
    }

    #[test]
    fn tampered_delta_frame_is_roundtrip_or_headerless(
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        uuid_bytes in any::<[u8; 16]>(),
        flip_at in 0usize..DELTA_HEADER_SIZE,
        flip_mask in 1u8..=255,
    ) {
        let uuid = Uuid::from_bytes(uuid_bytes);
        let mut framed = encode_frame(uuid, &payload);
        framed[flip_at] ^= flip_mask;

        // Either the tamper is undetectable in a benign field or the whole
        // frame degrades to a headerless body; never a torn read.
        let (header, body) = decode_frame(&framed);
        if header == DeltaHeader::default() {
            prop_assert_eq!(body.len(), framed.len());
        } else {
            prop_assert_eq!(body, &framed[header.header_sz as usize..]);
        }
    }

    #[test]
    fn delta_decoder_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let (header, body) = decode_frame(&bytes);
        // The body is always a suffix of the input.
        prop_assert_eq!(body, &bytes[bytes.len() - body.len()..]);
        prop_assert!(header.header_sz as usize <= bytes.len());
    }

    #[test]
    fn snapshot_roundtrips(body in proptest::collection::vec(any::<u8>(), 0..4096),
                           byte_offset in any::<u64>(),
                           offset in any::<u64>(),
                           base_version in any::<u64>(),
                           read_ptr in any::<u64>(),
                           with_read_ptr in any::<bool>(),
                           compress in any::<bool>()) {
        let header = SnapshotHeader {
            format_version: if with_read_ptr { FORMAT_WITH_READ_PTR } else { FORMAT_BASE },
            flags: 0,
            byte_offset,
            offset,
            base_version: Lsn(base_version),
            delta_log_read_ptr: Lsn(read_ptr),
        };
        let payload = snapshot::compose(header, &body, compress).unwrap();

        let (parsed, parsed_body) = snapshot::parse(&payload).unwrap();
        prop_assert_eq!(parsed.base_version, Lsn(base_version));
        prop_assert_eq!(parsed.byte_offset, byte_offset);
        prop_assert_eq!(parsed.offset, offset);
        if with_read_ptr {
            prop_assert_eq!(parsed.delta_log_read_ptr, Lsn(read_ptr));
        } else {
            prop_assert_eq!(parsed.delta_log_read_ptr, Lsn::INVALID);
        }
        prop_assert_eq!(parsed_body.as_ref(), &body[..]);
    }

    #[test]
    fn snapshot_parser_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        // Errors are fine; panics are not.
        let _ = snapshot::parse(&bytes);
    }

    #[test]
    fn corrupted_compressed_snapshot_is_rejected(
        body in proptest::collection::vec(any::<u8>(), 64..2048),
        cut in 1usize..32,
    ) {
        let header = SnapshotHeader {
            format_version: FORMAT_WITH_READ_PTR,
            flags: 0,
            byte_offset: 0,
            offset: 0,
            base_version: Lsn(1),
            delta_log_read_ptr: Lsn(1),
        };
        let payload = snapshot::compose(header, &body, true).unwrap();
        prop_assume!(cut < payload.len() - header.length_in_bytes());

        // Truncating the compressed body must never yield a "successful"
        // parse with the wrong contents.
        let truncated = &payload[..payload.len() - cut];
        match snapshot::parse(truncated) {
            Ok((_, parsed_body)) => prop_assert_eq!(parsed_body.as_ref(), &body[..]),
            Err(_) => {}
        }
    }
}
