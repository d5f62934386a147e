// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Framed delta records.
//!
//! A framed delta is `header || user_payload`. The header starts with a
//! fixed prefix carrying a CRC32 checksum and the real header size, which
//! makes the frame self-describing in both directions:
//!
//! - an old reader facing a longer, newer header skips `header_sz` bytes
//!   and ignores the fields it cannot name;
//! - a new reader facing a shorter, older header reads what is there and
//!   leaves the remaining fields default-initialized;
//! - a reader facing an unframed payload (the writer had headers disabled)
//!   fails the checksum and treats the whole payload as the delta body.
//!
//! The checksum covers `[header_sz .. header_sz_declared)`, i.e. everything
//! after the checksum field itself.

use uuid::Uuid;

/// Size of the header emitted by current writers.
pub const DELTA_HEADER_SIZE: usize = 24;

/// Smallest header any reader will accept: checksum, size, flags.
pub const MIN_DELTA_HEADER_SIZE: usize = 8;

/// Offset of `header_sz`; the checksum covers the header from here on.
const CHECKSUM_COVER_START: usize = 4;

const UUID_OFFSET: usize = 8;

/// Parsed delta frame header.
///
/// `Default` is the headerless header: zero size, nil UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaHeader {
    /// Declared header size in the frame, 0 when headerless.
    pub header_sz: u16,
    /// Reserved; always written as zero.
    pub flags: u16,
    /// Identity of the write, nil when the writer did not frame the delta
    /// or the header predates UUIDs.
    pub uuid: Uuid,
}

/// Frame `payload` with a header carrying `uuid`.
#[must_use]
pub fn encode_frame(uuid: Uuid, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DELTA_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&[0u8; 4]); // checksum, patched below
    buf.extend_from_slice(&(DELTA_HEADER_SIZE as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes()); // flags
    buf.extend_from_slice(uuid.as_bytes());
    debug_assert_eq!(buf.len(), DELTA_HEADER_SIZE);

    let checksum = crc32fast::hash(&buf[CHECKSUM_COVER_START..DELTA_HEADER_SIZE]);
    buf[0..4].copy_from_slice(&checksum.to_le_bytes());

    buf.extend_from_slice(payload);
    buf
}

/// Split a payload into `(header, delta_body)`.
///
/// Never fails: anything that does not checksum as a valid header is
/// returned whole as the body with a default header, so the delta
/// deserializer always gets a chance at the bytes.
#[must_use]
pub fn decode_frame(payload: &[u8]) -> (DeltaHeader, &[u8]) {
    match try_parse_header(payload) {
        Some(header) => (header, &payload[header.header_sz as usize..]),
        None => (DeltaHeader::default(), payload),
    }
}

fn try_parse_header(payload: &[u8]) -> Option<DeltaHeader> {
    if payload.len() < MIN_DELTA_HEADER_SIZE {
        return None;
    }

    let header_sz = u16::from_le_bytes([payload[4], payload[5]]) as usize;
    if header_sz < MIN_DELTA_HEADER_SIZE || header_sz > payload.len() {
        return None;
    }

    let stored = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if crc32fast::hash(&payload[CHECKSUM_COVER_START..header_sz]) != stored {
        return None;
    }

    let flags = u16::from_le_bytes([payload[6], payload[7]]);
    // A header too short to carry the UUID leaves it nil; extra header
    // bytes beyond what we know are skipped.
    let uuid = if header_sz >= UUID_OFFSET + 16 {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&payload[UUID_OFFSET..UUID_OFFSET + 16]);
        Uuid::from_bytes(bytes)
    } else {
        Uuid::nil()
    };

    Some(DeltaHeader {
        header_sz: header_sz as u16,
        flags,
        uuid,
    })
}
