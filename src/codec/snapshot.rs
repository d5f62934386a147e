// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Framed snapshot payloads.
//!
//! A snapshot is `header || body` where the body is the serialized state,
//! optionally zstd-compressed (flagged in the header). The header exists in
//! two format versions:
//!
//! | version | layout |
//! |---|---|
//! | `FORMAT_BASE` | format_version, flags, byte_offset, offset, base_version (32 bytes) |
//! | `FORMAT_WITH_READ_PTR` | the above + header length + delta_log_read_ptr (44 bytes) |
//!
//! Readers accept any declared header length at or above the version's
//! minimum and skip trailing bytes they do not understand, so future
//! format versions stay readable. Compressed bodies must decompress to
//! exactly the length stored in the zstd frame.

use std::borrow::Cow;

use super::CodecError;
use crate::types::Lsn;

/// Original header format: no delta-log read pointer.
pub const FORMAT_BASE: u32 = 0;
/// Header carries its own length and the delta-log read pointer.
pub const FORMAT_WITH_READ_PTR: u32 = 1;

/// The body is zstd-compressed.
pub const FLAG_ZSTD_COMPRESSION: u32 = 1;

/// zstd level used for snapshot bodies.
const ZSTD_LEVEL: i32 = 5;

const BASE_HEADER_SIZE: usize = 32;
const READ_PTR_HEADER_SIZE: usize = 44;

/// Parsed snapshot frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: u32,
    pub flags: u32,
    /// Delta-log bytes consumed since the previous snapshot, at the time
    /// this snapshot was taken.
    pub byte_offset: u64,
    /// Delta-log records consumed since the previous snapshot.
    pub offset: u64,
    /// The delta-log version this snapshot reflects.
    pub base_version: Lsn,
    /// Highest delta-log LSN the snapshotting replica had read; deltas at
    /// or below it are covered by this snapshot even when `base_version`
    /// is older. [`Lsn::INVALID`] for [`FORMAT_BASE`] headers.
    pub delta_log_read_ptr: Lsn,
}

impl SnapshotHeader {
    /// Serialized size of this header.
    #[must_use]
    pub fn length_in_bytes(&self) -> usize {
        if self.format_version >= FORMAT_WITH_READ_PTR {
            READ_PTR_HEADER_SIZE
        } else {
            BASE_HEADER_SIZE
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.length_in_bytes());
        buf.extend_from_slice(&self.format_version.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.byte_offset.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.base_version.0.to_le_bytes());
        if self.format_version >= FORMAT_WITH_READ_PTR {
            buf.extend_from_slice(&(READ_PTR_HEADER_SIZE as u32).to_le_bytes());
            buf.extend_from_slice(&self.delta_log_read_ptr.0.to_le_bytes());
        }
        buf
    }

    /// Parse a header off the front of `payload`; returns the header and
    /// the number of bytes it occupied.
    pub fn deserialize(payload: &[u8]) -> Result<(SnapshotHeader, usize), CodecError> {
        if payload.len() < BASE_HEADER_SIZE {
            return Err(CodecError::TruncatedHeader(payload.len()));
        }

        let format_version = read_u32(payload, 0);
        let flags = read_u32(payload, 4);
        let byte_offset = read_u64(payload, 8);
        let offset = read_u64(payload, 16);
        let base_version = Lsn(read_u64(payload, 24));

        if format_version < FORMAT_WITH_READ_PTR {
            let header = SnapshotHeader {
                format_version,
                flags,
                byte_offset,
                offset,
                base_version,
                delta_log_read_ptr: Lsn::INVALID,
            };
            return Ok((header, BASE_HEADER_SIZE));
        }

        if payload.len() < READ_PTR_HEADER_SIZE {
            return Err(CodecError::TruncatedHeader(payload.len()));
        }
        let declared = read_u32(payload, 32) as usize;
        if declared < READ_PTR_HEADER_SIZE || declared > payload.len() {
            return Err(CodecError::HeaderOutOfBounds {
                declared,
                payload: payload.len(),
            });
        }
        let delta_log_read_ptr = Lsn(read_u64(payload, 36));

        let header = SnapshotHeader {
            format_version,
            flags,
            byte_offset,
            offset,
            base_version,
            delta_log_read_ptr,
        };
        // Skip any trailing header bytes a newer writer may have added.
        Ok((header, declared))
    }
}

/// Build a snapshot payload from a header and serialized state body.
///
/// When `compress` is set, the body is zstd-compressed and
/// [`FLAG_ZSTD_COMPRESSION`] is set on the emitted header.
pub fn compose(mut header: SnapshotHeader, body: &[u8], compress: bool) -> Result<Vec<u8>, CodecError> {
    let body: Cow<'_, [u8]> = if compress {
        header.flags |= FLAG_ZSTD_COMPRESSION;
        Cow::Owned(
            zstd::bulk::compress(body, ZSTD_LEVEL).map_err(|e| CodecError::Compress(e.to_string()))?,
        )
    } else {
        Cow::Borrowed(body)
    };

    let mut buf = header.serialize();
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Parse a snapshot payload into its header and (decompressed) body.
pub fn parse(payload: &[u8]) -> Result<(SnapshotHeader, Cow<'_, [u8]>), CodecError> {
    let (header, header_sz) = SnapshotHeader::deserialize(payload)?;
    let body = &payload[header_sz..];

    if header.flags & FLAG_ZSTD_COMPRESSION == 0 {
        return Ok((header, Cow::Borrowed(body)));
    }

    let expected = zstd::zstd_safe::get_frame_content_size(body)
        .map_err(|_| CodecError::Decompress("invalid zstd frame header".into()))?
        .ok_or(CodecError::UnknownDecompressedSize)?;
    let decompressed = zstd::bulk::decompress(body, expected as usize)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    if decompressed.len() as u64 != expected {
        return Err(CodecError::LengthMismatch {
            expected,
            actual: decompressed.len() as u64,
        });
    }

    Ok((header, Cow::Owned(decompressed)))
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or_default())
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_v1() -> SnapshotHeader {
        SnapshotHeader {
            format_version: FORMAT_WITH_READ_PTR,
            flags: 0,
            byte_offset: 4096,
            offset: 17,
            base_version: Lsn(120),
            delta_log_read_ptr: Lsn(130),
        }
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let body = b"serialized state bytes";
        let payload = compose(header_v1(), body, false).unwrap();

        let (header, parsed_body) = parse(&payload).unwrap();
        assert_eq!(header, header_v1());
        assert_eq!(parsed_body.as_ref(), body);
    }

    #[test]
    fn test_roundtrip_compressed() {
        let body = vec![7u8; 64 * 1024];
        let payload = compose(header_v1(), &body, true).unwrap();
        assert!(payload.len() < body.len());

        let (header, parsed_body) = parse(&payload).unwrap();
        assert_ne!(header.flags & FLAG_ZSTD_COMPRESSION, 0);
        assert_eq!(parsed_body.as_ref(), &body[..]);
    }

    #[test]
    fn test_base_format_has_no_read_ptr() {
        let header = SnapshotHeader {
            format_version: FORMAT_BASE,
            delta_log_read_ptr: Lsn(999), // not representable in this format
            ..header_v1()
        };
        let payload = compose(header, b"state", false).unwrap();
        assert_eq!(payload.len(), BASE_HEADER_SIZE + 5);

        let (parsed, _) = parse(&payload).unwrap();
        assert_eq!(parsed.delta_log_read_ptr, Lsn::INVALID);
        assert_eq!(parsed.base_version, Lsn(120));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let err = parse(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedHeader(10)));
    }

    #[test]
    fn test_declared_length_out_of_bounds_rejected() {
        let mut payload = compose(header_v1(), b"", false).unwrap();
        payload[32..36].copy_from_slice(&500u32.to_le_bytes());
        let err = parse(&payload).unwrap_err();
        assert!(matches!(err, CodecError::HeaderOutOfBounds { declared: 500, .. }));
    }

    #[test]
    fn test_future_header_with_trailing_bytes() {
        // A newer writer appending 8 unknown bytes to the header and
        // declaring the larger length.
        let mut payload = header_v1().serialize();
        payload[32..36].copy_from_slice(&((READ_PTR_HEADER_SIZE + 8) as u32).to_le_bytes());
        payload.extend_from_slice(&[0xEE; 8]);
        payload.extend_from_slice(b"the body");

        let (header, body) = parse(&payload).unwrap();
        assert_eq!(header.base_version, Lsn(120));
        assert_eq!(body.as_ref(), b"the body");
    }

    #[test]
    fn test_corrupt_compressed_body_rejected() {
        let payload = compose(header_v1(), &vec![3u8; 4096], true).unwrap();
        // Truncating the compressed body breaks decompression.
        let truncated = &payload[..payload.len() - 10];
        assert!(parse(truncated).is_err());
    }

    #[test]
    fn test_tampered_compressed_body_rejected() {
        let body = vec![9u8; 2048];
        let mut compressed = zstd::bulk::compress(&body, ZSTD_LEVEL).unwrap();
        let last = compressed.len() - 1;
        compressed[last] ^= 0x01;

        let mut payload = SnapshotHeader {
            flags: FLAG_ZSTD_COMPRESSION,
            ..header_v1()
        }
        .serialize();
        payload.extend_from_slice(&compressed);

        // Either decompression fails outright or the produced length does
        // not match the size stored in the frame; both are rejections.
        assert!(parse(&payload).is_err());
    }

    #[test]
    fn test_body_without_compression_flag_is_passed_through() {
        // A compressed-looking body with the flag unset is not touched.
        let raw = zstd::bulk::compress(b"not decompressed", ZSTD_LEVEL).unwrap();
        let payload = compose(header_v1(), &raw, false).unwrap();
        let (_, body) = parse(&payload).unwrap();
        assert_eq!(body.as_ref(), &raw[..]);
    }
}
