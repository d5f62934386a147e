// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire framing for delta and snapshot records.
//!
//! Both frames are designed to survive mixed-version fleets: readers accept
//! any declared header size at or above the minimum and ignore fields they
//! do not understand, writers always emit their own full-size header.
//!
//! - [`delta`]: a checksummed header prepended to user delta payloads. The
//!   checksum doubles as the headerless-payload detector, so logs written
//!   by peers that never frame their deltas stay readable.
//! - [`snapshot`]: a versioned header followed by the serialized state,
//!   optionally zstd-compressed.

pub mod delta;
pub mod snapshot;

use thiserror::Error;

/// Failures while encoding or decoding snapshot frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload is too short to contain a snapshot header.
    #[error("snapshot header truncated: {0} byte payload")]
    TruncatedHeader(usize),

    /// The header declares a length that does not fit the payload.
    #[error("snapshot header length {declared} out of bounds for {payload} byte payload")]
    HeaderOutOfBounds { declared: usize, payload: usize },

    /// The compressed body does not carry its decompressed size.
    #[error("compressed snapshot body does not declare its decompressed size")]
    UnknownDecompressedSize,

    /// zstd decompression failed outright.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// The decompressed body length disagrees with the size stored in the
    /// compressed frame.
    #[error("decompressed length {actual} does not match {expected} found in frame")]
    LengthMismatch { expected: u64, actual: u64 },

    /// zstd compression failed.
    #[error("compression failed: {0}")]
    Compress(String),
}
