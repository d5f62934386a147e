// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core wire-level types: log positions, records and gaps.
//!
//! Every log is an append-only sequence addressed by [`Lsn`] (log sequence
//! number). Readers observe a log as an ordered mix of [`Record`]s and
//! [`Gap`]s; a gap covers a range of positions that will never produce a
//! record (trimmed, lost, or simply never assigned).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`].
#[must_use]
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// A position in a single log.
///
/// LSNs are 64-bit and strictly increasing within a log. Three sentinels
/// exist: [`Lsn::INVALID`] (zero, "no position"), [`Lsn::OLDEST`] (the first
/// assignable position) and [`Lsn::MAX`] (read forever).
///
/// # Example
///
/// ```
/// use replistate::Lsn;
///
/// assert!(Lsn::INVALID < Lsn::OLDEST);
/// assert_eq!(Lsn(41).next(), Lsn(42));
/// assert_eq!(format!("{}", Lsn(42)), "42");
/// assert_eq!(format!("{}", Lsn::INVALID), "INVALID");
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    /// "No position". Also the version of a state machine that has not
    /// applied anything yet.
    pub const INVALID: Lsn = Lsn(0);
    /// The first position a log can assign.
    pub const OLDEST: Lsn = Lsn(1);
    /// Highest possible position; used as an unbounded `until` for readers.
    pub const MAX: Lsn = Lsn(u64::MAX);

    /// The position immediately after this one (saturating at [`Lsn::MAX`]).
    #[must_use]
    pub fn next(self) -> Lsn {
        Lsn(self.0.saturating_add(1))
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Lsn::INVALID => write!(f, "INVALID"),
            Lsn::MAX => write!(f, "MAX"),
            Lsn(n) => write!(f, "{}", n),
        }
    }
}

/// Identifier of a log within the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub u64);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record read from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub lsn: Lsn,
    /// Append time, epoch millis.
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

/// The reason a range of LSNs has no records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapType {
    /// Positions skipped by the sequencer; benign.
    Bridge,
    /// A single unassigned position; benign.
    Hole,
    /// Records removed by retention.
    Trim,
    /// Records that were lost and cannot be recovered from the log.
    DataLoss,
}

impl fmt::Display for GapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => write!(f, "BRIDGE"),
            Self::Hole => write!(f, "HOLE"),
            Self::Trim => write!(f, "TRIM"),
            Self::DataLoss => write!(f, "DATALOSS"),
        }
    }
}

/// A recordless range `[lo, hi]` reported by a log reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub kind: GapType,
    pub lo: Lsn,
    pub hi: Lsn,
}

/// Metadata attached to a snapshot blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotAttributes {
    /// The delta-log version the snapshot was taken at.
    pub base_version: Lsn,
    /// When the snapshot was written, epoch millis.
    pub timestamp: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_sentinels_order() {
        assert!(Lsn::INVALID < Lsn::OLDEST);
        assert!(Lsn::OLDEST < Lsn::MAX);
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn::OLDEST.is_valid());
    }

    #[test]
    fn test_lsn_next_saturates() {
        assert_eq!(Lsn::INVALID.next(), Lsn::OLDEST);
        assert_eq!(Lsn::MAX.next(), Lsn::MAX);
    }

    #[test]
    fn test_lsn_display() {
        assert_eq!(format!("{}", Lsn(7)), "7");
        assert_eq!(format!("{}", Lsn::INVALID), "INVALID");
        assert_eq!(format!("{}", Lsn::MAX), "MAX");
    }

    #[test]
    fn test_gap_type_display() {
        assert_eq!(format!("{}", GapType::Trim), "TRIM");
        assert_eq!(format!("{}", GapType::DataLoss), "DATALOSS");
    }
}
