// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the replicated state machine engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::{Lsn, LogId, Timestamp};

/// Synchronization lifecycle of an instance.
///
/// States move forward: `SyncSnapshot → SyncDeltas → Tailing`. A health
/// regression of the delta read stream while tailing drops the instance
/// back to `SyncDeltas` to re-anchor the backlog boundary. `Stopped` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Waiting for the base snapshot observed at startup.
    SyncSnapshot,
    /// Replaying the delta backlog up to the tail observed at startup.
    SyncDeltas,
    /// Live; every applied delta and fast-forward is delivered.
    Tailing,
    /// Torn down by [`stop()`](crate::ReplicatedStateMachine::stop) or
    /// `stop_at_tail`.
    Stopped,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyncSnapshot => write!(f, "SyncSnapshot"),
            Self::SyncDeltas => write!(f, "SyncDeltas"),
            Self::Tailing => write!(f, "Tailing"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What a caller wants confirmed about a written delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Resolve once the append is durable in the log.
    ConfirmAppendOnly,
    /// Resolve once this replica has read the delta back and applied it.
    ConfirmApplied,
}

/// Options for [`write_delta`](crate::ReplicatedStateMachine::write_delta).
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Only write if the local state is exactly at this version; `Stale`
    /// otherwise. The local version can never be behind the caller's.
    pub base_version: Option<Lsn>,
    /// Overrides both the append timeout and the confirmation timeout.
    pub timeout: Option<Duration>,
}

/// Errors surfaced by engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RsmError {
    /// Version conflict: the state moved past the caller's base version.
    #[error("version conflict: {0}")]
    Stale(String),

    /// Not possible right now (still replaying, or transiently unhealthy);
    /// retrying later may succeed.
    #[error("try again: {0}")]
    Again(String),

    /// Too many writes already await confirmation.
    #[error("pending confirmation queue is full")]
    NoBufs,

    /// The configuration lacks a prerequisite for this operation.
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("not found")]
    NotFound,

    /// A snapshot write is already in flight.
    #[error("snapshot already in progress")]
    InProgress,

    /// A payload failed to decode.
    #[error("malformed payload: {0}")]
    BadMsg(String),

    #[error("{0}")]
    Failed(String),

    /// The instance was stopped.
    #[error("state machine is stopped")]
    Stopped,
}

/// A failed write, carrying the append LSN when one was assigned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct WriteError {
    pub error: RsmError,
    /// The LSN the delta was appended at, or [`Lsn::INVALID`] if the write
    /// failed before (or during) the append.
    pub lsn: Lsn,
}

impl WriteError {
    pub(crate) fn new(error: RsmError, lsn: Lsn) -> Self {
        Self { error, lsn }
    }
}

/// Result of a [`snapshot()`](crate::ReplicatedStateMachine::snapshot) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// A snapshot at `version` was durably written.
    Written { version: Lsn },
    /// The store already held a snapshot covering the current state.
    UpToDate,
}

/// In-memory and durable versions of an instance, published on a watch
/// channel as they advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Versions {
    /// Version reflected in the local state.
    pub in_memory: Lsn,
    /// Version of the last snapshot this replica durably wrote.
    pub durable: Lsn,
}

/// A point-in-time dump of an instance's internals, for introspection and
/// admin tooling.
#[derive(Debug, Clone)]
pub struct DebugInfo {
    pub delta_log: LogId,
    pub snapshot_log: Option<LogId>,
    pub sync_state: SyncState,
    pub version: Lsn,
    pub last_snapshot_version: Lsn,
    pub delta_read_ptr: Lsn,
    pub delta_sync: Lsn,
    pub snapshot_sync: Lsn,
    pub waiting_for_snapshot: Lsn,
    pub delta_appends_in_flight: usize,
    pub pending_confirmations: usize,
    pub snapshot_in_flight: bool,
    /// When the last applied snapshot was written, epoch millis.
    pub last_snapshot_timestamp: Timestamp,
    pub bytes_since_last_snapshot: u64,
    pub records_since_last_snapshot: u64,
    pub delta_read_stream_healthy: bool,
}
