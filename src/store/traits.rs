// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator traits: the log substrate and the snapshot store.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Gap, Lsn, LogId, Record, SnapshotAttributes, Timestamp};

/// Failures reported by the log substrate or snapshot store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("operation timed out")]
    Timeout,
    #[error("not found")]
    NotFound,
    #[error("store backend error: {0}")]
    Backend(String),
}

/// One observation from a log reader.
#[derive(Debug, Clone)]
pub enum ReadEvent {
    Record(Record),
    Gap(Gap),
    /// The reader's connection health changed. Delivered out of band with
    /// respect to LSN ordering.
    HealthChange(bool),
}

/// Knobs forwarded to the substrate when opening a reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Request all-send-all delivery instead of single-copy delivery.
    /// Replicated state machines are low-volume logs, so trading bandwidth
    /// for failover latency is acceptable.
    pub force_all_send_all: bool,
}

/// An open reader over one log.
///
/// Records and gaps are delivered in strict LSN order: each record's LSN
/// and each gap's `hi` is strictly greater than everything delivered
/// before it. `next()` must be cancel safe; the engine polls it inside a
/// `select!` and will drop and re-create the future between events.
#[async_trait]
pub trait ReadStream: Send {
    /// The next event, or `None` once the reader passed its `until` bound
    /// or the log went away.
    async fn next(&mut self) -> Option<ReadEvent>;
}

/// The log substrate: ordered, durable, append-only logs.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// The highest LSN currently in `log`, or [`Lsn::INVALID`] for an empty
    /// log. Must complete; the engine issues this without a timeout and
    /// never cancels it.
    async fn tail_lsn(&self, log: LogId) -> Lsn;

    /// Open a reader over `[start, until]`.
    fn open_reader(
        &self,
        log: LogId,
        start: Lsn,
        until: Lsn,
        options: ReadOptions,
    ) -> Box<dyn ReadStream>;

    /// Append a payload, returning its assigned LSN.
    async fn append(
        &self,
        log: LogId,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Lsn, StoreError>;

    /// The highest LSN whose record was appended at or before `cutoff`,
    /// or [`Lsn::INVALID`] if there is none.
    async fn find_time(
        &self,
        log: LogId,
        cutoff: Timestamp,
        timeout: Duration,
    ) -> Result<Lsn, StoreError>;

    /// Drop all records at or below `up_to`.
    async fn trim(&self, log: LogId, up_to: Lsn, timeout: Duration) -> Result<(), StoreError>;
}

/// Result of fetching a snapshot from a [`SnapshotStore`].
#[derive(Debug, Clone)]
pub enum SnapshotFetch {
    /// A snapshot at or past the requested version.
    Snapshot {
        blob: Vec<u8>,
        attrs: SnapshotAttributes,
    },
    /// The store has nothing newer than what the caller already holds.
    UpToDate,
    /// The store holds no snapshot at all.
    Empty,
}

/// Result of writing a snapshot to a [`SnapshotStore`].
#[derive(Debug, Clone, Copy)]
pub enum SnapshotWrite {
    /// The snapshot was durably stored at this version.
    Written(Lsn),
    /// The store already held this version or newer.
    UpToDate(Lsn),
}

/// A store of serialized checkpoints, keyed by base version.
///
/// Transient fetch failures are retried by the engine on an exponential
/// backoff, so implementations should return errors rather than block.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Fetch the newest snapshot with `base_version >= min_version`.
    async fn get_snapshot(&self, min_version: Lsn) -> Result<SnapshotFetch, StoreError>;

    /// The newest version known to be durable, for trimming the delta log.
    async fn durable_version(&self) -> Result<Option<Lsn>, StoreError>;

    /// Store a snapshot payload for `version`.
    async fn write_snapshot(
        &self,
        version: Lsn,
        payload: Vec<u8>,
    ) -> Result<SnapshotWrite, StoreError>;

    /// Whether this replica may write snapshots through this store.
    /// Advisory; consulted by the time-based snapshot trigger.
    fn is_writable(&self) -> bool;
}
