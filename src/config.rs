//! Configuration for a replicated state machine instance.
//!
//! # Example
//!
//! ```
//! use replistate::{LogId, RsmConfig};
//!
//! // Minimal config: delta log only, no snapshots.
//! let config = RsmConfig::new(LogId(1));
//! assert!(config.snapshot_log.is_none());
//! assert!(config.write_delta_header);
//!
//! // Delta log plus snapshot log, compressed snapshots.
//! let config = RsmConfig {
//!     snapshot_log: Some(LogId(2)),
//!     snapshot_compression: true,
//!     ..RsmConfig::new(LogId(1))
//! };
//! assert!(config.snapshot_compression);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::types::LogId;

/// Configuration for a [`ReplicatedStateMachine`](crate::ReplicatedStateMachine).
///
/// Only `delta_log` is required. Every other field has a sensible default;
/// deserializing a partial config fills in the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct RsmConfig {
    /// The log carrying incremental mutations. Required.
    pub delta_log: LogId,

    /// The log carrying serialized checkpoints. Without it (and without a
    /// snapshot store) the machine replays the delta log from the beginning
    /// and resets to the default state on trim.
    #[serde(default)]
    pub snapshot_log: Option<LogId>,

    /// Upper bound on writes awaiting applied-locally confirmation.
    #[serde(default = "default_max_pending_confirmation")]
    pub max_pending_confirmation: usize,

    /// Default time to wait for a confirmed write to be observed locally.
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,

    /// Append timeout for delta writes.
    #[serde(default = "default_delta_append_timeout_ms")]
    pub delta_append_timeout_ms: u64,

    /// Append timeout for snapshot writes.
    #[serde(default = "default_snapshot_append_timeout_ms")]
    pub snapshot_append_timeout_ms: u64,

    /// How long a newer snapshot must wait before it may replace live state
    /// while tailing. Also the grace before a stall is counted as such.
    #[serde(default = "default_fast_forward_grace_ms")]
    pub fast_forward_grace_ms: u64,

    /// Period of the time-based snapshot trigger.
    #[serde(default = "default_snapshotting_period_ms")]
    pub snapshotting_period_ms: u64,

    /// Initial delay of the snapshot-fetch retry backoff.
    #[serde(default = "default_snapshot_fetch_initial_ms")]
    pub snapshot_fetch_initial_ms: u64,

    /// Ceiling of the snapshot-fetch retry backoff.
    #[serde(default = "default_snapshot_fetch_max_ms")]
    pub snapshot_fetch_max_ms: u64,

    /// Prepend the framed header to written deltas. Required for
    /// applied-locally confirmation (the header carries the write's UUID).
    #[serde(default = "default_true")]
    pub write_delta_header: bool,

    /// Compress snapshot bodies with zstd.
    #[serde(default)]
    pub snapshot_compression: bool,

    /// Emit the newer snapshot format carrying the delta-log read pointer,
    /// which lets replicas skip deltas a snapshot has already absorbed.
    #[serde(default = "default_true")]
    pub include_read_pointer_in_snapshot: bool,

    /// Keep going when a snapshot cannot be decoded instead of stalling
    /// until a newer one is written.
    #[serde(default)]
    pub can_skip_bad_snapshot: bool,

    /// Stall delta reading on a DATALOSS gap until a covering snapshot
    /// arrives, rather than silently skipping the lost range.
    #[serde(default = "default_true")]
    pub stall_if_data_loss: bool,

    /// Notify subscribers for every delta applied during backlog replay,
    /// not just once the tail is reached.
    #[serde(default)]
    pub deliver_while_replaying: bool,

    /// Stop the machine once the delta-log tail observed at startup has
    /// been reached. Used for one-shot reads of the current state.
    #[serde(default)]
    pub stop_at_tail: bool,

    /// Ask the log substrate for all-send-all reads instead of
    /// single-copy delivery.
    #[serde(default)]
    pub force_all_send_all: bool,
}

impl RsmConfig {
    /// A config for `delta_log` with every optional field at its default.
    #[must_use]
    pub fn new(delta_log: LogId) -> Self {
        Self {
            delta_log,
            snapshot_log: None,
            max_pending_confirmation: default_max_pending_confirmation(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            delta_append_timeout_ms: default_delta_append_timeout_ms(),
            snapshot_append_timeout_ms: default_snapshot_append_timeout_ms(),
            fast_forward_grace_ms: default_fast_forward_grace_ms(),
            snapshotting_period_ms: default_snapshotting_period_ms(),
            snapshot_fetch_initial_ms: default_snapshot_fetch_initial_ms(),
            snapshot_fetch_max_ms: default_snapshot_fetch_max_ms(),
            write_delta_header: true,
            snapshot_compression: false,
            include_read_pointer_in_snapshot: true,
            can_skip_bad_snapshot: false,
            stall_if_data_loss: true,
            deliver_while_replaying: false,
            stop_at_tail: false,
            force_all_send_all: false,
        }
    }

    #[must_use]
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    #[must_use]
    pub fn delta_append_timeout(&self) -> Duration {
        Duration::from_millis(self.delta_append_timeout_ms)
    }

    #[must_use]
    pub fn snapshot_append_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_append_timeout_ms)
    }

    #[must_use]
    pub fn fast_forward_grace(&self) -> Duration {
        Duration::from_millis(self.fast_forward_grace_ms)
    }

    #[must_use]
    pub fn snapshotting_period(&self) -> Duration {
        Duration::from_millis(self.snapshotting_period_ms)
    }
}

fn default_max_pending_confirmation() -> usize {
    500
}

fn default_confirm_timeout_ms() -> u64 {
    10_000
}

fn default_delta_append_timeout_ms() -> u64 {
    10_000
}

fn default_snapshot_append_timeout_ms() -> u64 {
    30_000
}

fn default_fast_forward_grace_ms() -> u64 {
    10_000
}

fn default_snapshotting_period_ms() -> u64 {
    3_600_000
}

fn default_snapshot_fetch_initial_ms() -> u64 {
    1_000
}

fn default_snapshot_fetch_max_ms() -> u64 {
    600_000
}

fn default_true() -> bool {
    true
}
