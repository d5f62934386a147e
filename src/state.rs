// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The state/delta capability set a replicated state machine is built over.

use thiserror::Error;

use crate::types::{Lsn, Timestamp};

/// Why a snapshot or delta could not take effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// The payload could not be decoded at all.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The payload decoded but the mutation was refused by the state.
    #[error("{0}")]
    Rejected(String),
}

/// The pluggable behavior of a replicated state machine: how to build,
/// serialize and mutate the materialized state.
///
/// The engine owns one value of the implementing type and calls it
/// exclusively from its driver task, so implementations need no interior
/// synchronization. All methods must be deterministic: every replica feeds
/// them the same records in the same order and must end up with the same
/// state.
///
/// # Example
///
/// ```
/// use replistate::{ApplyError, Lsn, StateMachine, Timestamp};
///
/// /// An append-only list of strings; each delta is one UTF-8 entry.
/// struct EntryList;
///
/// impl StateMachine for EntryList {
///     type State = Vec<String>;
///     type Delta = String;
///
///     fn make_default_state(&self, _version: Lsn) -> Vec<String> {
///         Vec::new()
///     }
///
///     fn serialize_state(&self, state: &Vec<String>) -> Vec<u8> {
///         state.join("\n").into_bytes()
///     }
///
///     fn deserialize_state(
///         &self,
///         bytes: &[u8],
///         _base_version: Lsn,
///         _timestamp: Timestamp,
///     ) -> Result<Vec<String>, ApplyError> {
///         let text = std::str::from_utf8(bytes)
///             .map_err(|e| ApplyError::Malformed(e.to_string()))?;
///         Ok(text.lines().map(str::to_owned).collect())
///     }
///
///     fn deserialize_delta(&self, bytes: &[u8]) -> Result<String, ApplyError> {
///         String::from_utf8(bytes.to_vec()).map_err(|e| ApplyError::Malformed(e.to_string()))
///     }
///
///     fn apply_delta(
///         &self,
///         delta: &String,
///         state: &mut Vec<String>,
///         _lsn: Lsn,
///         _timestamp: Timestamp,
///     ) -> Result<(), ApplyError> {
///         state.push(delta.clone());
///         Ok(())
///     }
/// }
/// ```
pub trait StateMachine: Send + 'static {
    /// The materialized value every replica converges on.
    type State: Send + 'static;
    /// One incremental mutation.
    type Delta: Send + 'static;

    /// The state a replica starts from before any snapshot or delta.
    fn make_default_state(&self, version: Lsn) -> Self::State;

    /// Serialize the state into a snapshot body.
    fn serialize_state(&self, state: &Self::State) -> Vec<u8>;

    /// Rebuild a state from a snapshot body.
    fn deserialize_state(
        &self,
        bytes: &[u8],
        base_version: Lsn,
        timestamp: Timestamp,
    ) -> Result<Self::State, ApplyError>;

    /// Decode one delta body.
    fn deserialize_delta(&self, bytes: &[u8]) -> Result<Self::Delta, ApplyError>;

    /// Apply a delta in place. On [`ApplyError::Rejected`] the state must be
    /// left untouched; the engine will not advance its version for it.
    fn apply_delta(
        &self,
        delta: &Self::Delta,
        state: &mut Self::State,
        lsn: Lsn,
        timestamp: Timestamp,
    ) -> Result<(), ApplyError>;

    /// Called once when the base snapshot (or default state) is settled,
    /// before delta replay begins.
    fn on_initial_state(&self, _state: &Self::State) {}

    /// Called after this replica durably wrote a snapshot of `payload_size`
    /// bytes.
    fn on_snapshot_created(&self, _payload_size: usize) {}

    /// Whether this replica is designated to emit time-based snapshots.
    /// Consulted on every periodic trigger alongside the snapshot store's
    /// own writability.
    fn can_snapshot(&self) -> bool {
        false
    }
}
