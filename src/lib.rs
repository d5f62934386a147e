//! # replistate
//!
//! A replicated state machine core for log-backed state: every replica
//! materializes the same in-memory value `T` by consuming an ordered,
//! durable delta log, optionally short-circuited by snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Snapshot Ingestor                       │
//! │  • base snapshot from store or snapshot log                 │
//! │  • fast-forward with grace period while tailing             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Delta Ingestor                         │
//! │  • replays the backlog, then tails live                     │
//! │  • skips deltas a snapshot already absorbed                 │
//! │  • stalls on TRIM/DATALOSS gaps until a snapshot covers them│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  State T + Subscription Bus                 │
//! │  • (state, delta, version) fan-out in insertion order       │
//! │  • confirmed writes resolve after local application         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The whole engine runs on a single driver task per instance; the
//! [`ReplicatedStateMachine`] handle talks to it over channels, so no
//! internal locks guard the core state.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use replistate::{
//!     ApplyError, Lsn, LogId, MemoryLogStore, ReplicatedStateMachine, RsmConfig,
//!     StateMachine, Timestamp, WriteMode, WriteOptions,
//! };
//!
//! /// Counter state machine: each delta is an i64 increment.
//! struct Counter;
//!
//! impl StateMachine for Counter {
//!     type State = i64;
//!     type Delta = i64;
//!
//!     fn make_default_state(&self, _version: Lsn) -> i64 { 0 }
//!     fn serialize_state(&self, state: &i64) -> Vec<u8> { state.to_le_bytes().to_vec() }
//!     fn deserialize_state(&self, bytes: &[u8], _v: Lsn, _ts: Timestamp) -> Result<i64, ApplyError> {
//!         let bytes: [u8; 8] = bytes.try_into().map_err(|_| ApplyError::Malformed("bad state".into()))?;
//!         Ok(i64::from_le_bytes(bytes))
//!     }
//!     fn deserialize_delta(&self, bytes: &[u8]) -> Result<i64, ApplyError> {
//!         let bytes: [u8; 8] = bytes.try_into().map_err(|_| ApplyError::Malformed("bad delta".into()))?;
//!         Ok(i64::from_le_bytes(bytes))
//!     }
//!     fn apply_delta(&self, delta: &i64, state: &mut i64, _lsn: Lsn, _ts: Timestamp) -> Result<(), ApplyError> {
//!         *state += *delta;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RsmConfig {
//!         snapshot_log: Some(LogId(2)),
//!         ..RsmConfig::new(LogId(1))
//!     };
//!     let rsm = ReplicatedStateMachine::new(config, Counter, Arc::new(MemoryLogStore::new()), None);
//!
//!     let _sub = rsm.subscribe(|state, _delta, version| {
//!         println!("counter = {} at version {}", state, version);
//!     });
//!
//!     rsm.start();
//!     rsm.wait(Duration::from_secs(10)).await;
//!
//!     // Confirmed write: resolves once this replica applied it locally.
//!     let lsn = rsm
//!         .write_delta(5i64.to_le_bytes().to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
//!         .await
//!         .expect("write failed");
//!     println!("applied at {}", lsn);
//!
//!     rsm.stop();
//! }
//! ```
//!
//! ## Guarantees
//!
//! - **Convergence**: replicas that observed the same version hold
//!   byte-identical state.
//! - **Monotonic versions**: subscribers never see a version older than
//!   one previously delivered.
//! - **Confirmed writes**: a [`WriteMode::ConfirmApplied`] write resolves
//!   only after the delta was read back and applied locally (or resolves
//!   with the precise reason it never will be).
//! - **Gap tolerance**: trims and data loss in the delta log stall the
//!   machine until a snapshot covering the hole arrives, then reading
//!   resumes exactly where it left off.
//!
//! ## Modules
//!
//! - [`machine`]: the engine and its public handle
//! - [`state`]: the [`StateMachine`] capability trait implemented per use
//! - [`store`]: log substrate and snapshot store traits + in-memory impls
//! - [`codec`]: delta and snapshot wire framing
//! - [`config`]: [`RsmConfig`]
//! - [`metrics`]: metrics facade helpers

pub mod codec;
pub mod config;
pub mod machine;
pub mod metrics;
pub mod state;
pub mod store;
mod timer;
pub mod types;

pub use config::RsmConfig;
pub use machine::{
    ConfirmResult, DebugInfo, ReplicatedStateMachine, RsmError, SnapshotOutcome,
    SubscriptionHandle, SyncState, Versions, WriteError, WriteMode, WriteOptions,
};
pub use state::{ApplyError, StateMachine};
pub use store::memory::{MemoryLogStore, MemorySnapshotStore};
pub use store::traits::{
    LogStore, ReadEvent, ReadOptions, ReadStream, SnapshotFetch, SnapshotStore, SnapshotWrite,
    StoreError,
};
pub use types::{Gap, GapType, Lsn, LogId, Record, SnapshotAttributes, Timestamp};
