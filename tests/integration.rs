//! Integration tests for the replicated state machine engine.
//!
//! Everything runs against the in-memory log substrate, which lets tests
//! inject gaps, health transitions and trims deterministically.
//!
//! # Test Organization
//! - `happy_*` - Normal operation: bootstrap, tailing, confirmed writes,
//!   snapshots, subscriptions
//! - `failure_*` - Gap stalls, fast-forward races, lost confirmations,
//!   bad snapshots, unhealthy streams
//! - `admin_*` - Trim, block-state-delivery, stop, debug info

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use replistate::codec::snapshot::{self as snapshot_codec, SnapshotHeader, FORMAT_WITH_READ_PTR};
use replistate::{
    ApplyError, DebugInfo, GapType, Lsn, LogId, MemoryLogStore, MemorySnapshotStore,
    ReplicatedStateMachine, RsmConfig, RsmError, SnapshotOutcome, SnapshotStore, StateMachine,
    SyncState, Timestamp, WriteMode, WriteOptions,
};

const DELTA_LOG: LogId = LogId(1);
const SNAPSHOT_LOG: LogId = LogId(2);

const APPEND_TIMEOUT: Duration = Duration::from_secs(1);
const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Test state machine: an append-only list of strings
// =============================================================================

/// Each delta is a UTF-8 string appended to the state; a delta starting
/// with "fail:" is refused by apply.
struct EntryList {
    designated_snapshotter: bool,
}

impl EntryList {
    fn new() -> Self {
        Self {
            designated_snapshotter: false,
        }
    }

    fn snapshotter() -> Self {
        Self {
            designated_snapshotter: true,
        }
    }
}

impl StateMachine for EntryList {
    type State = Vec<String>;
    type Delta = String;

    fn make_default_state(&self, _version: Lsn) -> Vec<String> {
        Vec::new()
    }

    fn serialize_state(&self, state: &Vec<String>) -> Vec<u8> {
        serde_json::to_vec(state).unwrap_or_default()
    }

    fn deserialize_state(
        &self,
        bytes: &[u8],
        _base_version: Lsn,
        _timestamp: Timestamp,
    ) -> Result<Vec<String>, ApplyError> {
        serde_json::from_slice(bytes).map_err(|e| ApplyError::Malformed(e.to_string()))
    }

    fn deserialize_delta(&self, bytes: &[u8]) -> Result<String, ApplyError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| ApplyError::Malformed(e.to_string()))
    }

    fn apply_delta(
        &self,
        delta: &String,
        state: &mut Vec<String>,
        _lsn: Lsn,
        _timestamp: Timestamp,
    ) -> Result<(), ApplyError> {
        if let Some(reason) = delta.strip_prefix("fail:") {
            return Err(ApplyError::Rejected(reason.to_string()));
        }
        state.push(delta.clone());
        Ok(())
    }

    fn can_snapshot(&self) -> bool {
        self.designated_snapshotter
    }
}

// =============================================================================
// Helpers
// =============================================================================

type Rsm = ReplicatedStateMachine<EntryList>;

#[derive(Debug, Clone, PartialEq)]
struct Update {
    version: Lsn,
    delta: Option<String>,
    state: Vec<String>,
}

#[derive(Clone, Default)]
struct Recorder {
    updates: Arc<Mutex<Vec<Update>>>,
}

impl Recorder {
    fn attach(&self, rsm: &Rsm) -> replistate::SubscriptionHandle {
        let updates = self.updates.clone();
        rsm.subscribe(move |state, delta, version| {
            updates.lock().push(Update {
                version,
                delta: delta.cloned(),
                state: state.clone(),
            });
        })
    }

    fn updates(&self) -> Vec<Update> {
        self.updates.lock().clone()
    }

    fn len(&self) -> usize {
        self.updates.lock().len()
    }
}

fn delta_only_config() -> RsmConfig {
    RsmConfig::new(DELTA_LOG)
}

fn with_snapshot_log() -> RsmConfig {
    RsmConfig {
        snapshot_log: Some(SNAPSHOT_LOG),
        ..RsmConfig::new(DELTA_LOG)
    }
}

fn build(config: RsmConfig, store: &Arc<MemoryLogStore>) -> Rsm {
    ReplicatedStateMachine::new(config, EntryList::new(), store.clone() as Arc<_>, None)
}

fn build_with_snapshot_store(
    config: RsmConfig,
    store: &Arc<MemoryLogStore>,
    snapshots: &Arc<MemorySnapshotStore>,
) -> Rsm {
    ReplicatedStateMachine::new(
        config,
        EntryList::new(),
        store.clone() as Arc<_>,
        Some(snapshots.clone() as Arc<_>),
    )
}

async fn append(store: &MemoryLogStore, log: LogId, payload: &str) -> Lsn {
    replistate::LogStore::append(store, log, payload.as_bytes().to_vec(), APPEND_TIMEOUT)
        .await
        .expect("append failed")
}

/// A snapshot payload of `entries` taken at `base_version`, read pointer
/// at `read_ptr`.
fn snapshot_payload(entries: &[&str], base_version: Lsn, read_ptr: Lsn, compress: bool) -> Vec<u8> {
    let state: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
    let header = SnapshotHeader {
        format_version: FORMAT_WITH_READ_PTR,
        flags: 0,
        byte_offset: 0,
        offset: 0,
        base_version,
        delta_log_read_ptr: read_ptr,
    };
    snapshot_codec::compose(header, &serde_json::to_vec(&state).unwrap(), compress).unwrap()
}

async fn append_snapshot(store: &MemoryLogStore, payload: Vec<u8>) -> Lsn {
    replistate::LogStore::append(store, SNAPSHOT_LOG, payload, APPEND_TIMEOUT)
        .await
        .expect("snapshot append failed")
}

async fn wait_for_version(rsm: &Rsm, target: Lsn) {
    let mut versions = rsm.versions();
    tokio::time::timeout(WAIT, versions.wait_for(|v| v.in_memory >= target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for version {}", target))
        .expect("versions channel closed");
}

async fn wait_for_durable(rsm: &Rsm, target: Lsn) {
    let mut versions = rsm.versions();
    tokio::time::timeout(WAIT, versions.wait_for(|v| v.durable >= target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for durable version {}", target))
        .expect("versions channel closed");
}

async fn wait_for_debug(rsm: &Rsm, what: &str, predicate: impl Fn(&DebugInfo) -> bool) -> DebugInfo {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let info = rsm.debug_info().await.expect("rsm stopped");
        if predicate(&info) {
            return info;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}: {:?}", what, info);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_updates(recorder: &Recorder, count: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while recorder.len() < count {
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {} updates, have {:?}",
                count,
                recorder.updates()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn happy_bootstrap_without_snapshot_log() {
    let store = Arc::new(MemoryLogStore::new());
    // Deltas live at LSNs 10..=12; earlier positions were never assigned.
    store.inject_gap(DELTA_LOG, GapType::Bridge, Lsn(1), Lsn(9));
    for entry in ["a", "b", "c"] {
        append(&store, DELTA_LOG, entry).await;
    }

    let rsm = build(delta_only_config(), &store);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);

    rsm.start();
    assert!(rsm.wait(WAIT).await);

    wait_for_version(&rsm, Lsn(12)).await;
    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.version, Lsn(12));
    assert_eq!(info.delta_sync, Lsn(12));
    assert_eq!(info.sync_state, SyncState::Tailing);

    // Replay produced exactly one notification: the synced state.
    let updates = recorder.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].version, Lsn(12));
    assert_eq!(updates[0].delta, None);
    assert_eq!(updates[0].state, vec!["a", "b", "c"]);

    rsm.stop();
}

#[tokio::test]
async fn happy_empty_logs_tail_immediately() {
    let store = Arc::new(MemoryLogStore::new());
    let rsm = build(with_snapshot_log(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.version, Lsn::INVALID);
    assert_eq!(info.sync_state, SyncState::Tailing);
    rsm.stop();
}

#[tokio::test]
async fn happy_deliver_while_replaying() {
    let store = Arc::new(MemoryLogStore::new());
    for entry in ["a", "b", "c"] {
        append(&store, DELTA_LOG, entry).await;
    }

    let config = RsmConfig {
        deliver_while_replaying: true,
        ..delta_only_config()
    };
    let rsm = build(config, &store);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);

    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_updates(&recorder, 3).await;

    let updates = recorder.updates();
    assert_eq!(updates.len(), 3);
    assert_eq!(updates[0].delta.as_deref(), Some("a"));
    assert_eq!(updates[2].version, Lsn(3));

    rsm.stop();
}

#[tokio::test]
async fn happy_confirm_applied() {
    let store = Arc::new(MemoryLogStore::new());
    let rsm = build(delta_only_config(), &store);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    let lsn = rsm
        .write_delta(b"hello".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .expect("confirmed write failed");

    // The confirmation means the delta is already reflected locally.
    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.version, lsn);
    assert_eq!(info.pending_confirmations, 0);

    // Subscribers observed the delta no later than the confirmation.
    let updates = recorder.updates();
    let delta_update = updates.iter().find(|u| u.delta.is_some()).unwrap();
    assert_eq!(delta_update.delta.as_deref(), Some("hello"));
    assert_eq!(delta_update.version, lsn);

    rsm.stop();
}

#[tokio::test]
async fn happy_confirm_append_only() {
    let store = Arc::new(MemoryLogStore::new());
    let rsm = build(delta_only_config(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    let lsn = rsm
        .write_delta(b"x".to_vec(), WriteMode::ConfirmAppendOnly, WriteOptions::default())
        .await
        .expect("append-only write failed");
    assert_eq!(lsn, Lsn(1));

    // Applied eventually, not necessarily before the confirmation.
    wait_for_version(&rsm, lsn).await;
    rsm.stop();
}

#[tokio::test]
async fn happy_subscribe_while_tailing_is_seeded() {
    let store = Arc::new(MemoryLogStore::new());
    append(&store, DELTA_LOG, "a").await;
    let rsm = build(delta_only_config(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_version(&rsm, Lsn(1)).await;

    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);
    wait_for_updates(&recorder, 1).await;

    let updates = recorder.updates();
    assert_eq!(updates[0].version, Lsn(1));
    assert_eq!(updates[0].delta, None);
    assert_eq!(updates[0].state, vec!["a"]);
    rsm.stop();
}

#[tokio::test]
async fn happy_unsubscribe_stops_delivery() {
    let store = Arc::new(MemoryLogStore::new());
    let rsm = build(delta_only_config(), &store);
    let recorder = Recorder::default();
    let sub = recorder.attach(&rsm);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_updates(&recorder, 1).await;

    sub.unsubscribe();
    // Give the unsubscribe a moment to land, then write.
    tokio::time::sleep(Duration::from_millis(50)).await;
    rsm.write_delta(b"a".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .unwrap();

    assert_eq!(recorder.len(), 1);
    rsm.stop();
}

#[tokio::test]
async fn happy_explicit_snapshot_to_log() {
    let store = Arc::new(MemoryLogStore::new());
    let rsm = build(with_snapshot_log(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    rsm.write_delta(b"a".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .unwrap();

    let outcome = rsm.snapshot().await.unwrap();
    assert_eq!(outcome, SnapshotOutcome::Written { version: Lsn(1) });
    assert_eq!(store.record_count(SNAPSHOT_LOG), 1);
    wait_for_durable(&rsm, Lsn(1)).await;

    rsm.stop();
}

#[tokio::test]
async fn happy_snapshot_not_supported_without_log() {
    let store = Arc::new(MemoryLogStore::new());
    let rsm = build(delta_only_config(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    assert!(matches!(rsm.snapshot().await, Err(RsmError::NotSupported(_))));
    rsm.stop();
}

#[tokio::test]
async fn happy_periodic_snapshotting() {
    let store = Arc::new(MemoryLogStore::new());
    append(&store, DELTA_LOG, "a").await;

    let config = RsmConfig {
        snapshotting_period_ms: 100,
        ..with_snapshot_log()
    };
    let rsm = ReplicatedStateMachine::new(
        config,
        EntryList::snapshotter(),
        store.clone() as Arc<_>,
        None,
    );
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    // The time-based trigger snapshots on its own.
    wait_for_durable(&rsm, Lsn(1)).await;
    assert!(store.record_count(SNAPSHOT_LOG) >= 1);
    rsm.stop();
}

#[tokio::test]
async fn happy_bootstrap_from_snapshot_store() {
    let store = Arc::new(MemoryLogStore::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());
    snapshots
        .write_snapshot(Lsn(50), snapshot_payload(&["s1", "s2"], Lsn(50), Lsn(50), false))
        .await
        .unwrap();
    // The covered prefix of the delta log.
    store.inject_gap(DELTA_LOG, GapType::Bridge, Lsn(1), Lsn(50));

    let config = RsmConfig {
        snapshot_fetch_initial_ms: 20,
        ..with_snapshot_log()
    };
    let rsm = build_with_snapshot_store(config, &store, &snapshots);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.version, Lsn(50));
    assert_eq!(info.last_snapshot_version, Lsn(50));

    // Live deltas continue on top of the snapshot.
    append(&store, DELTA_LOG, "d").await;
    wait_for_version(&rsm, Lsn(51)).await;
    let updates = recorder.updates();
    assert_eq!(updates.last().unwrap().state, vec!["s1", "s2", "d"]);

    rsm.stop();
}

#[tokio::test]
async fn happy_snapshot_log_bootstrap_applies_latest_only() {
    let store = Arc::new(MemoryLogStore::new());
    store.inject_gap(DELTA_LOG, GapType::Bridge, Lsn(1), Lsn(9));
    append_snapshot(&store, snapshot_payload(&["old"], Lsn(5), Lsn(5), false)).await;
    append_snapshot(&store, snapshot_payload(&["new"], Lsn(9), Lsn(9), false)).await;

    let rsm = build(with_snapshot_log(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.version, Lsn(9));
    assert_eq!(info.snapshot_sync, Lsn(2));

    let (version, blob) = rsm.current_snapshot_blob(Lsn::INVALID).await.unwrap();
    assert_eq!(version, Lsn(9));
    let (_, body) = snapshot_codec::parse(&blob).unwrap();
    let state: Vec<String> = serde_json::from_slice(&body).unwrap();
    // The older backlog snapshot was never decoded, let alone applied.
    assert_eq!(state, vec!["new"]);

    rsm.stop();
}

#[tokio::test]
async fn happy_stashed_snapshot_applied_on_gap() {
    let store = Arc::new(MemoryLogStore::new());
    store.inject_gap(DELTA_LOG, GapType::Bridge, Lsn(1), Lsn(5));
    // One snapshot record below the snapshot-log tail: it is stashed until
    // the gap past the tail proves it was the newest.
    append_snapshot(&store, snapshot_payload(&["stashed"], Lsn(5), Lsn(5), false)).await;
    store.inject_gap(SNAPSHOT_LOG, GapType::Bridge, Lsn(2), Lsn(3));

    let rsm = build(with_snapshot_log(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.version, Lsn(5));
    rsm.stop();
}

#[tokio::test]
async fn happy_compressed_snapshot_roundtrip() {
    let store = Arc::new(MemoryLogStore::new());
    let config = RsmConfig {
        snapshot_compression: true,
        ..with_snapshot_log()
    };
    let rsm = build(config, &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    rsm.write_delta(b"payload".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .unwrap();
    rsm.snapshot().await.unwrap();
    rsm.stop();

    // A second replica bootstraps from the compressed snapshot.
    let rsm2 = build(with_snapshot_log(), &store);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm2);
    rsm2.start();
    assert!(rsm2.wait(WAIT).await);
    wait_for_updates(&recorder, 1).await;
    assert_eq!(recorder.updates()[0].state, vec!["payload"]);
    rsm2.stop();
}

#[tokio::test]
async fn happy_current_snapshot_blob_stale() {
    let store = Arc::new(MemoryLogStore::new());
    let rsm = build(delta_only_config(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    assert!(matches!(
        rsm.current_snapshot_blob(Lsn(100)).await,
        Err(RsmError::Stale(_))
    ));
    rsm.stop();
}

// =============================================================================
// Failure Scenarios
// =============================================================================

#[tokio::test]
async fn failure_stall_on_trim_gap_then_snapshot_recovery() {
    let store = Arc::new(MemoryLogStore::new());
    store.inject_gap(DELTA_LOG, GapType::Bridge, Lsn(1), Lsn(4));
    append(&store, DELTA_LOG, "e5").await;

    let rsm = build(with_snapshot_log(), &store);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_version(&rsm, Lsn(5)).await;

    // Deltas 6..=100 are trimmed away: the machine must not guess, it
    // stalls until a snapshot covers the hole.
    store.inject_gap(DELTA_LOG, GapType::Trim, Lsn(6), Lsn(100));
    let info = wait_for_debug(&rsm, "stall", |i| i.waiting_for_snapshot == Lsn(100)).await;
    assert_eq!(info.version, Lsn(5));
    assert_eq!(info.delta_read_ptr, Lsn(100));

    // A snapshot past the hole arrives on the snapshot log.
    append_snapshot(
        &store,
        snapshot_payload(&["snap"], Lsn(120), Lsn(130), false),
    )
    .await;

    wait_for_version(&rsm, Lsn(120)).await;
    let info = wait_for_debug(&rsm, "unstall", |i| !i.waiting_for_snapshot.is_valid()).await;
    assert_eq!(info.version, Lsn(120));

    // Reading resumed: a delta the snapshot already absorbed is skipped...
    store.inject_gap(DELTA_LOG, GapType::Bridge, Lsn(101), Lsn(124));
    let skipped = append(&store, DELTA_LOG, "skipped").await;
    assert_eq!(skipped, Lsn(125));
    store.inject_gap(DELTA_LOG, GapType::Bridge, Lsn(126), Lsn(130));
    // ...and the first delta past the read pointer applies.
    let applied = append(&store, DELTA_LOG, "applied").await;
    assert_eq!(applied, Lsn(131));

    wait_for_version(&rsm, Lsn(131)).await;
    let last = recorder.updates().into_iter().last().unwrap();
    assert_eq!(last.state, vec!["snap", "applied"]);
    assert_eq!(last.version, Lsn(131));

    rsm.stop();
}

#[tokio::test]
async fn failure_confirm_lost_to_fast_forward() {
    let store = Arc::new(MemoryLogStore::new());
    append(&store, DELTA_LOG, "e1").await;

    let rsm = build(with_snapshot_log(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_version(&rsm, Lsn(1)).await;

    // Stall the delta stream so the write cannot be read back.
    store.inject_gap(DELTA_LOG, GapType::DataLoss, Lsn(2), Lsn(40));
    wait_for_debug(&rsm, "stall", |i| i.waiting_for_snapshot == Lsn(40)).await;

    let rsm_clone = rsm.clone();
    let write = tokio::spawn(async move {
        rsm_clone
            .write_delta(b"lost".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
            .await
    });

    // The append lands (LSN 41) while reading is stalled.
    wait_for_debug(&rsm, "append settled", |i| {
        i.pending_confirmations == 1 && i.delta_appends_in_flight == 0
    })
    .await;

    // A snapshot fast-forwards past the write before it is ever read.
    append_snapshot(&store, snapshot_payload(&["s"], Lsn(60), Lsn(60), false)).await;
    wait_for_version(&rsm, Lsn(60)).await;

    let err = write.await.unwrap().unwrap_err();
    assert_eq!(err.error, RsmError::Failed("Cannot confirm operation".into()));
    assert_eq!(err.lsn, Lsn(41));

    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.pending_confirmations, 0);
    rsm.stop();
}

#[tokio::test]
async fn failure_fast_forward_waits_out_grace_period() {
    let store = Arc::new(MemoryLogStore::new());
    append(&store, DELTA_LOG, "e1").await;

    let config = RsmConfig {
        fast_forward_grace_ms: 1_500,
        ..with_snapshot_log()
    };
    let rsm = build(config, &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_version(&rsm, Lsn(1)).await;

    // A newer snapshot while live does not replace state immediately.
    append_snapshot(&store, snapshot_payload(&["s200"], Lsn(200), Lsn(200), false)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rsm.debug_info().await.unwrap().version, Lsn(1));

    // A second snapshot during the grace period is not even looked at.
    append_snapshot(&store, snapshot_payload(&["s210"], Lsn(210), Lsn(210), false)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rsm.debug_info().await.unwrap().version, Lsn(1));

    // Once the grace elapses and reading resumes, the snapshots land in
    // order; the second one starts (and waits out) its own grace.
    wait_for_version(&rsm, Lsn(200)).await;
    wait_for_version(&rsm, Lsn(210)).await;

    rsm.stop();
}

#[tokio::test]
async fn failure_headerless_peer_delta_still_applies() {
    let store = Arc::new(MemoryLogStore::new());
    let config = RsmConfig {
        write_delta_header: false,
        ..delta_only_config()
    };
    let rsm = build(config, &store);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    // Long enough that the reader attempts (and fails) header parsing.
    let payload = "an unframed delta from a peer without headers";
    let lsn = rsm
        .write_delta(
            payload.as_bytes().to_vec(),
            WriteMode::ConfirmAppendOnly,
            WriteOptions::default(),
        )
        .await
        .unwrap();

    wait_for_version(&rsm, lsn).await;
    let last = recorder.updates().into_iter().last().unwrap();
    assert_eq!(last.state, vec![payload]);
    rsm.stop();
}

#[tokio::test]
async fn failure_confirm_applied_needs_delta_headers() {
    let store = Arc::new(MemoryLogStore::new());
    let config = RsmConfig {
        write_delta_header: false,
        ..delta_only_config()
    };
    let rsm = build(config, &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    let err = rsm
        .write_delta(b"x".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.error, RsmError::NotSupported(_)));

    // The refused write was never appended.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.record_count(DELTA_LOG), 0);
    rsm.stop();
}

#[tokio::test]
async fn failure_trim_resets_state_without_snapshot_log() {
    let store = Arc::new(MemoryLogStore::new());
    for entry in ["a", "b"] {
        append(&store, DELTA_LOG, entry).await;
    }
    let rsm = build(delta_only_config(), &store);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_version(&rsm, Lsn(2)).await;

    // With no snapshot source, a trim is a reset to defaults.
    store.inject_gap(DELTA_LOG, GapType::Trim, Lsn(3), Lsn(10));
    wait_for_version(&rsm, Lsn(10)).await;

    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.version, Lsn(10));
    assert!(!info.waiting_for_snapshot.is_valid());
    let last = recorder.updates().into_iter().last().unwrap();
    assert!(last.state.is_empty());

    // And the machine keeps consuming afterwards.
    append(&store, DELTA_LOG, "fresh").await;
    wait_for_version(&rsm, Lsn(11)).await;
    rsm.stop();
}

#[tokio::test]
async fn failure_dataloss_without_snapshot_log_continues() {
    let store = Arc::new(MemoryLogStore::new());
    append(&store, DELTA_LOG, "a").await;
    let rsm = build(delta_only_config(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    store.inject_gap(DELTA_LOG, GapType::DataLoss, Lsn(2), Lsn(5));
    append(&store, DELTA_LOG, "b").await;

    // Logged as critical, but the state keeps moving: no stall possible
    // when no snapshot could ever cover the hole.
    wait_for_version(&rsm, Lsn(6)).await;
    let info = rsm.debug_info().await.unwrap();
    assert!(!info.waiting_for_snapshot.is_valid());
    rsm.stop();
}

#[tokio::test]
async fn failure_stale_conditional_write() {
    let store = Arc::new(MemoryLogStore::new());
    append(&store, DELTA_LOG, "a").await;
    let rsm = build(delta_only_config(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_version(&rsm, Lsn(1)).await;

    // Version moved past the caller's base.
    let err = rsm
        .write_delta(
            b"x".to_vec(),
            WriteMode::ConfirmApplied,
            WriteOptions {
                base_version: Some(Lsn::INVALID),
                timeout: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err.error, RsmError::Stale(_)));

    // An exact base succeeds.
    rsm.write_delta(
        b"y".to_vec(),
        WriteMode::ConfirmApplied,
        WriteOptions {
            base_version: Some(Lsn(1)),
            timeout: None,
        },
    )
    .await
    .expect("exact base version write failed");

    // A base ahead of the local version is a caller bug.
    let err = rsm
        .write_delta(
            b"z".to_vec(),
            WriteMode::ConfirmApplied,
            WriteOptions {
                base_version: Some(Lsn(99)),
                timeout: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err.error, RsmError::Failed(_)));

    rsm.stop();
}

#[tokio::test]
async fn failure_pending_queue_full() {
    let store = Arc::new(MemoryLogStore::new());
    append(&store, DELTA_LOG, "a").await;
    let config = RsmConfig {
        max_pending_confirmation: 0,
        ..with_snapshot_log()
    };
    let rsm = build(config, &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_version(&rsm, Lsn(1)).await;

    // Stall the stream so the first write stays pending.
    store.inject_gap(DELTA_LOG, GapType::DataLoss, Lsn(2), Lsn(9));
    wait_for_debug(&rsm, "stall", |i| i.waiting_for_snapshot.is_valid()).await;

    let rsm_clone = rsm.clone();
    let _first = tokio::spawn(async move {
        rsm_clone
            .write_delta(b"one".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
            .await
    });
    wait_for_debug(&rsm, "first pending", |i| i.pending_confirmations == 1).await;

    let err = rsm
        .write_delta(b"two".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error, RsmError::NoBufs);
    rsm.stop();
}

#[tokio::test]
async fn failure_confirmation_timeout() {
    let store = Arc::new(MemoryLogStore::new());
    append(&store, DELTA_LOG, "a").await;
    let rsm = build(with_snapshot_log(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_version(&rsm, Lsn(1)).await;

    // Stalled: the append lands but is never read back, and no snapshot
    // ever covers it.
    store.inject_gap(DELTA_LOG, GapType::DataLoss, Lsn(2), Lsn(9));
    wait_for_debug(&rsm, "stall", |i| i.waiting_for_snapshot.is_valid()).await;

    let err = rsm
        .write_delta(
            b"slow".to_vec(),
            WriteMode::ConfirmApplied,
            WriteOptions {
                base_version: None,
                timeout: Some(Duration::from_millis(200)),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err.error, RsmError::TimedOut(_)));
    assert_eq!(err.lsn, Lsn(10));

    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.pending_confirmations, 0);
    rsm.stop();
}

#[tokio::test]
async fn failure_unhealthy_stream_rejects_confirmed_writes() {
    let store = Arc::new(MemoryLogStore::new());
    append(&store, DELTA_LOG, "a").await;
    let rsm = build(delta_only_config(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_version(&rsm, Lsn(1)).await;

    store.set_health(DELTA_LOG, false);
    wait_for_debug(&rsm, "unhealthy", |i| !i.delta_read_stream_healthy).await;

    let err = rsm
        .write_delta(b"x".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.error, RsmError::Again(_)));

    // Recovery re-anchors the tail and goes back to tailing; confirmed
    // writes work again.
    store.set_health(DELTA_LOG, true);
    wait_for_debug(&rsm, "healthy and tailing", |i| {
        i.delta_read_stream_healthy && i.sync_state == SyncState::Tailing
    })
    .await;

    let lsn = rsm
        .write_delta(b"y".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .expect("write after recovery failed");
    assert_eq!(rsm.debug_info().await.unwrap().version, lsn);
    rsm.stop();
}

#[tokio::test]
async fn failure_bad_snapshot_stalls_bootstrap() {
    let store = Arc::new(MemoryLogStore::new());
    append_snapshot(&store, b"not a snapshot".to_vec()).await;

    let rsm = build(with_snapshot_log(), &store);
    rsm.start();
    // The backlog snapshot is garbage and skipping is not allowed: the
    // machine cannot make progress.
    assert!(!rsm.wait(Duration::from_millis(300)).await);
    assert_eq!(rsm.sync_state(), SyncState::SyncSnapshot);
    rsm.stop();
}

#[tokio::test]
async fn failure_bad_snapshot_skipped_when_allowed() {
    let store = Arc::new(MemoryLogStore::new());
    append_snapshot(&store, b"not a snapshot".to_vec()).await;
    append(&store, DELTA_LOG, "a").await;

    let config = RsmConfig {
        can_skip_bad_snapshot: true,
        ..with_snapshot_log()
    };
    let rsm = build(config, &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    // Replayed from the delta log as if the snapshot never existed.
    wait_for_version(&rsm, Lsn(1)).await;
    rsm.stop();
}

#[tokio::test]
async fn failure_snapshot_fetch_retries_with_backoff() {
    let store = Arc::new(MemoryLogStore::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());
    snapshots.set_fail_gets(true);

    let config = RsmConfig {
        snapshot_fetch_initial_ms: 30,
        ..with_snapshot_log()
    };
    let rsm = build_with_snapshot_store(config, &store, &snapshots);
    rsm.start();

    // Fetches fail; the machine stays in snapshot sync and keeps retrying.
    assert!(!rsm.wait(Duration::from_millis(200)).await);
    snapshots.set_fail_gets(false);

    // The next retry gets an empty store and bootstrap completes.
    assert!(rsm.wait(WAIT).await);
    rsm.stop();
}

#[tokio::test]
async fn failure_rejected_delta_does_not_advance_version() {
    let store = Arc::new(MemoryLogStore::new());
    let rsm = build(delta_only_config(), &store);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    let err = rsm
        .write_delta(b"fail:no room".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error, RsmError::Failed("no room".into()));
    assert_eq!(err.lsn, Lsn(1));

    // The rejected delta left no trace in state or version.
    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.version, Lsn::INVALID);
    assert!(recorder.updates().iter().all(|u| u.delta.is_none()));

    // The next good delta applies at its own LSN.
    let lsn = rsm
        .write_delta(b"good".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(lsn, Lsn(2));
    assert_eq!(rsm.debug_info().await.unwrap().version, Lsn(2));
    rsm.stop();
}

// =============================================================================
// Admin: trim, delivery blocking, stop
// =============================================================================

#[tokio::test]
async fn admin_trim_without_store_trims_both_logs() {
    let store = Arc::new(MemoryLogStore::new());
    let rsm = build(with_snapshot_log(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    for entry in ["a", "b"] {
        rsm.write_delta(
            entry.as_bytes().to_vec(),
            WriteMode::ConfirmApplied,
            WriteOptions::default(),
        )
        .await
        .unwrap();
    }
    rsm.snapshot().await.unwrap();

    rsm.trim(Duration::ZERO).await.expect("trim failed");
    assert_eq!(store.trim_point(SNAPSHOT_LOG), Lsn(1));
    assert_eq!(store.trim_point(DELTA_LOG), Lsn(2));
    rsm.stop();
}

#[tokio::test]
async fn admin_trim_with_store_uses_durable_version() {
    let store = Arc::new(MemoryLogStore::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let config = RsmConfig {
        snapshot_fetch_initial_ms: 20,
        ..delta_only_config()
    };
    let rsm = build_with_snapshot_store(config, &store, &snapshots);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    // Nothing durable yet: no trim point to derive.
    assert!(matches!(rsm.trim(Duration::ZERO).await, Err(RsmError::NotFound)));

    for entry in ["a", "b", "c"] {
        rsm.write_delta(
            entry.as_bytes().to_vec(),
            WriteMode::ConfirmApplied,
            WriteOptions::default(),
        )
        .await
        .unwrap();
    }
    rsm.snapshot().await.unwrap();

    rsm.trim(Duration::ZERO).await.expect("trim failed");
    assert_eq!(store.trim_point(DELTA_LOG), Lsn(3));
    rsm.stop();
}

#[tokio::test]
async fn admin_snapshot_uptodate_with_store() {
    let store = Arc::new(MemoryLogStore::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let config = RsmConfig {
        snapshot_fetch_initial_ms: 20,
        ..delta_only_config()
    };
    let rsm = build_with_snapshot_store(config, &store, &snapshots);
    rsm.start();
    assert!(rsm.wait(WAIT).await);

    rsm.write_delta(b"a".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .unwrap();

    assert_eq!(
        rsm.snapshot().await.unwrap(),
        SnapshotOutcome::Written { version: Lsn(1) }
    );
    // No new deltas since: nothing to write.
    assert_eq!(rsm.snapshot().await.unwrap(), SnapshotOutcome::UpToDate);
    assert_eq!(snapshots.latest_version(), Some(Lsn(1)));
    rsm.stop();
}

#[tokio::test]
async fn admin_block_state_delivery() {
    let store = Arc::new(MemoryLogStore::new());
    let rsm = build(delta_only_config(), &store);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_updates(&recorder, 1).await;

    assert_eq!(rsm.block_state_delivery(true).await.unwrap(), false);

    // State advances internally, subscribers hear nothing. A confirmed
    // write cannot be acknowledged while delivery is blocked; it resolves
    // as unconfirmable once the state passes it.
    let err = rsm
        .write_delta(b"quiet".to_vec(), WriteMode::ConfirmApplied, WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error, RsmError::Failed("Cannot confirm operation".into()));
    wait_for_version(&rsm, Lsn(1)).await;
    assert_eq!(recorder.len(), 1);

    // Unblocking publishes one catch-up update.
    assert_eq!(rsm.block_state_delivery(false).await.unwrap(), true);
    wait_for_updates(&recorder, 2).await;
    let last = recorder.updates().into_iter().last().unwrap();
    assert_eq!(last.version, Lsn(1));
    assert_eq!(last.delta, None);
    assert_eq!(last.state, vec!["quiet"]);
    rsm.stop();
}

#[tokio::test]
async fn admin_stop_releases_waiters_and_fails_writes() {
    let store = Arc::new(MemoryLogStore::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());
    snapshots.set_fail_gets(true);
    // A machine that can never finish bootstrap.
    let rsm = build_with_snapshot_store(with_snapshot_log(), &store, &snapshots);
    rsm.start();

    assert!(!rsm.wait(Duration::from_millis(100)).await);

    let waiter = {
        let rsm = rsm.clone();
        tokio::spawn(async move { rsm.wait(WAIT).await })
    };
    rsm.stop();
    assert!(waiter.await.unwrap());
    assert_eq!(rsm.sync_state(), SyncState::Stopped);

    let err = rsm
        .write_delta(b"x".to_vec(), WriteMode::ConfirmAppendOnly, WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error, RsmError::Stopped);
    assert!(matches!(rsm.snapshot().await, Err(RsmError::Stopped)));

    // Idempotent.
    rsm.stop();
}

#[tokio::test]
async fn admin_stop_at_tail() {
    let store = Arc::new(MemoryLogStore::new());
    for entry in ["a", "b"] {
        append(&store, DELTA_LOG, entry).await;
    }
    let config = RsmConfig {
        stop_at_tail: true,
        ..delta_only_config()
    };
    let rsm = build(config, &store);
    let recorder = Recorder::default();
    let _sub = recorder.attach(&rsm);
    rsm.start();

    // Reaches the tail, publishes once, then stops itself.
    assert!(rsm.wait(WAIT).await);
    let mut states = rsm.sync_state_receiver();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == SyncState::Stopped))
        .await
        .expect("did not stop at tail")
        .unwrap();

    let updates = recorder.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].state, vec!["a", "b"]);
}

#[tokio::test]
async fn admin_debug_info_reflects_progress() {
    let store = Arc::new(MemoryLogStore::new());
    append(&store, DELTA_LOG, "abc").await;
    let rsm = build(with_snapshot_log(), &store);
    rsm.start();
    assert!(rsm.wait(WAIT).await);
    wait_for_version(&rsm, Lsn(1)).await;

    let info = rsm.debug_info().await.unwrap();
    assert_eq!(info.delta_log, DELTA_LOG);
    assert_eq!(info.snapshot_log, Some(SNAPSHOT_LOG));
    assert_eq!(info.version, Lsn(1));
    assert_eq!(info.delta_read_ptr, Lsn(1));
    assert_eq!(info.delta_sync, Lsn(1));
    assert!(!info.snapshot_in_flight);
    assert_eq!(info.records_since_last_snapshot, 1);
    assert!(info.bytes_since_last_snapshot > 0);
    assert!(info.delta_read_stream_healthy);
    rsm.stop();
}
