//! The replicated state machine engine.
//!
//! A [`ReplicatedStateMachine`] materializes a state `S::State` on this
//! process by consuming an ordered delta log and, optionally, a snapshot
//! log or snapshot store. Every replica consuming the same logs converges
//! to the same state at the same version.
//!
//! # Lifecycle
//!
//! ```text
//! SyncSnapshot ──► SyncDeltas ──► Tailing ──► Stopped
//!      (base snapshot)  (backlog replay)  (live)
//! ```
//!
//! # Concurrency
//!
//! All engine state lives on one spawned driver task; the public handle
//! only exchanges messages with it. Read-stream events, append
//! completions, timer fires and caller commands are all serialized through
//! that task, so ordering guarantees (a confirmation fires after its delta
//! is applied locally, subscribers never observe versions out of order)
//! hold by construction. A completion arriving after [`stop()`] finds the
//! driver gone and resolves as [`RsmError::Stopped`].
//!
//! [`stop()`]: ReplicatedStateMachine::stop

mod deltas;
mod lifecycle;
mod snapshots;
mod snapshotter;
mod trim;
mod types;
mod writer;

pub use types::{
    DebugInfo, RsmError, SnapshotOutcome, SyncState, Versions, WriteError, WriteMode, WriteOptions,
};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RsmConfig;
use crate::state::StateMachine;
use crate::store::traits::{
    LogStore, ReadEvent, ReadStream, SnapshotFetch, SnapshotStore, SnapshotWrite, StoreError,
};
use crate::timer::{BackoffTimer, TimerFire, TimerHandle, TimerKind};
use crate::types::{Lsn, Record, Timestamp};
use crate::metrics;

/// Resolution of one write, delivered through the engine.
pub type ConfirmResult = Result<Lsn, WriteError>;

type ConfirmCallback = Box<dyn FnOnce(ConfirmResult) + Send>;
type UpdateCallback<S> = Box<
    dyn FnMut(&<S as StateMachine>::State, Option<&<S as StateMachine>::Delta>, Lsn) + Send,
>;
type SnapshotReply = oneshot::Sender<Result<SnapshotOutcome, RsmError>>;

enum Command<S: StateMachine> {
    WriteDelta {
        payload: Vec<u8>,
        mode: WriteMode,
        options: WriteOptions,
        confirm: ConfirmCallback,
    },
    Snapshot {
        reply: SnapshotReply,
    },
    Trim {
        retention: Duration,
        reply: oneshot::Sender<Result<(), RsmError>>,
    },
    Subscribe {
        id: u64,
        callback: UpdateCallback<S>,
    },
    Unsubscribe {
        id: u64,
    },
    BlockStateDelivery {
        blocked: bool,
        reply: oneshot::Sender<bool>,
    },
    DebugInfo {
        reply: oneshot::Sender<DebugInfo>,
    },
    SnapshotBlob {
        min_version: Lsn,
        reply: oneshot::Sender<Result<(Lsn, Vec<u8>), RsmError>>,
    },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogRole {
    Snapshot,
    Delta,
}

enum AppendCompletion {
    /// Resolve the caller as soon as the append settles.
    AppendOnly(ConfirmCallback),
    /// Applied-locally mode: route through the pending-confirmation table.
    Applied { uuid: Uuid },
}

enum Event {
    TailLsn {
        role: LogRole,
        lsn: Lsn,
    },
    SnapshotFetched {
        result: Result<SnapshotFetch, StoreError>,
    },
    AppendDone {
        completion: AppendCompletion,
        result: Result<Lsn, StoreError>,
    },
    SnapshotWritten {
        result: Result<SnapshotWrite, StoreError>,
        byte_offset: u64,
        offset: u64,
        read_ptr: Lsn,
        payload_size: usize,
        reply: Option<SnapshotReply>,
    },
}

enum Turn<S: StateMachine> {
    Timer(TimerFire),
    Event(Event),
    Command(Option<Command<S>>),
    SnapshotRead(Option<ReadEvent>),
    DeltaRead(Option<ReadEvent>),
}

/// A write pending applied-locally confirmation.
struct Pending {
    uuid: Uuid,
    /// Assigned by the append; INVALID until the append settles.
    lsn: Lsn,
    confirm: Option<ConfirmCallback>,
    timeout: Duration,
}

struct HandleShared<S: StateMachine> {
    cmd_tx: mpsc::UnboundedSender<Command<S>>,
    sync_state_rx: watch::Receiver<SyncState>,
    versions_rx: watch::Receiver<Versions>,
    next_subscription_id: AtomicU64,
    seed: Mutex<Option<Core<S>>>,
}

/// Handle to one replicated state machine instance.
///
/// Cheap to clone; all clones address the same driver task. The driver
/// keeps running until [`stop()`](Self::stop) is called, `stop_at_tail`
/// fires, or every handle is dropped.
pub struct ReplicatedStateMachine<S: StateMachine> {
    shared: Arc<HandleShared<S>>,
}

impl<S: StateMachine> Clone for ReplicatedStateMachine<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: StateMachine> ReplicatedStateMachine<S> {
    /// Create an instance bound to `config.delta_log` (and, if configured,
    /// a snapshot log and/or snapshot store).
    ///
    /// Nothing happens until [`start()`](Self::start) is called; commands
    /// issued before that are queued.
    #[must_use]
    pub fn new(
        config: RsmConfig,
        machine: S,
        log_store: Arc<dyn LogStore>,
        snapshot_store: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let sync_state_tx = watch::Sender::new(SyncState::SyncSnapshot);
        let versions_tx = watch::Sender::new(Versions::default());
        let sync_state_rx = sync_state_tx.subscribe();
        let versions_rx = versions_tx.subscribe();

        let state = machine.make_default_state(Lsn::INVALID);
        let snapshot_fetch_timer = BackoffTimer::new(
            TimerKind::SnapshotFetch,
            timer_tx.clone(),
            Duration::from_millis(config.snapshot_fetch_initial_ms),
            Duration::from_millis(config.snapshot_fetch_max_ms),
        );

        let core = Core {
            fast_forward_timer: TimerHandle::new(TimerKind::FastForwardGrace, timer_tx.clone()),
            stall_timer: TimerHandle::new(TimerKind::StallGrace, timer_tx.clone()),
            snapshotting_timer: TimerHandle::new(TimerKind::SnapshotPeriodic, timer_tx.clone()),
            snapshot_fetch_timer,
            config,
            machine,
            log_store,
            snapshot_store,
            state,
            version: Lsn::INVALID,
            last_snapshot_version: Lsn::INVALID,
            last_snapshot_read_ptr: Lsn::INVALID,
            delta_read_ptr: Lsn::INVALID,
            delta_log_byte_offset: 0,
            delta_log_offset: 0,
            last_snapshot_byte_offset: 0,
            last_snapshot_offset: 0,
            snapshot_log_timestamp: 0,
            snapshot_sync: Lsn::INVALID,
            delta_sync: Lsn::INVALID,
            waiting_for_snapshot: Lsn::INVALID,
            sync_state: SyncState::SyncSnapshot,
            allow_fast_forward_up_to: Lsn::INVALID,
            bumped_stalled_stat: false,
            delta_read_stream_healthy: true,
            state_delivery_blocked: false,
            latest_published_version: None,
            snapshot_reader: None,
            delta_reader: None,
            snapshot_paused: false,
            stashed_snapshot: None,
            stashed_delta: None,
            last_snapshot_record: None,
            subscribers: Vec::new(),
            pending: BTreeMap::new(),
            pending_by_uuid: HashMap::new(),
            pending_seq: 0,
            delta_appends_in_flight: 0,
            snapshot_in_flight: false,
            last_written_version: Lsn::INVALID,
            stop_scheduled: false,
            stopped: false,
            timer_tx,
            timer_rx,
            event_tx,
            event_rx,
            cmd_rx,
            sync_state_tx,
            versions_tx,
        };

        Self {
            shared: Arc::new(HandleShared {
                cmd_tx,
                sync_state_rx,
                versions_rx,
                next_subscription_id: AtomicU64::new(1),
                seed: Mutex::new(Some(core)),
            }),
        }
    }

    /// Spawn the driver task and begin synchronizing. Idempotent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if let Some(core) = self.shared.seed.lock().take() {
            tokio::spawn(core.run());
        }
    }

    /// Tear the instance down: both read streams are dropped, all timers
    /// cancelled, pending confirmations resolved as [`RsmError::Stopped`],
    /// and any [`wait()`](Self::wait) caller released. Idempotent.
    pub fn stop(&self) {
        let _ = self.shared.cmd_tx.send(Command::Stop);
    }

    /// Block until the instance reaches [`SyncState::Tailing`] or is
    /// stopped. Returns `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.sync_state_rx.clone();
        // A dropped driver counts as stopped, which releases the waiter.
        let result = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(*s, SyncState::Tailing | SyncState::Stopped)),
        )
        .await;
        matches!(result, Ok(Ok(_)) | Ok(Err(_)))
    }

    /// Current synchronization state.
    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        *self.shared.sync_state_rx.borrow()
    }

    /// Watch synchronization state transitions.
    #[must_use]
    pub fn sync_state_receiver(&self) -> watch::Receiver<SyncState> {
        self.shared.sync_state_rx.clone()
    }

    /// Watch the in-memory and durable versions as they advance.
    #[must_use]
    pub fn versions(&self) -> watch::Receiver<Versions> {
        self.shared.versions_rx.clone()
    }

    /// Append a delta to the delta log.
    ///
    /// With [`WriteMode::ConfirmAppendOnly`] the returned LSN means the
    /// append is durable. With [`WriteMode::ConfirmApplied`] it also means
    /// this replica has read the delta back and applied it to its state;
    /// subscribers observed the delta before this returns.
    pub async fn write_delta(
        &self,
        payload: Vec<u8>,
        mode: WriteMode,
        options: WriteOptions,
    ) -> ConfirmResult {
        let (tx, rx) = oneshot::channel();
        let confirm: ConfirmCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        let sent = self.shared.cmd_tx.send(Command::WriteDelta {
            payload,
            mode,
            options,
            confirm,
        });
        if sent.is_err() {
            return Err(WriteError::new(RsmError::Stopped, Lsn::INVALID));
        }
        rx.await
            .unwrap_or_else(|_| Err(WriteError::new(RsmError::Stopped, Lsn::INVALID)))
    }

    /// Serialize the current state and write it as a snapshot.
    pub async fn snapshot(&self) -> Result<SnapshotOutcome, RsmError> {
        let (tx, rx) = oneshot::channel();
        if self.shared.cmd_tx.send(Command::Snapshot { reply: tx }).is_err() {
            return Err(RsmError::Stopped);
        }
        rx.await.unwrap_or(Err(RsmError::Stopped))
    }

    /// Trim the snapshot and delta logs down to `retention`.
    pub async fn trim(&self, retention: Duration) -> Result<(), RsmError> {
        let (tx, rx) = oneshot::channel();
        if self
            .shared
            .cmd_tx
            .send(Command::Trim {
                retention,
                reply: tx,
            })
            .is_err()
        {
            return Err(RsmError::Stopped);
        }
        rx.await.unwrap_or(Err(RsmError::Stopped))
    }

    /// Register `callback` for state updates: `(state, delta, version)`.
    ///
    /// If the instance is already tailing, the callback is seeded with the
    /// current state (and no delta). Dropping the returned handle
    /// unsubscribes.
    pub fn subscribe(
        &self,
        callback: impl FnMut(&S::State, Option<&S::Delta>, Lsn) + Send + 'static,
    ) -> SubscriptionHandle {
        let id = self.shared.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.shared.cmd_tx.send(Command::Subscribe {
            id,
            callback: Box::new(callback),
        });
        let cmd_tx = self.shared.cmd_tx.clone();
        SubscriptionHandle {
            unsubscribe: Some(Box::new(move || {
                let _ = cmd_tx.send(Command::Unsubscribe { id });
            })),
        }
    }

    /// Operator toggle: while blocked, subscriber notifications and
    /// per-delta confirmation callbacks are suppressed (state keeps
    /// advancing internally). Unblocking emits one catch-up notification.
    /// Returns the previous value.
    pub async fn block_state_delivery(&self, blocked: bool) -> Result<bool, RsmError> {
        let (tx, rx) = oneshot::channel();
        if self
            .shared
            .cmd_tx
            .send(Command::BlockStateDelivery { blocked, reply: tx })
            .is_err()
        {
            return Err(RsmError::Stopped);
        }
        rx.await.map_err(|_| RsmError::Stopped)
    }

    /// A point-in-time dump of the instance internals.
    pub async fn debug_info(&self) -> Result<DebugInfo, RsmError> {
        let (tx, rx) = oneshot::channel();
        if self.shared.cmd_tx.send(Command::DebugInfo { reply: tx }).is_err() {
            return Err(RsmError::Stopped);
        }
        rx.await.map_err(|_| RsmError::Stopped)
    }

    /// Build a snapshot payload from the in-memory state, for snapshot
    /// stores that serve blobs out of live replicas. `Stale` if the state
    /// has not reached `min_version` yet.
    pub async fn current_snapshot_blob(
        &self,
        min_version: Lsn,
    ) -> Result<(Lsn, Vec<u8>), RsmError> {
        let (tx, rx) = oneshot::channel();
        if self
            .shared
            .cmd_tx
            .send(Command::SnapshotBlob {
                min_version,
                reply: tx,
            })
            .is_err()
        {
            return Err(RsmError::Stopped);
        }
        rx.await.unwrap_or(Err(RsmError::Stopped))
    }
}

/// Unsubscribes its callback when dropped.
pub struct SubscriptionHandle {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    /// Unsubscribe now instead of at drop.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

/// All mutable engine state, owned by the driver task.
struct Core<S: StateMachine> {
    config: RsmConfig,
    machine: S,
    log_store: Arc<dyn LogStore>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,

    state: S::State,
    /// LSN of the most recent delta or snapshot reflected in `state`.
    version: Lsn,
    last_snapshot_version: Lsn,
    /// How far into the delta log the last applied snapshot had read.
    last_snapshot_read_ptr: Lsn,
    /// Highest delta-log position observed (record or gap hi).
    delta_read_ptr: Lsn,
    delta_log_byte_offset: u64,
    delta_log_offset: u64,
    last_snapshot_byte_offset: u64,
    last_snapshot_offset: u64,
    snapshot_log_timestamp: Timestamp,
    /// Snapshot-log tail at bootstrap: the last snapshot in the backlog.
    snapshot_sync: Lsn,
    /// Delta-log tail at bootstrap: replay is done when we reach it.
    delta_sync: Lsn,
    /// When valid, delta reading is stalled until a snapshot covers this.
    waiting_for_snapshot: Lsn,
    sync_state: SyncState,
    allow_fast_forward_up_to: Lsn,
    bumped_stalled_stat: bool,
    delta_read_stream_healthy: bool,
    state_delivery_blocked: bool,
    latest_published_version: Option<Lsn>,

    snapshot_reader: Option<Box<dyn ReadStream>>,
    delta_reader: Option<Box<dyn ReadStream>>,
    /// Snapshot reading paused for the fast-forward grace period.
    snapshot_paused: bool,
    stashed_snapshot: Option<ReadEvent>,
    stashed_delta: Option<ReadEvent>,
    /// While syncing the snapshot backlog, the newest record seen so far;
    /// only decoded once we know it was the last one.
    last_snapshot_record: Option<Record>,

    subscribers: Vec<(u64, UpdateCallback<S>)>,

    pending: BTreeMap<u64, Pending>,
    pending_by_uuid: HashMap<Uuid, u64>,
    pending_seq: u64,
    delta_appends_in_flight: usize,

    snapshot_in_flight: bool,
    last_written_version: Lsn,

    stop_scheduled: bool,
    stopped: bool,

    snapshot_fetch_timer: BackoffTimer,
    fast_forward_timer: TimerHandle,
    stall_timer: TimerHandle,
    snapshotting_timer: TimerHandle,

    timer_tx: mpsc::UnboundedSender<TimerFire>,
    timer_rx: mpsc::UnboundedReceiver<TimerFire>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
    cmd_rx: mpsc::UnboundedReceiver<Command<S>>,
    sync_state_tx: watch::Sender<SyncState>,
    versions_tx: watch::Sender<Versions>,
}

async fn next_or_pending(reader: Option<&mut Box<dyn ReadStream>>) -> Option<ReadEvent> {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

impl<S: StateMachine> Core<S> {
    async fn run(mut self) {
        self.bootstrap();

        loop {
            if self.stop_scheduled && !self.stopped {
                self.do_stop();
            }
            if self.stopped {
                break;
            }

            // Re-offer stashed events once their gate clears; resuming a
            // stalled stream is always the last step of whatever cleared it.
            if !self.snapshot_paused {
                if let Some(event) = self.stashed_snapshot.take() {
                    self.on_snapshot_read_event(event);
                    continue;
                }
            }
            if self.waiting_for_snapshot == Lsn::INVALID {
                if let Some(event) = self.stashed_delta.take() {
                    self.on_delta_read_event(event);
                    continue;
                }
            }

            let snapshot_active = self.snapshot_reader.is_some() && !self.snapshot_paused;
            let delta_active =
                self.delta_reader.is_some() && self.waiting_for_snapshot == Lsn::INVALID;

            let turn = {
                let Core {
                    timer_rx,
                    event_rx,
                    cmd_rx,
                    snapshot_reader,
                    delta_reader,
                    ..
                } = &mut self;
                tokio::select! {
                    biased;
                    Some(fire) = timer_rx.recv() => Turn::Timer(fire),
                    Some(event) = event_rx.recv() => Turn::Event(event),
                    cmd = cmd_rx.recv() => Turn::Command(cmd),
                    event = next_or_pending(snapshot_reader.as_mut()), if snapshot_active => {
                        Turn::SnapshotRead(event)
                    }
                    event = next_or_pending(delta_reader.as_mut()), if delta_active => {
                        Turn::DeltaRead(event)
                    }
                }
            };

            match turn {
                Turn::Timer(fire) => self.on_timer(fire),
                Turn::Event(event) => self.on_event(event),
                Turn::Command(Some(cmd)) => self.on_command(cmd),
                // Every handle is gone; nobody can observe us anymore.
                Turn::Command(None) => break,
                Turn::SnapshotRead(Some(event)) => self.on_snapshot_read_event(event),
                Turn::SnapshotRead(None) => self.snapshot_reader = None,
                Turn::DeltaRead(Some(event)) => self.on_delta_read_event(event),
                Turn::DeltaRead(None) => self.delta_reader = None,
            }
        }
    }

    fn on_command(&mut self, cmd: Command<S>) {
        match cmd {
            Command::WriteDelta {
                payload,
                mode,
                options,
                confirm,
            } => self.write_delta(payload, mode, options, confirm),
            Command::Snapshot { reply } => self.do_snapshot(Some(reply)),
            Command::Trim { retention, reply } => self.do_trim(retention, reply),
            Command::Subscribe { id, callback } => self.on_subscribe(id, callback),
            Command::Unsubscribe { id } => {
                self.subscribers.retain(|(sub_id, _)| *sub_id != id);
            }
            Command::BlockStateDelivery { blocked, reply } => {
                let _ = reply.send(self.block_state_delivery(blocked));
            }
            Command::DebugInfo { reply } => {
                let _ = reply.send(self.debug_info());
            }
            Command::SnapshotBlob { min_version, reply } => {
                let _ = reply.send(self.snapshot_blob_from_memory(min_version));
            }
            Command::Stop => self.stop_scheduled = true,
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::TailLsn {
                role: LogRole::Snapshot,
                lsn,
            } => self.on_got_snapshot_log_tail(lsn),
            Event::TailLsn {
                role: LogRole::Delta,
                lsn,
            } => self.on_got_delta_log_tail(lsn),
            Event::SnapshotFetched { result } => self.on_snapshot_fetched(result),
            Event::AppendDone { completion, result } => self.on_append_done(completion, result),
            Event::SnapshotWritten {
                result,
                byte_offset,
                offset,
                read_ptr,
                payload_size,
                reply,
            } => self.on_snapshot_written(result, byte_offset, offset, read_ptr, payload_size, reply),
        }
    }

    fn on_timer(&mut self, fire: TimerFire) {
        match fire.kind {
            TimerKind::SnapshotFetch => {
                if self.snapshot_fetch_timer.acknowledge(fire) {
                    self.fetch_snapshot();
                }
            }
            TimerKind::FastForwardGrace => {
                if self.fast_forward_timer.acknowledge(fire) {
                    debug!("fast-forward grace elapsed, resuming snapshot reading");
                    self.snapshot_paused = false;
                }
            }
            TimerKind::StallGrace => {
                if self.stall_timer.acknowledge(fire) {
                    self.on_stall_grace_expired();
                }
            }
            TimerKind::SnapshotPeriodic => {
                if self.snapshotting_timer.acknowledge(fire) {
                    self.on_snapshotting_tick();
                }
            }
            TimerKind::Confirm(uuid) => self.on_confirm_timeout(uuid),
        }
    }

    fn on_subscribe(&mut self, id: u64, mut callback: UpdateCallback<S>) {
        // A subscriber joining a live instance is seeded with the current
        // state right away; during replay it will be seeded when the tail
        // is reached.
        if self.sync_state == SyncState::Tailing {
            callback(&self.state, None, self.version);
        }
        self.subscribers.push((id, callback));
    }

    fn block_state_delivery(&mut self, blocked: bool) -> bool {
        let prev = self.state_delivery_blocked;
        self.state_delivery_blocked = blocked;
        if prev && !blocked {
            if self.sync_state == SyncState::Tailing || self.config.deliver_while_replaying {
                info!(version = %self.version, "state delivery unblocked, publishing catch-up state");
                self.notify_subscribers(None);
            } else {
                info!(
                    sync_state = %self.sync_state,
                    "state delivery unblocked, but not publishing while replaying"
                );
            }
        }
        prev
    }

    fn notify_subscribers(&mut self, delta: Option<&S::Delta>) {
        if self.subscribers.is_empty() {
            return;
        }

        if self.state_delivery_blocked {
            warn!(
                version = %self.version,
                latest_published = ?self.latest_published_version,
                "state delivery is blocked, not notifying subscribers"
            );
            return;
        }

        debug!(version = %self.version, "notifying subscribers");
        for (_, callback) in &mut self.subscribers {
            callback(&self.state, delta, self.version);
        }
        self.latest_published_version = Some(self.version);
        self.publish_in_memory_version();
    }

    fn publish_sync_state(&mut self, sync_state: SyncState) {
        self.sync_state = sync_state;
        self.sync_state_tx.send_replace(sync_state);
    }

    fn publish_in_memory_version(&self) {
        let version = self.version;
        self.versions_tx.send_if_modified(|v| {
            if v.in_memory == version {
                false
            } else {
                v.in_memory = version;
                true
            }
        });
        metrics::set_version(self.config.delta_log, version);
    }

    fn publish_durable_version(&self, durable: Lsn) {
        self.versions_tx.send_modify(|v| v.durable = durable);
    }

    fn debug_info(&self) -> DebugInfo {
        DebugInfo {
            delta_log: self.config.delta_log,
            snapshot_log: self.config.snapshot_log,
            sync_state: self.sync_state,
            version: self.version,
            last_snapshot_version: self.last_snapshot_version,
            delta_read_ptr: self.delta_read_ptr,
            delta_sync: self.delta_sync,
            snapshot_sync: self.snapshot_sync,
            waiting_for_snapshot: self.waiting_for_snapshot,
            delta_appends_in_flight: self.delta_appends_in_flight,
            pending_confirmations: self.pending.len(),
            snapshot_in_flight: self.snapshot_in_flight,
            last_snapshot_timestamp: self.snapshot_log_timestamp,
            bytes_since_last_snapshot: self
                .delta_log_byte_offset
                .saturating_sub(self.last_snapshot_byte_offset),
            records_since_last_snapshot: self
                .delta_log_offset
                .saturating_sub(self.last_snapshot_offset),
            delta_read_stream_healthy: self.delta_read_stream_healthy,
        }
    }
}
