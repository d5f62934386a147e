// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bootstrap and teardown: tail-LSN anchoring, read stream creation,
//! the `SyncSnapshot → SyncDeltas → Tailing` progression, and stop.

use tracing::{debug, info};

use super::{Core, Event, LogRole, RsmError, SyncState, WriteError};
use crate::state::StateMachine;
use crate::store::traits::ReadOptions;
use crate::types::{Lsn, LogId};

impl<S: StateMachine> Core<S> {
    /// First thing the driver task does: publish the default state's
    /// version and kick off snapshot synchronization.
    pub(super) fn bootstrap(&mut self) {
        info!(
            delta_log = %self.config.delta_log,
            snapshot_log = ?self.config.snapshot_log,
            has_snapshot_store = self.snapshot_store.is_some(),
            "starting replicated state machine"
        );
        self.publish_in_memory_version();

        if self.snapshot_store.is_some() {
            info!("fetching base snapshot from snapshot store");
            self.snapshot_fetch_timer.activate();
        } else if self.config.snapshot_log.is_some() {
            self.request_tail_lsn(LogRole::Snapshot);
        } else {
            // No snapshot source at all: the base is the default state.
            self.on_base_snapshot_retrieved();
        }
    }

    pub(super) fn request_tail_lsn(&self, role: LogRole) {
        let log = match role {
            LogRole::Delta => self.config.delta_log,
            LogRole::Snapshot => match self.config.snapshot_log {
                Some(log) => log,
                None => return,
            },
        };
        info!(log = %log, ?role, "retrieving tail lsn");

        // The tail query has no timeout and is never cancelled; it must
        // complete. If the driver is gone by then, the send is a no-op.
        let store = self.log_store.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let lsn = store.tail_lsn(log).await;
            let _ = event_tx.send(Event::TailLsn { role, lsn });
        });
    }

    pub(super) fn on_got_snapshot_log_tail(&mut self, lsn: Lsn) {
        if self.sync_state != SyncState::SyncSnapshot {
            return;
        }
        info!(tail = %lsn, "snapshot log tail");
        self.snapshot_sync = lsn;

        // With stop_at_tail we never care about snapshots past the tail.
        let until = if self.config.stop_at_tail { lsn } else { Lsn::MAX };
        if let Some(log) = self.config.snapshot_log {
            if Lsn::OLDEST <= until {
                self.snapshot_reader = Some(self.open_reader(log, Lsn::OLDEST, until));
            }
        }

        if !lsn.is_valid() {
            // Empty snapshot log: there is no backlog snapshot to wait for.
            self.on_base_snapshot_retrieved();
        }
    }

    /// The last snapshot at or before `snapshot_sync` (or the default
    /// state) is in place; move on to the delta backlog.
    pub(super) fn on_base_snapshot_retrieved(&mut self) {
        info!(
            version = %self.version,
            delta_read_ptr = %self.last_snapshot_read_ptr,
            "base snapshot in place"
        );
        self.publish_in_memory_version();
        self.machine.on_initial_state(&self.state);
        self.publish_sync_state(SyncState::SyncDeltas);
        if !self.delta_read_ptr.is_valid() {
            self.delta_read_ptr = self.last_snapshot_read_ptr;
        }
        self.request_tail_lsn(LogRole::Delta);
    }

    pub(super) fn on_got_delta_log_tail(&mut self, lsn: Lsn) {
        if self.sync_state != SyncState::SyncDeltas {
            return;
        }
        info!(tail = %lsn, "delta log tail");
        self.delta_sync = lsn;

        let start = self.version.max(self.last_snapshot_read_ptr).next();
        let until = if self.config.stop_at_tail {
            self.delta_sync
        } else {
            Lsn::MAX
        };

        // stop_at_tail can leave nothing to read (start > until), and a
        // health recovery re-anchors the tail on an already-open reader.
        if self.delta_reader.is_none() && start <= until {
            self.delta_reader = Some(self.open_reader(self.config.delta_log, start, until));
        }

        if self.version >= self.delta_sync || self.delta_read_ptr >= self.delta_sync {
            // The base snapshot already accounts for the whole backlog.
            self.on_reached_delta_log_tail();
        }
    }

    fn open_reader(
        &self,
        log: LogId,
        start: Lsn,
        until: Lsn,
    ) -> Box<dyn crate::store::traits::ReadStream> {
        debug!(log = %log, start = %start, until = %until, "opening read stream");
        self.log_store.open_reader(
            log,
            start,
            until,
            ReadOptions {
                force_all_send_all: self.config.force_all_send_all,
            },
        )
    }

    /// The delta backlog is replayed; go live.
    pub(super) fn on_reached_delta_log_tail(&mut self) {
        self.publish_sync_state(SyncState::Tailing);
        info!(
            version = %self.version,
            deliver_while_replaying = self.config.deliver_while_replaying,
            stop_at_tail = self.config.stop_at_tail,
            "reached tail of delta log"
        );

        self.arm_snapshotting_timer();

        // Subscribers that were not fed during replay get the initial
        // state now.
        if !self.config.deliver_while_replaying {
            self.notify_subscribers(None);
        }

        if self.config.stop_at_tail {
            self.stop_scheduled = true;
        }
    }

    pub(super) fn do_stop(&mut self) {
        if self.stopped {
            return;
        }
        info!(version = %self.version, "stopping replicated state machine");

        self.snapshot_reader = None;
        self.delta_reader = None;
        self.stashed_snapshot = None;
        self.stashed_delta = None;
        self.last_snapshot_record = None;

        self.snapshot_fetch_timer.cancel();
        self.fast_forward_timer.cancel();
        self.stall_timer.cancel();
        self.snapshotting_timer.cancel();

        let pending: Vec<_> = std::mem::take(&mut self.pending).into_values().collect();
        self.pending_by_uuid.clear();
        for mut entry in pending {
            if let Some(confirm) = entry.confirm.take() {
                confirm(Err(WriteError::new(RsmError::Stopped, entry.lsn)));
            }
        }

        self.stopped = true;
        // Releases every wait() caller.
        self.publish_sync_state(SyncState::Stopped);
    }
}
