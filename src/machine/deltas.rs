// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delta ingestion: record application, gap handling (trims and data
//! loss), tail detection and read-stream health.

use tracing::{debug, error, info, warn};

use super::{Core, LogRole, RsmError, SyncState, WriteError};
use crate::codec::delta as delta_codec;
use crate::metrics;
use crate::state::{ApplyError, StateMachine};
use crate::store::traits::ReadEvent;
use crate::types::{Gap, GapType, Lsn, Record};

impl<S: StateMachine> Core<S> {
    pub(super) fn on_delta_read_event(&mut self, event: ReadEvent) {
        // A stalled stream accepts nothing; the event is re-offered after
        // a snapshot covers the missing range.
        if self.waiting_for_snapshot.is_valid() {
            debug!(
                waiting_for_snapshot = %self.waiting_for_snapshot,
                "delta stream stalled, waiting for snapshot"
            );
            self.stashed_delta = Some(event);
            return;
        }

        match event {
            ReadEvent::Record(record) => self.on_delta_record(record),
            ReadEvent::Gap(gap) => self.on_delta_gap(gap),
            ReadEvent::HealthChange(healthy) => self.on_delta_stream_health_change(healthy),
        }
    }

    fn on_delta_record(&mut self, record: Record) {
        debug!(lsn = %record.lsn, "delta record");
        debug_assert!(record.lsn > self.delta_read_ptr);
        self.delta_read_ptr = record.lsn;

        // Live deltas keep arriving, so a pending fast-forward can wait a
        // little longer.
        if self.fast_forward_timer.is_active() {
            self.fast_forward_timer.activate(self.config.fast_forward_grace());
        }

        if record.lsn <= self.version || record.lsn <= self.last_snapshot_read_ptr {
            // Already covered by a snapshot.
            debug!(
                lsn = %record.lsn,
                version = %self.version,
                last_snapshot_read_ptr = %self.last_snapshot_read_ptr,
                "skipping delta record"
            );
            metrics::record_delta_skipped(self.config.delta_log);
            return;
        }

        let (header, body) = delta_codec::decode_frame(&record.payload);

        let mut applied_delta = None;
        let outcome: Result<(), ApplyError> = self
            .machine
            .deserialize_delta(body)
            .and_then(|delta| {
                self.machine
                    .apply_delta(&delta, &mut self.state, record.lsn, record.timestamp)
                    .map(|()| applied_delta = Some(delta))
            });

        match &outcome {
            Ok(()) => {
                debug!(lsn = %record.lsn, "applied delta record");
                metrics::record_delta_applied(self.config.delta_log, record.payload.len());
                // Only advance on success: the version is always the
                // version of the last delta (or snapshot) subscribers saw;
                // a delta that did not apply is not handed to them.
                self.version = record.lsn;
                self.publish_in_memory_version();
            }
            Err(e) => {
                info!(lsn = %record.lsn, error = %e, version = %self.version, "could not ingest delta record");
                metrics::record_delta_failed(self.config.delta_log);
            }
        }

        self.delta_log_byte_offset += record.payload.len() as u64;
        self.delta_log_offset += 1;

        if !header.uuid.is_nil() {
            if let Some(&seq) = self.pending_by_uuid.get(&header.uuid) {
                if self.state_delivery_blocked {
                    info!(
                        lsn = %record.lsn,
                        "own delta observed but confirmation delivery is blocked"
                    );
                } else if let Some(mut entry) = self.pending.remove(&seq) {
                    self.pending_by_uuid.remove(&header.uuid);
                    debug_assert!(entry.lsn == Lsn::INVALID || entry.lsn == record.lsn);
                    let result = match &outcome {
                        Ok(()) => {
                            metrics::record_confirmation(self.config.delta_log, "success");
                            Ok(record.lsn)
                        }
                        Err(e) => {
                            metrics::record_confirmation(self.config.delta_log, "error");
                            Err(WriteError::new(apply_error_kind(e), record.lsn))
                        }
                    };
                    if let Some(confirm) = entry.confirm.take() {
                        confirm(result);
                    }
                    metrics::set_pending_confirmations(self.config.delta_log, self.pending.len());
                }
            }
        }

        // Covers deltas whose header (and so UUID) did not survive the
        // trip: any pending write at or below the new version is lost.
        self.discard_skipped_pending_deltas();

        if outcome.is_ok()
            && (self.sync_state == SyncState::Tailing || self.config.deliver_while_replaying)
        {
            self.notify_subscribers(applied_delta.as_ref());
        }

        if self.sync_state == SyncState::SyncDeltas && record.lsn >= self.delta_sync {
            self.on_reached_delta_log_tail();
        }
    }

    fn on_delta_gap(&mut self, gap: Gap) {
        debug!(kind = %gap.kind, lo = %gap.lo, hi = %gap.hi, "delta gap");
        debug_assert!(gap.hi > self.delta_read_ptr);
        self.delta_read_ptr = gap.hi;

        if gap.hi <= self.version || gap.hi <= self.last_snapshot_read_ptr {
            debug!(
                kind = %gap.kind,
                hi = %gap.hi,
                version = %self.version,
                "skipping delta gap already covered by a snapshot"
            );
        } else if self.config.snapshot_log.is_none() && self.snapshot_store.is_none() {
            match gap.kind {
                GapType::DataLoss => {
                    error!(
                        lo = %gap.lo,
                        hi = %gap.hi,
                        delta_log = %self.config.delta_log,
                        "DATALOSS gap on delta log with no snapshot source"
                    );
                }
                GapType::Trim => {
                    // Without snapshots, a trim means the state restarts
                    // from its defaults at the trim point.
                    self.version = gap.hi;
                    self.state = self.machine.make_default_state(self.version);
                    self.publish_in_memory_version();
                    if self.sync_state == SyncState::Tailing
                        || self.config.deliver_while_replaying
                    {
                        self.notify_subscribers(None);
                    }
                }
                GapType::Bridge | GapType::Hole => {}
            }
        } else {
            // The gap hides deltas a snapshot must account for. TRIM at a
            // pristine bootstrap (version still at OLDEST from an empty
            // snapshot log migration) is the exception.
            let skipping_data = (gap.kind == GapType::DataLoss && self.config.stall_if_data_loss)
                || (gap.kind == GapType::Trim && self.version != Lsn::OLDEST);

            if skipping_data {
                warn!(
                    kind = %gap.kind,
                    lo = %gap.lo,
                    hi = %gap.hi,
                    delta_log = %self.config.delta_log,
                    "gap hides delta data; stalling until a covering snapshot arrives"
                );
                self.waiting_for_snapshot = gap.hi;
                // If no snapshot shows up within the grace period, surface
                // the stall so an operator can write one by hand.
                self.stall_timer.activate(self.config.fast_forward_grace());
                if self.snapshot_store.is_some() {
                    self.snapshot_fetch_timer.activate();
                }
            }
        }

        if self.sync_state == SyncState::SyncDeltas && gap.hi >= self.delta_sync {
            self.on_reached_delta_log_tail();
        }
    }

    pub(super) fn on_stall_grace_expired(&mut self) {
        if self.waiting_for_snapshot.is_valid() {
            warn!(
                waiting_for_snapshot = %self.waiting_for_snapshot,
                "still stalled after grace period"
            );
            metrics::set_stalled(self.config.delta_log, true);
            self.bumped_stalled_stat = true;
        }
    }

    fn on_delta_stream_health_change(&mut self, healthy: bool) {
        if self.delta_read_stream_healthy != healthy {
            info!(
                delta_log = %self.config.delta_log,
                healthy,
                "delta read stream health changed"
            );
            if healthy && self.sync_state == SyncState::Tailing {
                // The stream was unhealthy while tailing; writes may have
                // raced past us. Re-anchor the tail and replay up to it.
                self.publish_sync_state(SyncState::SyncDeltas);
                self.request_tail_lsn(LogRole::Delta);
            }
        }
        self.delta_read_stream_healthy = healthy;
    }
}

fn apply_error_kind(error: &ApplyError) -> RsmError {
    match error {
        ApplyError::Malformed(reason) => RsmError::BadMsg(reason.clone()),
        ApplyError::Rejected(reason) => RsmError::Failed(reason.clone()),
    }
}
