// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot ingestion: the snapshot-store fetch path, the snapshot-log
//! read path, fast-forward admission and stall recovery.

use tracing::{debug, error, info, warn};

use super::{Core, Event, SyncState};
use crate::codec::snapshot::{self as snapshot_codec, FORMAT_WITH_READ_PTR};
use crate::metrics;
use crate::state::StateMachine;
use crate::store::traits::{ReadEvent, SnapshotFetch, StoreError};
use crate::types::{Lsn, SnapshotAttributes};

impl<S: StateMachine> Core<S> {
    /// Ask the snapshot store for anything at or past what we are missing.
    pub(super) fn fetch_snapshot(&mut self) {
        let store = match &self.snapshot_store {
            Some(store) => store.clone(),
            None => return,
        };
        let min_version = self.waiting_for_snapshot.max(self.version);
        info!(
            min_version = %min_version,
            waiting_for_snapshot = %self.waiting_for_snapshot,
            version = %self.version,
            sync_state = %self.sync_state,
            "fetching snapshot"
        );

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = store.get_snapshot(min_version).await;
            let _ = event_tx.send(Event::SnapshotFetched { result });
        });
    }

    pub(super) fn on_snapshot_fetched(&mut self, result: Result<SnapshotFetch, StoreError>) {
        match result {
            Ok(SnapshotFetch::Snapshot { blob, attrs }) => {
                info!(
                    base_version = %attrs.base_version,
                    size = blob.len(),
                    "snapshot store returned a snapshot"
                );
                self.snapshot_sync = attrs.base_version;
                if !self.process_snapshot(&blob, attrs) {
                    self.snapshot_fetch_timer.activate();
                }
            }
            Ok(SnapshotFetch::UpToDate) | Ok(SnapshotFetch::Empty) => {
                // Nothing to fetch. Only meaningful as a bootstrap answer;
                // once past snapshot sync it must not move anchors.
                if self.sync_state == SyncState::SyncSnapshot {
                    self.on_base_snapshot_retrieved();
                }
            }
            Err(e) => {
                warn!(error = %e, "snapshot fetch failed, will retry");
                self.snapshot_fetch_timer.activate();
            }
        }
    }

    pub(super) fn on_snapshot_read_event(&mut self, event: ReadEvent) {
        match event {
            ReadEvent::Record(record) => {
                debug!(lsn = %record.lsn, "snapshot record");
                if self.sync_state == SyncState::SyncSnapshot && record.lsn < self.snapshot_sync {
                    // Not the last snapshot in the backlog; decode only the
                    // newest one, once the gap past the tail confirms it.
                    self.last_snapshot_record = Some(record);
                    return;
                }

                self.last_snapshot_record = None;
                let attrs = SnapshotAttributes {
                    base_version: record.lsn,
                    timestamp: record.timestamp,
                };
                if !self.process_snapshot(&record.payload, attrs) {
                    self.snapshot_paused = true;
                    self.stashed_snapshot = Some(ReadEvent::Record(record));
                }
            }
            ReadEvent::Gap(gap) => {
                info!(
                    kind = %gap.kind,
                    lo = %gap.lo,
                    hi = %gap.hi,
                    sync_state = %self.sync_state,
                    snapshot_sync = %self.snapshot_sync,
                    "snapshot log gap"
                );
                if !self.on_snapshot_gap_reaches_sync(gap.hi) {
                    self.snapshot_paused = true;
                    self.stashed_snapshot = Some(ReadEvent::Gap(gap));
                }
            }
            ReadEvent::HealthChange(_) => {}
        }
    }

    /// A gap at or past `snapshot_sync` means every backlog snapshot has
    /// been seen; apply the stashed newest one and finish snapshot sync.
    /// Returns false when the stashed snapshot is bad and we must not make
    /// progress past it.
    fn on_snapshot_gap_reaches_sync(&mut self, gap_hi: Lsn) -> bool {
        if self.sync_state != SyncState::SyncSnapshot || gap_hi < self.snapshot_sync {
            return true;
        }

        if let Some(record) = self.last_snapshot_record.take() {
            let attrs = SnapshotAttributes {
                base_version: record.lsn,
                timestamp: record.timestamp,
            };
            if !self.process_snapshot(&record.payload, attrs) {
                self.last_snapshot_record = Some(record);
                return false;
            }
        }
        self.on_base_snapshot_retrieved();
        true
    }

    /// The single snapshot apply path, shared by the store fetch and the
    /// snapshot log. Returns false when the snapshot could not be used and
    /// the caller should retry later (bad payload, or fast-forward denied
    /// by the grace period).
    pub(super) fn process_snapshot(&mut self, payload: &[u8], attrs: SnapshotAttributes) -> bool {
        let decoded = snapshot_codec::parse(payload)
            .map_err(|e| e.to_string())
            .and_then(|(header, body)| {
                self.machine
                    .deserialize_state(&body, header.base_version, attrs.timestamp)
                    .map(|state| (header, state))
                    .map_err(|e| e.to_string())
            });

        let header = match decoded {
            Err(reason) => {
                // Without a usable snapshot we cannot cover gaps; unless
                // configured to skip, the machine stalls until a newer
                // snapshot is written.
                error!(
                    base_version = %attrs.base_version,
                    %reason,
                    "could not deserialize snapshot"
                );
                metrics::record_snapshot_decode_error(self.config.delta_log);
                if !self.config.can_skip_bad_snapshot {
                    return false;
                }
                None
            }
            Ok((header, new_state)) => {
                if header.base_version > self.version {
                    if self.sync_state == SyncState::Tailing
                        && self.waiting_for_snapshot == Lsn::INVALID
                        && !self.can_fast_forward(header.base_version)
                    {
                        debug!(base_version = %header.base_version, "cannot fast forward yet");
                        return false;
                    }

                    self.state = new_state;
                    self.version = header.base_version;
                    self.last_snapshot_version = header.base_version;
                    self.last_snapshot_read_ptr = if header.format_version >= FORMAT_WITH_READ_PTR
                    {
                        header.delta_log_read_ptr
                    } else {
                        Lsn::INVALID
                    };
                    self.delta_log_byte_offset = header.byte_offset;
                    self.delta_log_offset = header.offset;
                    self.snapshot_log_timestamp = attrs.timestamp;

                    info!(
                        base_version = %header.base_version,
                        delta_log_read_ptr = %self.last_snapshot_read_ptr,
                        format_version = header.format_version,
                        sync_state = %self.sync_state,
                        "applied snapshot"
                    );
                    metrics::record_snapshot_applied(self.config.delta_log);

                    self.publish_in_memory_version();
                    if self.sync_state == SyncState::Tailing || self.config.deliver_while_replaying
                    {
                        self.notify_subscribers(None);
                    }
                } else if header.format_version >= FORMAT_WITH_READ_PTR
                    && header.delta_log_read_ptr > self.last_snapshot_read_ptr
                {
                    // Same base version, further read pointer: the snapshot
                    // covers more of the delta log without changing state.
                    // Update the metadata only; subscribers see nothing new.
                    self.last_snapshot_read_ptr = header.delta_log_read_ptr;
                    self.delta_log_byte_offset = header.byte_offset;
                    self.delta_log_offset = header.offset;
                    self.snapshot_log_timestamp = attrs.timestamp;
                    info!(
                        base_version = %header.base_version,
                        delta_log_read_ptr = %header.delta_log_read_ptr,
                        "advanced snapshot read pointer"
                    );
                }
                Some(header)
            }
        };

        if let Some(header) = header {
            // Snapshots can arrive unordered and snapshot() may have raced
            // ahead; these only ever move forward.
            self.last_snapshot_byte_offset = self.last_snapshot_byte_offset.max(header.byte_offset);
            self.last_snapshot_offset = self.last_snapshot_offset.max(header.offset);
        }

        if self.sync_state == SyncState::SyncSnapshot && attrs.base_version >= self.snapshot_sync {
            self.on_base_snapshot_retrieved();
        }

        if self.waiting_for_snapshot.is_valid()
            && (self.version >= self.waiting_for_snapshot
                || self.last_snapshot_read_ptr >= self.waiting_for_snapshot)
        {
            // The snapshot accounts for the data the delta log lost; delta
            // reading resumes once this call unwinds (clearing the gate is
            // enough, the driver re-offers the stashed event).
            info!(
                waiting_for_snapshot = %self.waiting_for_snapshot,
                version = %self.version,
                "snapshot covers the missing delta range, resuming delta reading"
            );
            self.waiting_for_snapshot = Lsn::INVALID;
            self.stall_timer.cancel();
            if self.bumped_stalled_stat {
                metrics::set_stalled(self.config.delta_log, false);
                self.bumped_stalled_stat = false;
            }
        }

        // A fast-forward may have jumped over writes we were asked to
        // confirm.
        self.discard_skipped_pending_deltas();

        self.fast_forward_timer.cancel();

        true
    }

    /// Fast-forward admission: a newer snapshot observed while tailing
    /// must wait out a grace period before replacing live state, so bursts
    /// of snapshots do not thrash subscribers. Arms (or extends) the grace
    /// timer and returns false until it has expired.
    pub(super) fn can_fast_forward(&mut self, lsn: Lsn) -> bool {
        if self.fast_forward_timer.is_active() {
            return false;
        }

        if self.allow_fast_forward_up_to < lsn {
            self.allow_fast_forward_up_to = lsn;
            self.fast_forward_timer.activate(self.config.fast_forward_grace());
            return false;
        }

        info!(
            version = %self.version,
            snapshot_version = %lsn,
            "fast forwarding to snapshot"
        );
        true
    }
}
