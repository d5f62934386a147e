// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot emission: serializing the live state into the snapshot store
//! or snapshot log, and the time-based trigger that keeps replay cost
//! bounded.

use tracing::{debug, error, info};

use super::{Core, Event, RsmError, SnapshotOutcome, SnapshotReply, SyncState};
use crate::codec::snapshot::{self as snapshot_codec, SnapshotHeader, FORMAT_BASE, FORMAT_WITH_READ_PTR};
use crate::codec::CodecError;
use crate::metrics;
use crate::state::StateMachine;
use crate::store::traits::{SnapshotWrite, StoreError};
use crate::types::Lsn;

impl<S: StateMachine> Core<S> {
    /// Arm the periodic snapshot trigger; a no-op while already armed, so
    /// re-entering `Tailing` after a health regression does not double it.
    pub(super) fn arm_snapshotting_timer(&mut self) {
        if !self.snapshotting_timer.is_active() {
            self.snapshotting_timer.activate(self.config.snapshotting_period());
        }
    }

    pub(super) fn on_snapshotting_tick(&mut self) {
        let store_allows = self
            .snapshot_store
            .as_ref()
            .is_some_and(|store| store.is_writable());
        let machine_allows = self.machine.can_snapshot();
        debug!(store_allows, machine_allows, "time-based snapshot trigger");

        if store_allows || machine_allows {
            // Taken regardless of whether new deltas arrived; an unchanged
            // snapshot resolves as up to date.
            info!("taking a time-based snapshot");
            self.do_snapshot(None);
        } else {
            debug!("not the designated snapshotter, skipping time-based snapshot");
        }

        self.arm_snapshotting_timer();
    }

    pub(super) fn do_snapshot(&mut self, reply: Option<SnapshotReply>) {
        if self.config.snapshot_log.is_none() && self.snapshot_store.is_none() {
            error!("cannot snapshot: no snapshot log or store configured");
            respond(reply, Err(RsmError::NotSupported("no snapshot log configured".into())));
            return;
        }
        if self.snapshot_in_flight {
            respond(reply, Err(RsmError::InProgress));
            return;
        }
        if self.sync_state != SyncState::Tailing {
            respond(
                reply,
                Err(RsmError::Again("still replaying the backlog".into())),
            );
            return;
        }

        let include_read_ptr = self.config.include_read_pointer_in_snapshot;
        if include_read_ptr && self.delta_read_ptr < self.version {
            error!(
                delta_read_ptr = %self.delta_read_ptr,
                version = %self.version,
                "refusing to snapshot: read pointer behind version"
            );
            respond(
                reply,
                Err(RsmError::Failed("delta read pointer is behind the version".into())),
            );
            return;
        }

        info!(
            version = %self.version,
            delta_read_ptr = %self.delta_read_ptr,
            compression = self.config.snapshot_compression,
            "creating snapshot"
        );

        let payload = match self.create_snapshot_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "could not serialize snapshot");
                respond(reply, Err(RsmError::Failed(e.to_string())));
                return;
            }
        };

        let byte_offset = self.delta_log_byte_offset;
        let offset = self.delta_log_offset;
        let read_ptr = self.delta_read_ptr;

        // With a store, an unchanged state does not need another write.
        let writing = self.snapshot_store.is_none()
            || self.version > self.last_written_version
            || (include_read_ptr && self.last_snapshot_read_ptr < read_ptr);
        if !writing {
            debug!(
                version = %self.version,
                last_written_version = %self.last_written_version,
                "snapshot already durable, skipping write"
            );
            self.publish_durable_version(self.last_written_version);
            respond(reply, Ok(SnapshotOutcome::UpToDate));
            return;
        }

        self.snapshot_in_flight = true;
        let payload_size = payload.len();
        let event_tx = self.event_tx.clone();
        let version = self.version;

        if let Some(store) = self.snapshot_store.clone() {
            tokio::spawn(async move {
                let result = store.write_snapshot(version, payload).await;
                let _ = event_tx.send(Event::SnapshotWritten {
                    result,
                    byte_offset,
                    offset,
                    read_ptr,
                    payload_size,
                    reply,
                });
            });
        } else if let Some(log) = self.config.snapshot_log {
            let store = self.log_store.clone();
            let timeout = self.config.snapshot_append_timeout();
            tokio::spawn(async move {
                let result = store
                    .append(log, payload, timeout)
                    .await
                    .map(SnapshotWrite::Written);
                let _ = event_tx.send(Event::SnapshotWritten {
                    result,
                    byte_offset,
                    offset,
                    read_ptr,
                    payload_size,
                    reply,
                });
            });
        }
    }

    pub(super) fn on_snapshot_written(
        &mut self,
        result: Result<SnapshotWrite, StoreError>,
        byte_offset: u64,
        offset: u64,
        read_ptr: Lsn,
        payload_size: usize,
        reply: Option<SnapshotReply>,
    ) {
        self.snapshot_in_flight = false;

        match result {
            Ok(SnapshotWrite::Written(version)) => {
                // Other snapshots may have been read while this write was
                // in flight; the since-last-snapshot counters only move
                // forward.
                self.last_snapshot_byte_offset = self.last_snapshot_byte_offset.max(byte_offset);
                self.last_snapshot_offset = self.last_snapshot_offset.max(offset);
                self.last_written_version = version;
                self.last_snapshot_read_ptr = self.last_snapshot_read_ptr.max(read_ptr);
                info!(
                    version = %version,
                    read_ptr = %read_ptr,
                    size = payload_size,
                    "snapshot written"
                );
                metrics::record_snapshot_written(self.config.delta_log, "success", payload_size);
                self.publish_durable_version(version);
                self.machine.on_snapshot_created(payload_size);
                respond(reply, Ok(SnapshotOutcome::Written { version }));
            }
            Ok(SnapshotWrite::UpToDate(version)) => {
                self.publish_durable_version(version);
                respond(reply, Ok(SnapshotOutcome::UpToDate));
            }
            Err(e) => {
                info!(error = %e, "writing snapshot failed");
                metrics::record_snapshot_written(self.config.delta_log, "error", 0);
                self.last_written_version = Lsn::INVALID;
                self.publish_durable_version(Lsn::INVALID);
                respond(
                    reply,
                    Err(match e {
                        StoreError::Timeout => RsmError::TimedOut("snapshot write".into()),
                        other => RsmError::Failed(other.to_string()),
                    }),
                );
            }
        }
    }

    /// Serve a snapshot payload straight from the in-memory state, for
    /// snapshot stores backed by live replicas.
    pub(super) fn snapshot_blob_from_memory(
        &self,
        min_version: Lsn,
    ) -> Result<(Lsn, Vec<u8>), RsmError> {
        debug!(min_version = %min_version, version = %self.version, "snapshot from memory");
        if min_version > self.version {
            return Err(RsmError::Stale(format!(
                "requested {} but state is at {}",
                min_version, self.version
            )));
        }
        let payload = self
            .create_snapshot_payload()
            .map_err(|e| RsmError::Failed(e.to_string()))?;
        Ok((self.version, payload))
    }

    fn create_snapshot_payload(&self) -> Result<Vec<u8>, CodecError> {
        let include_read_ptr = self.config.include_read_pointer_in_snapshot;
        let header = SnapshotHeader {
            format_version: if include_read_ptr {
                FORMAT_WITH_READ_PTR
            } else {
                FORMAT_BASE
            },
            flags: 0,
            byte_offset: self.delta_log_byte_offset,
            offset: self.delta_log_offset,
            base_version: self.version,
            delta_log_read_ptr: self.delta_read_ptr,
        };
        let body = self.machine.serialize_state(&self.state);
        snapshot_codec::compose(header, &body, self.config.snapshot_compression)
    }
}

fn respond(reply: Option<SnapshotReply>, result: Result<SnapshotOutcome, RsmError>) {
    match reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            // Time-based trigger: nobody to tell, just log the outcome.
            match result {
                Ok(outcome) => debug!(?outcome, "time-based snapshot finished"),
                Err(e) => error!(error = %e, "time-based snapshot failed"),
            }
        }
    }
}
