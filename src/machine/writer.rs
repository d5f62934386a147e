// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The write path: preflight checks, delta framing, append dispatch and
//! pending-confirmation bookkeeping.
//!
//! A pending confirmation is resolved exactly once, by whichever comes
//! first: the delta is read back and applied (or fails to), the append
//! itself fails, a snapshot fast-forwards past the append's LSN, or the
//! per-write confirmation timer fires.

use tracing::{error, info, warn};

use super::{AppendCompletion, ConfirmCallback, Core, Event, Pending, RsmError, SyncState,
    WriteError, WriteMode, WriteOptions};
use crate::codec::delta as delta_codec;
use crate::metrics;
use crate::state::StateMachine;
use crate::store::traits::StoreError;
use crate::types::Lsn;
use uuid::Uuid;

impl<S: StateMachine> Core<S> {
    pub(super) fn write_delta(
        &mut self,
        payload: Vec<u8>,
        mode: WriteMode,
        options: WriteOptions,
        confirm: ConfirmCallback,
    ) {
        if self.stopped {
            confirm(Err(WriteError::new(RsmError::Stopped, Lsn::INVALID)));
            return;
        }

        if mode == WriteMode::ConfirmApplied {
            if self.sync_state != SyncState::Tailing {
                // Cannot promise applied-locally while replaying: the
                // delta would be read as backlog, not as our own write.
                confirm(Err(WriteError::new(
                    RsmError::Again("still replaying the delta backlog".into()),
                    Lsn::INVALID,
                )));
                return;
            }
            if !self.delta_read_stream_healthy {
                info!(
                    delta_log = %self.config.delta_log,
                    "refusing confirmed write while the delta read stream is unhealthy"
                );
                confirm(Err(WriteError::new(
                    RsmError::Again("delta read stream is unhealthy".into()),
                    Lsn::INVALID,
                )));
                return;
            }
            if self.pending.len() > self.config.max_pending_confirmation {
                confirm(Err(WriteError::new(RsmError::NoBufs, Lsn::INVALID)));
                return;
            }
            if !self.config.write_delta_header {
                // The header carries the UUID that matches the write to
                // its readback; without it there is nothing to confirm.
                confirm(Err(WriteError::new(
                    RsmError::NotSupported("confirmed writes need write_delta_header".into()),
                    Lsn::INVALID,
                )));
                return;
            }
        }

        if let Some(base_version) = options.base_version {
            if base_version < self.version {
                info!(
                    delta_log = %self.config.delta_log,
                    base_version = %base_version,
                    version = %self.version,
                    "conditional write lost the version race"
                );
                confirm(Err(WriteError::new(
                    RsmError::Stale(format!("{} < {}", base_version, self.version)),
                    Lsn::INVALID,
                )));
                return;
            }
            if base_version > self.version {
                // The local state can never be behind the caller; the
                // caller fabricated a version.
                confirm(Err(WriteError::new(
                    RsmError::Failed(format!(
                        "base version {} is ahead of local version {}",
                        base_version, self.version
                    )),
                    Lsn::INVALID,
                )));
                return;
            }
        }

        let uuid = Uuid::new_v4();
        let framed = if self.config.write_delta_header {
            delta_codec::encode_frame(uuid, &payload)
        } else {
            payload
        };

        let completion = match mode {
            WriteMode::ConfirmApplied => {
                let seq = self.pending_seq;
                self.pending_seq += 1;
                self.pending.insert(
                    seq,
                    Pending {
                        uuid,
                        lsn: Lsn::INVALID,
                        confirm: Some(confirm),
                        timeout: options.timeout.unwrap_or(self.config.confirm_timeout()),
                    },
                );
                self.pending_by_uuid.insert(uuid, seq);
                metrics::set_pending_confirmations(self.config.delta_log, self.pending.len());
                AppendCompletion::Applied { uuid }
            }
            WriteMode::ConfirmAppendOnly => AppendCompletion::AppendOnly(confirm),
        };

        self.delta_appends_in_flight += 1;
        let store = self.log_store.clone();
        let event_tx = self.event_tx.clone();
        let log = self.config.delta_log;
        let timeout = options.timeout.unwrap_or(self.config.delta_append_timeout());
        tokio::spawn(async move {
            let result = store.append(log, framed, timeout).await;
            let _ = event_tx.send(Event::AppendDone { completion, result });
        });
    }

    pub(super) fn on_append_done(
        &mut self,
        completion: AppendCompletion,
        result: Result<Lsn, StoreError>,
    ) {
        debug_assert!(self.delta_appends_in_flight > 0);
        self.delta_appends_in_flight -= 1;

        match &result {
            Ok(lsn) => info!(lsn = %lsn, "wrote delta"),
            Err(e) => error!(error = %e, "could not write delta"),
        }

        match completion {
            AppendCompletion::AppendOnly(confirm) => match result {
                Ok(lsn) => confirm(Ok(lsn)),
                Err(e) => confirm(Err(WriteError::new(store_error_kind(e), Lsn::INVALID))),
            },
            AppendCompletion::Applied { uuid } => {
                let seq = match self.pending_by_uuid.get(&uuid) {
                    Some(&seq) => seq,
                    // Already resolved (e.g. discarded by a fast-forward).
                    None => return,
                };
                match result {
                    Ok(lsn) => {
                        if let Some(entry) = self.pending.get_mut(&seq) {
                            entry.lsn = lsn;
                            let timeout = entry.timeout;
                            crate::timer::schedule_fire(
                                self.timer_tx.clone(),
                                crate::timer::TimerKind::Confirm(uuid),
                                timeout,
                            );
                        }
                        // A snapshot may have fast-forwarded past this LSN
                        // while the append was in flight.
                        self.discard_skipped_pending_deltas();
                    }
                    Err(e) => {
                        if let Some(mut entry) = self.pending.remove(&seq) {
                            self.pending_by_uuid.remove(&uuid);
                            metrics::record_confirmation(self.config.delta_log, "append_error");
                            metrics::set_pending_confirmations(
                                self.config.delta_log,
                                self.pending.len(),
                            );
                            if let Some(confirm) = entry.confirm.take() {
                                confirm(Err(WriteError::new(store_error_kind(e), Lsn::INVALID)));
                            }
                        }
                    }
                }
            }
        }
    }

    pub(super) fn on_confirm_timeout(&mut self, uuid: Uuid) {
        let seq = match self.pending_by_uuid.get(&uuid) {
            Some(&seq) => seq,
            // Resolved before the timer fired.
            None => return,
        };
        let Some(mut entry) = self.pending.remove(&seq) else {
            return;
        };
        self.pending_by_uuid.remove(&uuid);

        error!(
            lsn = %entry.lsn,
            "timed out waiting to observe own delta; the state machine is not keeping up"
        );
        metrics::record_confirmation(self.config.delta_log, "timeout");
        metrics::set_pending_confirmations(self.config.delta_log, self.pending.len());
        if let Some(confirm) = entry.confirm.take() {
            confirm(Err(WriteError::new(
                RsmError::TimedOut("delta was appended but never observed locally".into()),
                entry.lsn,
            )));
        }
    }

    /// Fail every pending write whose appended LSN the state has already
    /// moved past: a snapshot covered it, so its readback will never be
    /// matched and the outcome of the operation cannot be known.
    pub(super) fn discard_skipped_pending_deltas(&mut self) {
        loop {
            let skipped = match self.pending.first_key_value() {
                Some((_, front)) => front.lsn.is_valid() && front.lsn <= self.version,
                None => break,
            };
            if !skipped {
                break;
            }
            if let Some((_, mut entry)) = self.pending.pop_first() {
                self.pending_by_uuid.remove(&entry.uuid);
                warn!(lsn = %entry.lsn, "discarding pending confirmation skipped by a snapshot");
                metrics::record_confirmation(self.config.delta_log, "skipped");
                if let Some(confirm) = entry.confirm.take() {
                    confirm(Err(WriteError::new(
                        RsmError::Failed("Cannot confirm operation".into()),
                        entry.lsn,
                    )));
                }
            }
        }
        metrics::set_pending_confirmations(self.config.delta_log, self.pending.len());
    }
}

fn store_error_kind(error: StoreError) -> RsmError {
    match error {
        StoreError::Timeout => RsmError::TimedOut("append timed out".into()),
        StoreError::NotFound => RsmError::NotFound,
        StoreError::Backend(reason) => RsmError::Failed(reason),
    }
}
