// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retention: trimming the snapshot and delta logs.
//!
//! Without a snapshot store, both logs are trimmed by a retention cutoff
//! timestamp, snapshot log first. With a log-backed store, the snapshot
//! log is still trimmed by time but the delta log is trimmed up to the
//! store's durable version, which is exact.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::info;

use super::{Core, RsmError};
use crate::state::StateMachine;
use crate::store::traits::{LogStore, SnapshotStore, StoreError};
use crate::types::{now_millis, Lsn, LogId, Timestamp};

const TRIM_AND_FINDTIME_TIMEOUT: Duration = Duration::from_secs(20);

impl<S: StateMachine> Core<S> {
    pub(super) fn do_trim(&self, retention: Duration, reply: oneshot::Sender<Result<(), RsmError>>) {
        let log_store = self.log_store.clone();
        let snapshot_store = self.snapshot_store.clone();
        let delta_log = self.config.delta_log;
        let snapshot_log = self.config.snapshot_log;
        let cutoff = now_millis().saturating_sub(retention.as_millis() as Timestamp);

        tokio::spawn(async move {
            let result = run_trim(log_store, snapshot_store, delta_log, snapshot_log, cutoff).await;
            let _ = reply.send(result);
        });
    }
}

async fn run_trim(
    log_store: Arc<dyn LogStore>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    delta_log: LogId,
    snapshot_log: Option<LogId>,
    cutoff: Timestamp,
) -> Result<(), RsmError> {
    // The snapshot log (when present) always goes first so the delta log
    // is never retained shorter than the snapshots covering it.
    if let Some(log) = snapshot_log {
        trim_by_time(&*log_store, log, cutoff).await?;
    }

    match snapshot_store {
        None => trim_by_time(&*log_store, delta_log, cutoff).await,
        Some(store) => {
            let durable = store
                .durable_version()
                .await
                .map_err(trim_error)?
                .ok_or(RsmError::NotFound)?;
            info!(delta_log = %delta_log, up_to = %durable, "trimming delta log to durable version");
            log_store
                .trim(delta_log, durable, TRIM_AND_FINDTIME_TIMEOUT)
                .await
                .map_err(trim_error)
        }
    }
}

async fn trim_by_time(log_store: &dyn LogStore, log: LogId, cutoff: Timestamp) -> Result<(), RsmError> {
    let up_to = log_store
        .find_time(log, cutoff, TRIM_AND_FINDTIME_TIMEOUT)
        .await
        .map_err(trim_error)?;
    if up_to == Lsn::INVALID {
        info!(log = %log, "nothing to trim before the retention cutoff");
        return Ok(());
    }
    info!(log = %log, up_to = %up_to, "trimming log by retention");
    log_store
        .trim(log, up_to, TRIM_AND_FINDTIME_TIMEOUT)
        .await
        .map_err(trim_error)
}

fn trim_error(error: StoreError) -> RsmError {
    match error {
        StoreError::Timeout => RsmError::TimedOut("trim".into()),
        StoreError::NotFound => RsmError::NotFound,
        StoreError::Backend(reason) => RsmError::Failed(reason),
    }
}
