// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory log substrate and snapshot store.
//!
//! Faithful enough to exercise every engine path: readers tail live
//! appends, trims synthesize TRIM gaps, and tests can inject arbitrary
//! gaps and health transitions. Not durable, obviously.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::traits::{
    LogStore, ReadEvent, ReadOptions, ReadStream, SnapshotFetch, SnapshotStore, SnapshotWrite,
    StoreError,
};
use crate::types::{now_millis, Gap, GapType, Lsn, LogId, Record, SnapshotAttributes, Timestamp};

#[derive(Debug, Clone)]
enum StoredEvent {
    Record(Record),
    Gap(Gap),
    Health(bool),
}

#[derive(Default)]
struct LogInner {
    events: Vec<StoredEvent>,
    /// Next LSN to assign to an append.
    next_lsn: u64,
    /// Highest LSN present (record or gap hi).
    last_lsn: Lsn,
    trim_point: Lsn,
}

struct LogShared {
    inner: Mutex<LogInner>,
    /// Bumped on every mutation; readers wait on it.
    version_tx: watch::Sender<u64>,
}

impl LogShared {
    fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                next_lsn: Lsn::OLDEST.0,
                ..LogInner::default()
            }),
            version_tx: watch::Sender::new(0),
        }
    }

    fn bump(&self) {
        self.version_tx.send_modify(|v| *v += 1);
    }
}

/// An in-memory [`LogStore`].
///
/// # Example
///
/// ```
/// use replistate::{LogId, Lsn, MemoryLogStore};
/// use replistate::store::traits::LogStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryLogStore::new();
/// let lsn = store
///     .append(LogId(1), b"payload".to_vec(), std::time::Duration::from_secs(1))
///     .await
///     .unwrap();
/// assert_eq!(lsn, Lsn::OLDEST);
/// assert_eq!(store.tail_lsn(LogId(1)).await, lsn);
/// # }
/// ```
#[derive(Default)]
pub struct MemoryLogStore {
    logs: Mutex<HashMap<LogId, Arc<LogShared>>>,
}

impl MemoryLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, id: LogId) -> Arc<LogShared> {
        self.logs
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(LogShared::new()))
            .clone()
    }

    /// Insert a gap record. Advances the tail to `hi`.
    pub fn inject_gap(&self, log: LogId, kind: GapType, lo: Lsn, hi: Lsn) {
        let shared = self.log(log);
        {
            let mut inner = shared.inner.lock();
            inner.events.push(StoredEvent::Gap(Gap { kind, lo, hi }));
            inner.next_lsn = inner.next_lsn.max(hi.0 + 1);
            inner.last_lsn = inner.last_lsn.max(hi);
        }
        shared.bump();
    }

    /// Report a reader health transition to everyone tailing `log`.
    pub fn set_health(&self, log: LogId, healthy: bool) {
        let shared = self.log(log);
        shared.inner.lock().events.push(StoredEvent::Health(healthy));
        shared.bump();
    }

    /// Where the log is trimmed to.
    #[must_use]
    pub fn trim_point(&self, log: LogId) -> Lsn {
        self.log(log).inner.lock().trim_point
    }

    /// Number of records ever appended to `log`.
    #[must_use]
    pub fn record_count(&self, log: LogId) -> usize {
        self.log(log)
            .inner
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, StoredEvent::Record(_)))
            .count()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn tail_lsn(&self, log: LogId) -> Lsn {
        let shared = self.log(log);
        let inner = shared.inner.lock();
        inner.last_lsn.max(inner.trim_point)
    }

    fn open_reader(
        &self,
        log: LogId,
        start: Lsn,
        until: Lsn,
        _options: ReadOptions,
    ) -> Box<dyn ReadStream> {
        let shared = self.log(log);
        let version_rx = shared.version_tx.subscribe();
        Box::new(MemoryReadStream {
            shared,
            version_rx,
            cursor: 0,
            start,
            until,
            last_delivered: Lsn(start.0.saturating_sub(1)),
            done: false,
        })
    }

    async fn append(
        &self,
        log: LogId,
        payload: Vec<u8>,
        _timeout: Duration,
    ) -> Result<Lsn, StoreError> {
        let shared = self.log(log);
        let lsn = {
            let mut inner = shared.inner.lock();
            let lsn = Lsn(inner.next_lsn);
            inner.next_lsn += 1;
            inner.last_lsn = lsn;
            inner.events.push(StoredEvent::Record(Record {
                lsn,
                timestamp: now_millis(),
                payload,
            }));
            lsn
        };
        shared.bump();
        Ok(lsn)
    }

    async fn find_time(
        &self,
        log: LogId,
        cutoff: Timestamp,
        _timeout: Duration,
    ) -> Result<Lsn, StoreError> {
        let shared = self.log(log);
        let inner = shared.inner.lock();
        let mut found = Lsn::INVALID;
        for event in &inner.events {
            if let StoredEvent::Record(r) = event {
                if r.timestamp <= cutoff {
                    found = found.max(r.lsn);
                }
            }
        }
        Ok(found)
    }

    async fn trim(&self, log: LogId, up_to: Lsn, _timeout: Duration) -> Result<(), StoreError> {
        let shared = self.log(log);
        {
            let mut inner = shared.inner.lock();
            inner.trim_point = inner.trim_point.max(up_to);
            inner.next_lsn = inner.next_lsn.max(up_to.0 + 1);
        }
        shared.bump();
        Ok(())
    }
}

enum Step {
    Item(ReadEvent),
    End,
    NotReady,
}

struct MemoryReadStream {
    shared: Arc<LogShared>,
    version_rx: watch::Receiver<u64>,
    cursor: usize,
    start: Lsn,
    until: Lsn,
    /// Highest position already handed out; records and gaps at or below
    /// it are skipped (they are covered by a delivered gap or trim).
    last_delivered: Lsn,
    done: bool,
}

impl MemoryReadStream {
    fn scan(&mut self) -> Step {
        let inner = self.shared.inner.lock();

        if self.last_delivered >= self.until {
            return Step::End;
        }

        // Records below the trim point will never be delivered; report the
        // trimmed range as a gap first.
        if self.last_delivered < inner.trim_point {
            let lo = self.last_delivered.next().max(self.start);
            let hi = inner.trim_point.min(self.until);
            if lo <= hi {
                self.last_delivered = hi;
                return Step::Item(ReadEvent::Gap(Gap {
                    kind: GapType::Trim,
                    lo,
                    hi,
                }));
            }
        }

        while self.cursor < inner.events.len() {
            let event = inner.events[self.cursor].clone();
            self.cursor += 1;
            match event {
                StoredEvent::Record(record) => {
                    if record.lsn < self.start || record.lsn <= self.last_delivered {
                        continue;
                    }
                    if record.lsn > self.until {
                        return Step::End;
                    }
                    self.last_delivered = record.lsn;
                    return Step::Item(ReadEvent::Record(record));
                }
                StoredEvent::Gap(gap) => {
                    if gap.hi < self.start || gap.hi <= self.last_delivered {
                        continue;
                    }
                    let lo = gap.lo.max(self.start).max(self.last_delivered.next());
                    if lo > self.until {
                        return Step::End;
                    }
                    let hi = gap.hi.min(self.until);
                    self.last_delivered = hi;
                    return Step::Item(ReadEvent::Gap(Gap {
                        kind: gap.kind,
                        lo,
                        hi,
                    }));
                }
                StoredEvent::Health(healthy) => {
                    return Step::Item(ReadEvent::HealthChange(healthy));
                }
            }
        }

        Step::NotReady
    }
}

#[async_trait]
impl ReadStream for MemoryReadStream {
    async fn next(&mut self) -> Option<ReadEvent> {
        loop {
            if self.done {
                return None;
            }
            // Snapshot the change counter before scanning so a mutation
            // racing the scan is never missed.
            let seen = *self.version_rx.borrow_and_update();
            match self.scan() {
                Step::Item(event) => return Some(event),
                Step::End => {
                    self.done = true;
                    return None;
                }
                Step::NotReady => {}
            }
            if self.version_rx.wait_for(|v| *v > seen).await.is_err() {
                return None;
            }
        }
    }
}

struct SnapInner {
    latest: Option<(SnapshotAttributes, Vec<u8>)>,
    durable: Lsn,
}

/// An in-memory [`SnapshotStore`] holding the latest snapshot only.
pub struct MemorySnapshotStore {
    inner: Mutex<SnapInner>,
    writable: AtomicBool,
    fail_gets: AtomicBool,
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SnapInner {
                latest: None,
                durable: Lsn::INVALID,
            }),
            writable: AtomicBool::new(true),
            fail_gets: AtomicBool::new(false),
        }
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    /// Make every `get_snapshot` fail until cleared; exercises the
    /// engine's fetch-retry backoff.
    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::Release);
    }

    /// The version of the stored snapshot, if any.
    #[must_use]
    pub fn latest_version(&self) -> Option<Lsn> {
        self.inner.lock().latest.as_ref().map(|(a, _)| a.base_version)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get_snapshot(&self, min_version: Lsn) -> Result<SnapshotFetch, StoreError> {
        if self.fail_gets.load(Ordering::Acquire) {
            return Err(StoreError::Backend("injected fetch failure".into()));
        }
        let inner = self.inner.lock();
        match &inner.latest {
            None => Ok(SnapshotFetch::Empty),
            Some((attrs, _)) if attrs.base_version < min_version => Ok(SnapshotFetch::UpToDate),
            Some((attrs, blob)) => Ok(SnapshotFetch::Snapshot {
                blob: blob.clone(),
                attrs: *attrs,
            }),
        }
    }

    async fn durable_version(&self) -> Result<Option<Lsn>, StoreError> {
        let durable = self.inner.lock().durable;
        Ok(durable.is_valid().then_some(durable))
    }

    async fn write_snapshot(
        &self,
        version: Lsn,
        payload: Vec<u8>,
    ) -> Result<SnapshotWrite, StoreError> {
        let mut inner = self.inner.lock();
        if let Some((attrs, _)) = &inner.latest {
            if version <= attrs.base_version {
                return Ok(SnapshotWrite::UpToDate(attrs.base_version));
            }
        }
        inner.latest = Some((
            SnapshotAttributes {
                base_version: version,
                timestamp: now_millis(),
            },
            payload,
        ));
        inner.durable = version;
        Ok(SnapshotWrite::Written(version))
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }
}
