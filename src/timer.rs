// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reassignable one-shot timers for the engine's driver task.
//!
//! A [`TimerHandle`] does not own a background task for its whole life; each
//! activation spawns a short sleep that posts a [`TimerFire`] into the
//! driver's timer channel. Cancelling or re-activating bumps a generation
//! counter so a stale fire from a superseded activation is ignored when the
//! driver calls [`TimerHandle::acknowledge`].

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Retry fetching a snapshot from the snapshot store.
    SnapshotFetch,
    /// Fast-forward grace elapsed; snapshot reading may resume.
    FastForwardGrace,
    /// The machine has been stalled long enough to count it.
    StallGrace,
    /// Time-based snapshot trigger.
    SnapshotPeriodic,
    /// A pending write confirmation timed out.
    Confirm(Uuid),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerFire {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Fire `kind` once after `delay`, with no handle to cancel it. Used for
/// per-confirmation timeouts, where removing the pending entry is the
/// cancellation.
pub(crate) fn schedule_fire(tx: mpsc::UnboundedSender<TimerFire>, kind: TimerKind, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(TimerFire { kind, generation: 0 });
    });
}

/// A cancellable, re-activatable one-shot timer.
pub(crate) struct TimerHandle {
    kind: TimerKind,
    tx: mpsc::UnboundedSender<TimerFire>,
    generation: u64,
    active: bool,
}

impl TimerHandle {
    pub fn new(kind: TimerKind, tx: mpsc::UnboundedSender<TimerFire>) -> Self {
        Self {
            kind,
            tx,
            generation: 0,
            active: false,
        }
    }

    /// Arm (or re-arm) the timer. A previously scheduled fire becomes stale.
    pub fn activate(&mut self, delay: Duration) {
        self.generation += 1;
        self.active = true;
        let tx = self.tx.clone();
        let kind = self.kind;
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFire { kind, generation });
        });
    }

    pub fn cancel(&mut self) {
        self.generation += 1;
        self.active = false;
    }

    /// Armed and not yet fired.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether `fire` belongs to the current activation. Consumes the
    /// activation when it does.
    pub fn acknowledge(&mut self, fire: TimerFire) -> bool {
        if self.active && fire.generation == self.generation {
            self.active = false;
            true
        } else {
            false
        }
    }
}

/// A one-shot timer whose delay doubles on every activation, up to a cap.
pub(crate) struct BackoffTimer {
    timer: TimerHandle,
    initial: Duration,
    max: Duration,
    delay: Duration,
}

impl BackoffTimer {
    pub fn new(
        kind: TimerKind,
        tx: mpsc::UnboundedSender<TimerFire>,
        initial: Duration,
        max: Duration,
    ) -> Self {
        Self {
            timer: TimerHandle::new(kind, tx),
            initial,
            max,
            delay: initial,
        }
    }

    /// Arm with the current delay, then double it for the next activation.
    pub fn activate(&mut self) {
        self.timer.activate(self.delay);
        self.delay = (self.delay * 2).min(self.max);
    }

    /// Restore the delay to its initial value.
    #[allow(dead_code)]
    pub fn reset(&mut self) {
        self.delay = self.initial;
    }

    pub fn cancel(&mut self) {
        self.timer.cancel();
    }

    pub fn acknowledge(&mut self, fire: TimerFire) -> bool {
        self.timer.acknowledge(fire)
    }
}
