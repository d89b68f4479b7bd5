// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Internal message types for queue actors.

use std::cmp::Ordering;
use std::time::Instant;

use aosl_core::refobj::{self, RefId};
use aosl_core::ExecMode;

pub(crate) type OpFn = Box<dyn FnOnce(ExecMode) + Send + 'static>;

/// One pending queue entry.
///
/// An entry is invoked exactly once: normally by the queue's drain loop, or in
/// free-only mode if it is dropped without having run (queue torn down).
pub(crate) struct QueuedOp {
    pub(crate) name: &'static str,
    guard: Option<RefId>,
    f: Option<OpFn>,
}

impl QueuedOp {
    pub(crate) fn new(name: &'static str, guard: Option<RefId>, f: OpFn) -> Self {
        Self { name, guard, f: Some(f) }
    }

    /// Runs the entry, under a lease on its guard object when it has one.
    pub(crate) fn run(mut self) {
        if let Some(f) = self.f.take() {
            match self.guard {
                Some(id) => refobj::with_lease(id, f),
                None => f(ExecMode::Exec),
            }
        }
    }

    pub(crate) fn discard(mut self) {
        if let Some(f) = self.f.take() {
            f(ExecMode::FreeOnly);
        }
    }
}

impl Drop for QueuedOp {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f(ExecMode::FreeOnly);
        }
    }
}

/// A timer arming. Stale armings (older epoch) are ignored when they come due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    pub(crate) timer: RefId,
    pub(crate) epoch: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.timer.cmp(&other.timer))
            .then_with(|| self.epoch.cmp(&other.epoch))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) enum QueueMsg {
    Run(QueuedOp),
    Arm(TimerEntry),
    Stop,
}
