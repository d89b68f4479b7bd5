// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Queue actor implementation.
//!
//! Every queue is one OS thread driving a current-thread tokio runtime. The
//! actor is the sole consumer of the queue's channel: entries run strictly in
//! arrival order, one at a time, and timers armed on the queue fire from the
//! same loop so they never overlap with regular entries.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::mpq::QueueShared;
use crate::queue_messages::{QueueMsg, QueuedOp, TimerEntry};
use crate::timer;

pub(crate) struct QueueActor {
    pub(crate) shared: Arc<QueueShared>,
    pub(crate) rx: mpsc::UnboundedReceiver<QueueMsg>,
    pub(crate) timers: BinaryHeap<Reverse<TimerEntry>>,
}

impl QueueActor {
    pub(crate) fn new(shared: Arc<QueueShared>, rx: mpsc::UnboundedReceiver<QueueMsg>) -> Self {
        Self { shared, rx, timers: BinaryHeap::new() }
    }

    /// The main drain loop.
    pub(crate) async fn run(mut self) {
        tracing::debug!(queue = %self.shared.id, name = %self.shared.name, "queue started");

        loop {
            self.fire_due_timers();
            let next_deadline = self.timers.peek().map(|Reverse(entry)| entry.deadline);

            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(QueueMsg::Run(op)) => self.run_op(op),
                    Some(QueueMsg::Arm(entry)) => self.timers.push(Reverse(entry)),
                    Some(QueueMsg::Stop) | None => break,
                },
                () = tokio::time::sleep_until(
                    tokio::time::Instant::from_std(next_deadline.unwrap_or_else(Instant::now))
                ), if next_deadline.is_some() => {},
            }
        }

        self.drain();
        tracing::debug!(queue = %self.shared.id, name = %self.shared.name, "queue stopped");
    }

    fn run_op(&self, op: QueuedOp) {
        self.shared.op_started();
        if self.shared.is_stopping() {
            op.discard();
            return;
        }
        let name = op.name;
        tracing::trace!(queue = %self.shared.id, op = name, "running entry");

        if panic::catch_unwind(AssertUnwindSafe(|| op.run())).is_err() {
            tracing::error!(queue = %self.shared.id, op = name, "queued operation panicked");
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while self.timers.peek().is_some_and(|Reverse(entry)| entry.deadline <= now) {
            let Some(Reverse(entry)) = self.timers.pop() else { break };

            match panic::catch_unwind(AssertUnwindSafe(|| timer::fire(&entry, now))) {
                Ok(Some(rearm)) => self.timers.push(Reverse(rearm)),
                Ok(None) => {},
                Err(_) => {
                    tracing::error!(queue = %self.shared.id, timer = %entry.timer, "timer callback panicked");
                },
            }
        }
    }

    /// Invokes everything still queued in free-only mode.
    fn drain(&mut self) {
        self.rx.close();
        self.timers.clear();

        let mut discarded = 0usize;
        while let Ok(msg) = self.rx.try_recv() {
            if let QueueMsg::Run(op) = msg {
                self.shared.op_started();
                op.discard();
                discarded += 1;
            }
        }
        if discarded > 0 {
            tracing::debug!(queue = %self.shared.id, discarded, "pending entries released free-only");
        }
    }
}
