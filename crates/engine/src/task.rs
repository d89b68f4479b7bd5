// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Task objects: per-object operation streams on top of queues.
//!
//! A task owns a FIFO of waiting operations and decides when each may start:
//!
//! - A **serial** task starts an operation only when none of its operations is
//!   in flight, so a task bound to a pool still never runs two at once.
//! - A **parallel** task starts operations as soon as they arrive, spreading
//!   them over its pool.
//! - An **exclusive** operation (either kind) waits until nothing of the task
//!   is in flight and holds back every later operation until it returns. This
//!   is the per-object "stop the world" used for teardown-style work.
//!
//! An operation returning [`OpFlow::Async`] stays in flight after its closure
//! returns, until [`async_done`] is called for the task.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use aosl_core::error::record;
use aosl_core::helpers::lock;
use aosl_core::refobj::{self, Access, RefId};
use aosl_core::{AoslError, ExecMode, Result};

use crate::mpq::{self, QueueId};
use crate::pool::{self, PoolId};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(RefId);

impl TaskId {
    pub const fn ref_id(self) -> RefId {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task({})", self.0)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Where a task's operations execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTarget {
    Queue(QueueId),
    Pool(PoolId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Serial,
    Parallel,
}

/// Whether an operation is finished when its closure returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFlow {
    Done,
    /// Still in flight until [`async_done`].
    Async,
}

type OpFn = Box<dyn FnOnce(ExecMode) -> OpFlow + Send>;
type ExclusiveFn = Box<dyn FnOnce(ExecMode) + Send>;

enum TaskOp {
    Normal { name: &'static str, f: OpFn },
    Exclusive { name: &'static str, f: ExclusiveFn },
}

impl TaskOp {
    const fn name(&self) -> &'static str {
        match self {
            Self::Normal { name, .. } | Self::Exclusive { name, .. } => *name,
        }
    }

    const fn is_exclusive(&self) -> bool {
        matches!(self, Self::Exclusive { .. })
    }

    fn discard(self) {
        match self {
            Self::Normal { f, .. } => {
                let _ = f(ExecMode::FreeOnly);
            },
            Self::Exclusive { f, .. } => f(ExecMode::FreeOnly),
        }
    }
}

#[derive(Default)]
struct TaskSched {
    waiting: VecDeque<TaskOp>,
    running: usize,
    async_outstanding: usize,
    exclusive: bool,
}

impl TaskSched {
    const fn in_flight(&self) -> usize {
        self.running + self.async_outstanding
    }
}

struct TaskState {
    name: String,
    target: TaskTarget,
    kind: TaskKind,
    sched: Mutex<TaskSched>,
}

impl TaskState {
    /// Pops every waiting op that may start now.
    fn take_ready(&self, sched: &mut TaskSched) -> Vec<TaskOp> {
        let mut ready = Vec::new();
        while let Some(head) = sched.waiting.front() {
            if sched.exclusive {
                break;
            }
            if head.is_exclusive() {
                if sched.in_flight() > 0 {
                    break;
                }
                sched.exclusive = true;
            } else if self.kind == TaskKind::Serial && sched.in_flight() > 0 {
                break;
            }
            sched.running += 1;
            if let Some(op) = sched.waiting.pop_front() {
                ready.push(op);
            }
        }
        ready
    }

    fn submit(&self, id: TaskId, op: TaskOp) {
        let ready = {
            let mut sched = lock(&self.sched);
            sched.waiting.push_back(op);
            self.take_ready(&mut sched)
        };
        self.dispatch(id, ready);
    }

    fn dispatch(&self, id: TaskId, ready: Vec<TaskOp>) {
        for op in ready {
            let name = op.name();
            let exclusive = op.is_exclusive();
            let queued = match self.target {
                TaskTarget::Queue(qid) => mpq::queue(qid, Some(id.0), name, move |mode| run_op(id, op, mode)),
                TaskTarget::Pool(pid) => {
                    pool::queue(pid, Some(id.0), name, move |mode| run_op(id, op, mode)).map(|_| ())
                },
            };
            if let Err(err) = queued {
                tracing::warn!(task = %id, op = name, error = %err, "task operation could not be queued");
                self.finish(id, OpFlow::Done, exclusive);
            }
        }
    }

    fn finish(&self, id: TaskId, flow: OpFlow, exclusive: bool) {
        let ready = {
            let mut sched = lock(&self.sched);
            sched.running -= 1;
            if exclusive {
                sched.exclusive = false;
            }
            if flow == OpFlow::Async {
                sched.async_outstanding += 1;
            }
            self.take_ready(&mut sched)
        };
        self.dispatch(id, ready);
    }

    fn discard_waiting(&self) -> usize {
        let waiting = std::mem::take(&mut lock(&self.sched).waiting);
        let count = waiting.len();
        for op in waiting {
            op.discard();
        }
        count
    }
}

fn run_op(id: TaskId, op: TaskOp, mode: ExecMode) {
    if mode.is_free_only() {
        op.discard();
        return;
    }

    let exclusive = op.is_exclusive();
    let name = op.name();
    let ran = panic::catch_unwind(AssertUnwindSafe(|| match op {
        TaskOp::Normal { f, .. } => f(ExecMode::Exec),
        TaskOp::Exclusive { f, .. } => {
            f(ExecMode::Exec);
            OpFlow::Done
        },
    }));
    // A panicking op still finishes so later ops of the task can start.
    let flow = ran.unwrap_or_else(|_| {
        tracing::error!(task = %id, op = name, "task operation panicked");
        OpFlow::Done
    });

    refobj::hold::<TaskState, _>(id.0, |access| {
        if let Access::Live(state) = access {
            state.finish(id, flow, exclusive);
        }
    });
}

fn with_state<R>(id: TaskId, f: impl FnOnce(&TaskState) -> Result<R>) -> Result<R> {
    record(refobj::hold::<TaskState, _>(id.0, |access| match access {
        Access::Live(state) => f(state),
        Access::FreeOnly => Err(AoslError::InvalidRef(id.to_string())),
    }))
}

/// Creates a task.
///
/// # Errors
///
/// Returns `InvalidQueue` if the target queue or pool does not exist.
pub fn create(name: &str, target: TaskTarget, kind: TaskKind) -> Result<TaskId> {
    let exists = match target {
        TaskTarget::Queue(qid) => mpq::exists(qid),
        TaskTarget::Pool(pid) => pool::queues(pid).is_ok(),
    };
    if !exists {
        return record(Err(AoslError::InvalidQueue(format!("{target:?}"))));
    }

    let state = TaskState {
        name: name.to_string(),
        target,
        kind,
        sched: Mutex::new(TaskSched::default()),
    };
    let id = TaskId(refobj::create(
        state,
        |state: &TaskState| {
            let discarded = state.discard_waiting();
            tracing::debug!(task = %state.name, discarded, "task destroyed");
        },
        true,
    )?);

    tracing::debug!(task = %id, name, ?target, ?kind, "task created");
    Ok(id)
}

/// Appends an operation to the task.
///
/// # Errors
///
/// Returns `InvalidRef` for a destroyed task.
pub fn exec<F>(id: TaskId, name: &'static str, f: F) -> Result<()>
where
    F: FnOnce(ExecMode) -> OpFlow + Send + 'static,
{
    with_state(id, |state| {
        state.submit(id, TaskOp::Normal { name, f: Box::new(f) });
        Ok(())
    })
}

/// Appends an exclusive operation to the task.
///
/// # Errors
///
/// Returns `InvalidRef` for a destroyed task.
pub fn exclusive_exec<F>(id: TaskId, name: &'static str, f: F) -> Result<()>
where
    F: FnOnce(ExecMode) + Send + 'static,
{
    with_state(id, |state| {
        state.submit(id, TaskOp::Exclusive { name, f: Box::new(f) });
        Ok(())
    })
}

/// Completes one operation that returned [`OpFlow::Async`].
///
/// # Errors
///
/// Returns `InvalidRef` for a destroyed task and `InvalidArgument` when no
/// asynchronous operation is outstanding.
pub fn async_done(id: TaskId) -> Result<()> {
    with_state(id, |state| {
        let ready = {
            let mut sched = lock(&state.sched);
            if sched.async_outstanding == 0 {
                tracing::warn!(task = %id, "async_done without an outstanding operation");
                return Err(AoslError::InvalidArgument(format!("{id} has no async operation outstanding")));
            }
            sched.async_outstanding -= 1;
            state.take_ready(&mut sched)
        };
        state.dispatch(id, ready);
        Ok(())
    })
}

/// Operations queued on the task that have not started.
///
/// # Errors
///
/// Returns `InvalidRef` for a destroyed task.
pub fn waiting_ops_count(id: TaskId) -> Result<usize> {
    with_state(id, |state| Ok(lock(&state.sched).waiting.len()))
}

/// Removes the oldest waiting operation, invoking it free-only.
/// Returns whether there was one.
///
/// # Errors
///
/// Returns `InvalidRef` for a destroyed task.
pub fn remove_waiting_ops_head(id: TaskId) -> Result<bool> {
    with_state(id, |state| {
        let (removed, ready) = {
            let mut sched = lock(&state.sched);
            let removed = sched.waiting.pop_front();
            let ready = state.take_ready(&mut sched);
            (removed, ready)
        };
        let found = removed.is_some();
        if let Some(op) = removed {
            op.discard();
        }
        state.dispatch(id, ready);
        Ok(found)
    })
}

/// Destroys the task, waiting for its running operations. Waiting operations
/// are invoked free-only; queued ones see free-only when they come up.
///
/// # Errors
///
/// Returns `InvalidRef` if the task was already destroyed.
pub fn destroy(id: TaskId) -> Result<()> {
    refobj::destroy(id.0, true)
}
