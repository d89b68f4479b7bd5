// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Generic table-driven finite state machine.
//!
//! The machine is data: a table of states, each mapping events to a
//! [`Transition`] with an action, a cost class and the next state for success
//! and for failure. At most one action runs at a time per machine; events that
//! arrive while one is in flight wait in a FIFO and run in `trigger()` order.
//!
//! The cost class decides where an action runs:
//!
//! | cost              | idle machine                     | `trigger()` returns |
//! |-------------------|----------------------------------|---------------------|
//! | [`ActCost::None`] | inline, on the caller's thread   | `Ready`             |
//! | [`ActCost::Small`]| deferred to the machine's queue  | `Pending`           |
//! | [`ActCost::Large`]| deferred to the runtime worker pool | `Pending`        |
//!
//! A failing action (`Err`) still counts as executed: the machine moves to the
//! transition's failure state and the resume continuation receives the error.
//! An event with no transition in the current state is rejected synchronously.
//! While an action is in flight the next state is not known yet, so an event
//! is queued if some state of the table handles it and rejected otherwise. A
//! queued event that turns out unhandled in the state it finally meets is
//! skipped; its resume receives `NotHandled` and the next queued event runs.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use aosl_core::error::{errno, record};
use aosl_core::helpers::lock;
use aosl_core::refobj::{self, Access, RefId};
use aosl_core::{AoslError, Data, ExecMode, Outcome, Result, Resume, Resumed};
use indexmap::IndexMap;

use crate::mpq::{self, QueueId};
use crate::pool;
use crate::runtime;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsmId(RefId);

impl FsmId {
    pub const fn ref_id(self) -> RefId {
        self.0
    }
}

impl fmt::Display for FsmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gfsm({})", self.0)
    }
}

impl fmt::Debug for FsmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Static execution hint of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActCost {
    /// Runs inline inside `trigger()` when the machine is idle.
    None,
    /// Runs on the machine's queue.
    Small,
    /// Runs on the runtime worker pool.
    Large,
}

type ActionFn<A> = Box<dyn FnMut(&A, u32, Option<&Data>) -> Result<()> + Send>;
type ErasedAction = Box<dyn FnMut(u32, Option<&Data>) -> Result<()> + Send>;

/// One `(event -> action)` entry of a state.
pub struct Transition<A> {
    event: u32,
    cost: ActCost,
    next_ok: i32,
    next_err: i32,
    action: ActionFn<A>,
}

impl<A> Transition<A> {
    pub fn new<F>(event: u32, cost: ActCost, next_ok: i32, next_err: i32, action: F) -> Self
    where
        F: FnMut(&A, u32, Option<&Data>) -> Result<()> + Send + 'static,
    {
        Self { event, cost, next_ok, next_err, action: Box::new(action) }
    }
}

impl<A> fmt::Debug for Transition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("event", &self.event)
            .field("cost", &self.cost)
            .field("next_ok", &self.next_ok)
            .field("next_err", &self.next_err)
            .finish_non_exhaustive()
    }
}

/// A state and its outgoing transitions. A state without transitions is terminal.
pub struct StateDef<A> {
    state: i32,
    transitions: Vec<Transition<A>>,
}

impl<A> StateDef<A> {
    pub const fn new(state: i32) -> Self {
        Self { state, transitions: Vec::new() }
    }

    #[must_use]
    pub fn on(mut self, transition: Transition<A>) -> Self {
        self.transitions.push(transition);
        self
    }
}

struct Edge {
    cost: ActCost,
    next_ok: i32,
    next_err: i32,
    action: Mutex<ErasedAction>,
}

struct PendingEvent {
    event: u32,
    data: Option<Data>,
    resume: Option<Resume<()>>,
    origin: Option<QueueId>,
}

impl PendingEvent {
    /// Delivers the result inline.
    fn resume_inline(mut self, result: Result<()>) {
        if let Some(resume) = self.resume.take() {
            resume(Resumed::Complete(result));
        }
    }

    /// Delivers the result on the queue the event was triggered from.
    fn resume_deferred(mut self, result: Result<()>) {
        let Some(resume) = self.resume.take() else {
            return;
        };
        match self.origin {
            Some(origin) if mpq::this_queue() != Some(origin) => {
                mpq::post_resume(origin, None, "gfsm_resume", resume, result);
            },
            _ => resume(Resumed::Complete(result)),
        }
    }

    fn free(self) {
        drop(self);
    }
}

impl Drop for PendingEvent {
    fn drop(&mut self) {
        if let Some(resume) = self.resume.take() {
            resume(Resumed::FreeOnly);
        }
    }
}

struct Run {
    current: i32,
    busy: bool,
    pending: VecDeque<PendingEvent>,
}

struct GfsmState {
    name: String,
    queue: QueueId,
    table: IndexMap<i32, IndexMap<u32, Edge>>,
    run: Mutex<Run>,
}

impl GfsmState {
    fn edge(&self, state: i32, event: u32) -> Option<&Edge> {
        self.table.get(&state).and_then(|events| events.get(&event))
    }

    /// Whether any state has a transition for `event`.
    fn knows(&self, event: u32) -> bool {
        self.table.values().any(|events| events.contains_key(&event))
    }

    fn accept(&self, id: FsmId, ev: PendingEvent) -> Result<Outcome> {
        let mut run = lock(&self.run);
        if run.busy {
            if !self.knows(ev.event) {
                let err = AoslError::NotHandled { state: run.current, event: ev.event };
                drop(run);
                ev.resume_inline(Err(err.clone()));
                return Err(err);
            }
            run.pending.push_back(ev);
            tracing::trace!(fsm = %self.name, pending = run.pending.len(), "event queued behind running action");
            return Ok(Outcome::Pending);
        }

        let current = run.current;
        let Some(edge) = self.edge(current, ev.event) else {
            drop(run);
            let err = AoslError::NotHandled { state: current, event: ev.event };
            ev.resume_inline(Err(err.clone()));
            return Err(err);
        };
        run.busy = true;
        drop(run);

        if edge.cost == ActCost::None {
            let result = self.execute(edge, current, &ev);
            ev.resume_inline(result);
            self.advance(id);
            Ok(Outcome::Ready)
        } else {
            self.defer(id, edge.cost, ev);
            Ok(Outcome::Pending)
        }
    }

    /// Runs the action and applies the resulting transition.
    fn execute(&self, edge: &Edge, from: i32, ev: &PendingEvent) -> Result<()> {
        let result = {
            let mut action = lock(&edge.action);
            let action = &mut *action;
            panic::catch_unwind(AssertUnwindSafe(|| action(ev.event, ev.data.as_ref())))
                .unwrap_or_else(|_| {
                    tracing::error!(fsm = %self.name, event = ev.event, "action panicked");
                    Err(AoslError::Action(errno::EIO))
                })
        };

        let next = if result.is_ok() { edge.next_ok } else { edge.next_err };
        lock(&self.run).current = next;
        tracing::debug!(
            fsm = %self.name,
            event = ev.event,
            from,
            to = next,
            ok = result.is_ok(),
            "transition"
        );
        result
    }

    fn defer(&self, id: FsmId, cost: ActCost, ev: PendingEvent) {
        let step = move |mode: ExecMode| {
            if mode.is_free_only() {
                ev.free();
                return;
            }
            refobj::hold::<Self, _>(id.0, |access| match access {
                Access::Live(state) => state.step(id, ev),
                Access::FreeOnly => ev.free(),
            });
        };

        let queued = if cost == ActCost::Large {
            runtime::get().and_then(|rt| pool::queue(rt.worker_pool(), Some(id.0), "gfsm_action", step).map(|_| ()))
        } else {
            mpq::queue(self.queue, Some(id.0), "gfsm_action", step)
        };

        if let Err(err) = queued {
            // The step closure is gone with its event; the machine must not stay busy.
            tracing::error!(fsm = %self.name, error = %err, "failed to schedule deferred action");
            self.advance(id);
        }
    }

    /// Executes a deferred event on the thread chosen by its cost class.
    fn step(&self, id: FsmId, ev: PendingEvent) {
        let current = lock(&self.run).current;
        match self.edge(current, ev.event) {
            Some(edge) => {
                let result = self.execute(edge, current, &ev);
                ev.resume_deferred(result);
            },
            None => {
                let event = ev.event;
                ev.resume_deferred(Err(AoslError::NotHandled { state: current, event }));
            },
        }
        self.advance(id);
    }

    /// Starts the next queued event, or marks the machine idle.
    fn advance(&self, id: FsmId) {
        let next = {
            let mut run = lock(&self.run);
            match run.pending.pop_front() {
                Some(ev) => Some((ev, run.current)),
                None => {
                    run.busy = false;
                    None
                },
            }
        };
        let Some((ev, current)) = next else {
            return;
        };

        match self.edge(current, ev.event) {
            Some(edge) if edge.cost == ActCost::Large => self.defer(id, ActCost::Large, ev),
            Some(_) => self.defer(id, ActCost::Small, ev),
            None => {
                let event = ev.event;
                ev.resume_deferred(Err(AoslError::NotHandled { state: current, event }));
                self.advance(id);
            },
        }
    }

    fn take_pending(&self) -> VecDeque<PendingEvent> {
        std::mem::take(&mut lock(&self.run).pending)
    }
}

fn build_table<A>(
    arg: &Arc<A>,
    states: Vec<StateDef<A>>,
) -> Result<IndexMap<i32, IndexMap<u32, Edge>>>
where
    A: Send + Sync + 'static,
{
    let mut table: IndexMap<i32, IndexMap<u32, Edge>> = IndexMap::with_capacity(states.len());
    let mut targets = Vec::new();

    for def in states {
        if table.contains_key(&def.state) {
            return Err(AoslError::InvalidArgument(format!("state {} defined twice", def.state)));
        }
        let mut events = IndexMap::with_capacity(def.transitions.len());
        for transition in def.transitions {
            if events.contains_key(&transition.event) {
                return Err(AoslError::InvalidArgument(format!(
                    "event {} defined twice in state {}",
                    transition.event, def.state
                )));
            }
            targets.push(transition.next_ok);
            targets.push(transition.next_err);

            let arg = Arc::clone(arg);
            let mut action = transition.action;
            let erased: ErasedAction = Box::new(move |event, data| action(&arg, event, data));
            events.insert(
                transition.event,
                Edge {
                    cost: transition.cost,
                    next_ok: transition.next_ok,
                    next_err: transition.next_err,
                    action: Mutex::new(erased),
                },
            );
        }
        table.insert(def.state, events);
    }

    if let Some(missing) = targets.into_iter().find(|state| !table.contains_key(state)) {
        return Err(AoslError::InvalidArgument(format!("transition targets undefined state {missing}")));
    }
    Ok(table)
}

/// Creates a machine whose small-cost actions run on the calling queue (or
/// the main queue when called off-queue).
///
/// # Errors
///
/// Returns `InvalidArgument` if `initial` is not in the table, a state or
/// event is defined twice, or a transition targets an undefined state.
pub fn create<A>(name: &str, arg: A, states: Vec<StateDef<A>>, initial: i32) -> Result<FsmId>
where
    A: Send + Sync + 'static,
{
    let queue = match mpq::this_queue() {
        Some(queue) => queue,
        None => record(mpq::main_queue())?,
    };
    create_on(queue, name, arg, states, initial)
}

/// Creates a machine whose small-cost actions run on `queue`.
///
/// # Errors
///
/// Same as [`create`], plus `InvalidQueue` for an unknown queue.
pub fn create_on<A>(
    queue: QueueId,
    name: &str,
    arg: A,
    states: Vec<StateDef<A>>,
    initial: i32,
) -> Result<FsmId>
where
    A: Send + Sync + 'static,
{
    record(create_inner(queue, name, arg, states, initial))
}

fn create_inner<A>(
    queue: QueueId,
    name: &str,
    arg: A,
    states: Vec<StateDef<A>>,
    initial: i32,
) -> Result<FsmId>
where
    A: Send + Sync + 'static,
{
    if !mpq::exists(queue) {
        return Err(AoslError::InvalidQueue(queue.to_string()));
    }
    let table = build_table(&Arc::new(arg), states)?;
    if !table.contains_key(&initial) {
        return Err(AoslError::InvalidArgument(format!(
            "initial state {initial} is not in the table of '{name}'"
        )));
    }

    let state = GfsmState {
        name: name.to_string(),
        queue,
        table,
        run: Mutex::new(Run { current: initial, busy: false, pending: VecDeque::new() }),
    };
    let id = FsmId(refobj::create(
        state,
        |state: &GfsmState| {
            let pending = state.take_pending();
            let discarded = pending.len();
            for ev in pending {
                ev.free();
            }
            tracing::debug!(fsm = %state.name, discarded, "state machine destroyed");
        },
        true,
    )?);

    tracing::debug!(fsm = %id, name, queue = %queue, initial, "state machine created");
    Ok(id)
}

/// Delivers `event` to the machine.
///
/// - `Ok(Ready)`: a no-cost action ran inline; the transition is applied and
///   `resume` has already run.
/// - `Ok(Pending)`: the action is deferred (or queued behind a running one);
///   `resume` runs when it completes, on the queue `trigger` was called from.
/// - `Err(_)`: nothing ran; `resume` has already run with the error (or
///   free-only if the machine is gone). While busy, only events that no
///   state handles are rejected here.
///
/// # Errors
///
/// `NotHandled` if the current state has no transition for `event`, and
/// `InvalidRef` if the machine was destroyed.
pub fn trigger(
    id: FsmId,
    event: u32,
    data: Option<Data>,
    resume: Option<Resume<()>>,
) -> Result<Outcome> {
    let ev = PendingEvent { event, data, resume, origin: mpq::this_queue() };
    record(refobj::hold::<GfsmState, _>(id.0, |access| match access {
        Access::Live(state) => state.accept(id, ev),
        Access::FreeOnly => {
            ev.free();
            Err(AoslError::InvalidRef(id.to_string()))
        },
    }))
}

/// Drops every queued event; each resume runs free-only. An action that is
/// already running is not affected. Returns how many events were dropped.
///
/// # Errors
///
/// Returns `InvalidRef` if the machine was destroyed.
pub fn clear(id: FsmId) -> Result<usize> {
    let pending = record(refobj::hold::<GfsmState, _>(id.0, |access| match access {
        Access::Live(state) => Ok(state.take_pending()),
        Access::FreeOnly => Err(AoslError::InvalidRef(id.to_string())),
    }))?;

    let cleared = pending.len();
    for ev in pending {
        ev.free();
    }
    tracing::debug!(fsm = %id, cleared, "pending events cleared");
    Ok(cleared)
}

/// Destroys the machine after any running action returns. Queued events are
/// released free-only and the action closures are dropped.
///
/// # Errors
///
/// Returns `InvalidRef` if the machine was already destroyed.
pub fn destroy(id: FsmId) -> Result<()> {
    refobj::destroy(id.0, true)
}

/// # Errors
///
/// Returns `InvalidRef` if the machine was destroyed.
pub fn current_state(id: FsmId) -> Result<i32> {
    with_state(id, |state| lock(&state.run).current)
}

/// Events waiting behind the running action.
///
/// # Errors
///
/// Returns `InvalidRef` if the machine was destroyed.
pub fn pending_count(id: FsmId) -> Result<usize> {
    with_state(id, |state| lock(&state.run).pending.len())
}

/// # Errors
///
/// Returns `InvalidRef` if the machine was destroyed.
pub fn name(id: FsmId) -> Result<String> {
    with_state(id, |state| state.name.clone())
}

fn with_state<R>(id: FsmId, f: impl FnOnce(&GfsmState) -> R) -> Result<R> {
    record(refobj::hold::<GfsmState, _>(id.0, |access| match access {
        Access::Live(state) => Ok(f(state)),
        Access::FreeOnly => Err(AoslError::InvalidRef(id.to_string())),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> impl FnMut(&(), u32, Option<&Data>) -> Result<()> + Send + 'static {
        |_, _, _| Ok(())
    }

    #[test]
    fn test_table_rejects_duplicates_and_dangling_targets() {
        let arg = Arc::new(());
        let dup_state = vec![StateDef::new(0), StateDef::new(0)];
        assert!(build_table(&arg, dup_state).is_err());

        let dup_event = vec![StateDef::new(0)
            .on(Transition::new(1, ActCost::None, 0, 0, noop()))
            .on(Transition::new(1, ActCost::Small, 0, 0, noop()))];
        assert!(build_table(&arg, dup_event).is_err());

        let dangling = vec![StateDef::new(0).on(Transition::new(1, ActCost::None, 7, 0, noop()))];
        assert!(matches!(build_table(&arg, dangling), Err(AoslError::InvalidArgument(_))));

        let ok = vec![
            StateDef::new(0).on(Transition::new(1, ActCost::None, 1, 0, noop())),
            StateDef::new(1),
        ];
        let table = build_table(&arg, ok).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table[&1].is_empty());
    }
}
