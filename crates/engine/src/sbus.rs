// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Software bus: named broadcast channels with queue-bound receivers.
//!
//! A receiver (action) is registered on a bus with a target queue and an
//! optional guard object. Every [`send`] queues one delivery per receiver on
//! the receiver's queue; a guarded delivery whose object is gone runs
//! free-only. An action with a `max` bound drops deliveries while `max` of
//! its earlier deliveries are still queued.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, RwLock};

use aosl_core::error::record;
use aosl_core::helpers::{read, write};
use aosl_core::{AoslError, ExecMode, RefId, Result};
use bytes::Bytes;
use indexmap::IndexMap;

use crate::mpq::{self, QueueId};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sbus-action#{}", self.0)
    }
}

impl fmt::Debug for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

type ActionFn = Arc<dyn Fn(ExecMode, &str, &Bytes) + Send + Sync>;

struct Action {
    queue: QueueId,
    guard: Option<RefId>,
    max: usize,
    queued: Arc<AtomicUsize>,
    f: ActionFn,
}

impl Action {
    /// Claims one in-flight delivery slot, or `false` when `max` are taken.
    fn reserve(&self) -> bool {
        if self.max == 0 {
            self.queued.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| (queued < self.max).then_some(queued + 1))
            .is_ok()
    }
}

static BUSES: LazyLock<RwLock<HashMap<String, IndexMap<ActionId, Arc<Action>>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));
static NEXT_ACTION: AtomicU64 = AtomicU64::new(1);

/// Registers a receiver on `bus`. `max == 0` means unbounded.
///
/// # Errors
///
/// Returns `InvalidArgument` for an empty bus name and `InvalidQueue` for an
/// unknown queue.
pub fn action_add<F>(bus: &str, queue: QueueId, guard: Option<RefId>, max: usize, f: F) -> Result<ActionId>
where
    F: Fn(ExecMode, &str, &Bytes) + Send + Sync + 'static,
{
    if bus.is_empty() {
        return record(Err(AoslError::InvalidArgument("empty bus name".to_string())));
    }
    if !mpq::exists(queue) {
        return record(Err(AoslError::InvalidQueue(queue.to_string())));
    }

    let id = ActionId(NEXT_ACTION.fetch_add(1, Ordering::Relaxed));
    let action = Action { queue, guard, max, queued: Arc::new(AtomicUsize::new(0)), f: Arc::new(f) };
    write(&BUSES).entry(bus.to_string()).or_default().insert(id, Arc::new(action));

    tracing::debug!(bus, action = %id, queue = %queue, max, "bus action added");
    Ok(id)
}

/// Unregisters a receiver. Deliveries already queued still run.
///
/// # Errors
///
/// Returns `InvalidArgument` if the action is not registered on `bus`.
pub fn action_del(bus: &str, id: ActionId) -> Result<()> {
    let mut buses = write(&BUSES);
    let removed = buses.get_mut(bus).and_then(|actions| actions.shift_remove(&id));
    if buses.get(bus).is_some_and(IndexMap::is_empty) {
        buses.remove(bus);
    }
    drop(buses);

    if removed.is_none() {
        return record(Err(AoslError::InvalidArgument(format!("{id} is not registered on bus '{bus}'"))));
    }
    tracing::debug!(bus, action = %id, "bus action removed");
    Ok(())
}

/// Broadcasts `data` to every receiver of `bus` in registration order.
/// Returns how many deliveries were queued.
pub fn send(bus: &str, data: Bytes) -> usize {
    let actions: Vec<(ActionId, Arc<Action>)> = match read(&BUSES).get(bus) {
        Some(actions) => actions.iter().map(|(id, action)| (*id, Arc::clone(action))).collect(),
        None => return 0,
    };

    let mut queued = 0;
    for (id, action) in actions {
        if !action.reserve() {
            tracing::warn!(bus, action = %id, max = action.max, "bus delivery dropped, receiver saturated");
            continue;
        }

        let counter = Arc::clone(&action.queued);
        let f = Arc::clone(&action.f);
        let bus_name = bus.to_string();
        let payload = data.clone();
        let result = mpq::queue(action.queue, action.guard, "sbus_deliver", move |mode| {
            counter.fetch_sub(1, Ordering::AcqRel);
            f(mode, &bus_name, &payload);
        });

        match result {
            Ok(()) => queued += 1,
            // The refused delivery already ran free-only and released its slot.
            Err(err) => {
                tracing::warn!(bus, action = %id, error = %err, "bus delivery could not be queued");
            },
        }
    }
    tracing::trace!(bus, queued, len = data.len(), "bus send");
    queued
}

/// Receivers currently registered on `bus`.
pub fn receivers(bus: &str) -> usize {
    read(&BUSES).get(bus).map_or(0, IndexMap::len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_never_exceeds_max_under_contention() {
        let q = mpq::create("sbus-reserve").unwrap();
        let action = Arc::new(Action {
            queue: q,
            guard: None,
            max: 3,
            queued: Arc::new(AtomicUsize::new(0)),
            f: Arc::new(|_, _, _| {}),
        });

        let claimed: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    let action = Arc::clone(&action);
                    scope.spawn(move || (0..100).filter(|_| action.reserve()).count())
                })
                .collect();
            workers.into_iter().map(|worker| worker.join().unwrap()).sum()
        });

        assert_eq!(claimed, 3);
        assert_eq!(action.queued.load(Ordering::Acquire), 3);
        mpq::destroy(q, true).unwrap();
    }
}
