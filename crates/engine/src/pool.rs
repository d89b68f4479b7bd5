// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Queue pools.
//!
//! A pool is a fixed set of queues that share a name prefix. Work queued on a
//! pool goes to the member with the fewest pending entries, so independent
//! operations spread across threads while each individual entry still runs
//! with ordinary queue semantics.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, RwLock};

use aosl_core::error::record;
use aosl_core::helpers::{read, write};
use aosl_core::{AoslError, ExecMode, RefId, Result};

use crate::config::QueueConfig;
use crate::mpq::{self, QueueId};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mpqp#{}", self.0)
    }
}

impl fmt::Debug for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

struct PoolShared {
    name: String,
    queues: Vec<QueueId>,
    cursor: AtomicUsize,
}

#[derive(Default)]
struct Pools {
    by_id: HashMap<PoolId, Arc<PoolShared>>,
    next_id: u32,
}

static POOLS: LazyLock<RwLock<Pools>> = LazyLock::new(|| RwLock::new(Pools::default()));

fn shared(pid: PoolId) -> Result<Arc<PoolShared>> {
    read(&POOLS)
        .by_id
        .get(&pid)
        .cloned()
        .ok_or_else(|| AoslError::InvalidQueue(pid.to_string()))
}

/// Creates a pool of `size` queues named `{name}.{n}`.
///
/// # Errors
///
/// Returns `InvalidArgument` for an empty pool, or any queue creation error
/// (queues created so far are torn down again).
pub fn create(name: &str, size: usize, config: &QueueConfig) -> Result<PoolId> {
    if size == 0 {
        return record(Err(AoslError::InvalidArgument(format!("pool '{name}' needs at least one queue"))));
    }

    let mut queues = Vec::with_capacity(size);
    for n in 0..size {
        match mpq::create_with(&format!("{name}.{n}"), config) {
            Ok(qid) => queues.push(qid),
            Err(err) => {
                for qid in queues {
                    let _ = mpq::destroy(qid, false);
                }
                return Err(err);
            },
        }
    }

    let mut pools = write(&POOLS);
    let pid = PoolId(pools.next_id);
    pools.next_id = pools.next_id.wrapping_add(1);
    pools.by_id.insert(
        pid,
        Arc::new(PoolShared { name: name.to_string(), queues, cursor: AtomicUsize::new(0) }),
    );
    drop(pools);

    tracing::debug!(pool = %pid, name, size, "queue pool created");
    Ok(pid)
}

/// The member queue with the fewest pending entries.
///
/// Ties rotate so an idle pool still spreads consecutive picks.
///
/// # Errors
///
/// Returns `InvalidQueue` for an unknown pool.
pub fn pick(pid: PoolId) -> Result<QueueId> {
    let pool = record(shared(pid))?;
    let start = pool.cursor.fetch_add(1, Ordering::Relaxed);
    let count = pool.queues.len();

    (0..count)
        .map(|offset| pool.queues[(start + offset) % count])
        .min_by_key(|qid| mpq::pending_count(*qid).unwrap_or(usize::MAX))
        .ok_or_else(|| AoslError::InvalidQueue(pid.to_string()))
}

/// Queues `f` on the least-loaded member and returns the chosen queue.
///
/// # Errors
///
/// Returns `InvalidQueue` for an unknown pool, or the member queue's enqueue
/// error. Either way `f` has been invoked free-only.
pub fn queue<F>(pid: PoolId, guard: Option<RefId>, name: &'static str, f: F) -> Result<QueueId>
where
    F: FnOnce(ExecMode) + Send + 'static,
{
    let qid = match pick(pid) {
        Ok(qid) => qid,
        Err(err) => {
            f(ExecMode::FreeOnly);
            return Err(err);
        },
    };
    mpq::queue(qid, guard, name, f)?;
    Ok(qid)
}

/// # Errors
///
/// Returns `InvalidQueue` for an unknown pool.
pub fn queues(pid: PoolId) -> Result<Vec<QueueId>> {
    record(shared(pid).map(|pool| pool.queues.clone()))
}

/// # Errors
///
/// Returns `InvalidQueue` for an unknown pool.
pub fn name(pid: PoolId) -> Result<String> {
    record(shared(pid).map(|pool| pool.name.clone()))
}

/// Destroys the pool and all of its queues.
///
/// # Errors
///
/// Returns `InvalidQueue` for an unknown pool.
pub fn destroy(pid: PoolId, wait: bool) -> Result<()> {
    let Some(pool) = write(&POOLS).by_id.remove(&pid) else {
        return record(Err(AoslError::InvalidQueue(pid.to_string())));
    };
    for qid in &pool.queues {
        let _ = mpq::destroy(*qid, wait);
    }
    tracing::debug!(pool = %pid, name = %pool.name, "queue pool destroyed");
    Ok(())
}
