// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Multiplexed task queues.
//!
//! A queue is a named, single-consumer scheduler: entries enqueued from any
//! thread run in enqueue order on the queue's own thread, never two at once.
//! Entries can be guarded by a reference object; when the object is gone by
//! the time the entry runs, the entry is invoked with [`ExecMode::FreeOnly`].
//!
//! ```no_run
//! use aosl_engine::mpq;
//!
//! let q = mpq::create("decoder").unwrap();
//! mpq::queue(q, None, "greet", move |mode| {
//!     if !mode.is_free_only() {
//!         assert_eq!(mpq::this_queue(), Some(q));
//!     }
//! })
//! .unwrap();
//! let answer = mpq::call(q, None, "answer", |_| 42).unwrap();
//! assert_eq!(answer, 42);
//! mpq::destroy(q, true).unwrap();
//! ```

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use std::thread::JoinHandle;

use aosl_core::error::record;
use aosl_core::helpers::{lock, read, write};
use aosl_core::{AoslError, ExecMode, RefId, Result, Resume, Resumed};
use tokio::sync::mpsc;

use crate::config::QueueConfig;
use crate::queue_actor::QueueActor;
use crate::queue_messages::{QueueMsg, QueuedOp, TimerEntry};
use crate::runtime;

/// Identifier of a queue.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u32);

impl QueueId {
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mpq#{}", self.0)
    }
}

impl fmt::Debug for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// State shared between a queue's handle side and its actor thread.
pub(crate) struct QueueShared {
    pub(crate) id: QueueId,
    pub(crate) name: String,
    tx: mpsc::UnboundedSender<QueueMsg>,
    pending: AtomicUsize,
    stopping: AtomicBool,
    backlog_warn: usize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl QueueShared {
    fn enqueue(&self, op: QueuedOp) -> Result<()> {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if self.backlog_warn > 0 && pending % self.backlog_warn == 0 {
            tracing::warn!(queue = %self.id, name = %self.name, pending, "queue backlog growing");
        }

        if let Err(mpsc::error::SendError(msg)) = self.tx.send(QueueMsg::Run(op)) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            if let QueueMsg::Run(op) = msg {
                op.discard();
            }
            return Err(AoslError::QueueStopped(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn arm(&self, entry: TimerEntry) -> Result<()> {
        self.tx
            .send(QueueMsg::Arm(entry))
            .map_err(|_| AoslError::QueueStopped(self.name.clone()))
    }

    pub(crate) fn op_started(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Set once destroy starts; entries not yet started are released free-only.
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<QueueId, Arc<QueueShared>>,
    by_name: HashMap<String, QueueId>,
    next_id: u32,
}

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Registry::default()));

thread_local! {
    static CURRENT: Cell<Option<QueueId>> = const { Cell::new(None) };
}

pub(crate) fn shared(qid: QueueId) -> Result<Arc<QueueShared>> {
    read(&REGISTRY)
        .by_id
        .get(&qid)
        .cloned()
        .ok_or_else(|| AoslError::InvalidQueue(qid.to_string()))
}

/// Creates a queue with default settings.
///
/// # Errors
///
/// Returns `AlreadyExists` if the name is taken, or an I/O error if the queue
/// thread cannot be started.
pub fn create(name: &str) -> Result<QueueId> {
    create_with(name, &QueueConfig::default())
}

/// Creates a queue and starts its thread.
///
/// # Errors
///
/// Returns `AlreadyExists` if the name is taken, or an I/O error if the queue
/// thread cannot be started.
pub fn create_with(name: &str, config: &QueueConfig) -> Result<QueueId> {
    record(spawn_queue(name, config))
}

fn spawn_queue(name: &str, config: &QueueConfig) -> Result<QueueId> {
    let mut registry = write(&REGISTRY);
    if registry.by_name.contains_key(name) {
        return Err(AoslError::AlreadyExists(format!("queue '{name}'")));
    }

    let id = QueueId(registry.next_id);
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(QueueShared {
        id,
        name: name.to_string(),
        tx,
        pending: AtomicUsize::new(0),
        stopping: AtomicBool::new(false),
        backlog_warn: config.backlog_warn,
        thread: Mutex::new(None),
    });

    let rt = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
    let actor = QueueActor::new(Arc::clone(&shared), rx);
    let handle = std::thread::Builder::new().name(name.to_string()).spawn(move || {
        CURRENT.with(|current| current.set(Some(id)));
        rt.block_on(actor.run());
        CURRENT.with(|current| current.set(None));
    })?;
    *lock(&shared.thread) = Some(handle);

    registry.next_id = registry.next_id.wrapping_add(1);
    registry.by_name.insert(name.to_string(), id);
    registry.by_id.insert(id, shared);
    drop(registry);

    tracing::debug!(queue = %id, name, "queue created");
    Ok(id)
}

/// Finds a queue by name.
pub fn lookup(name: &str) -> Option<QueueId> {
    read(&REGISTRY).by_name.get(name).copied()
}

pub fn exists(qid: QueueId) -> bool {
    read(&REGISTRY).by_id.contains_key(&qid)
}

/// # Errors
///
/// Returns `InvalidQueue` if no such queue exists.
pub fn name(qid: QueueId) -> Result<String> {
    record(shared(qid).map(|q| q.name.clone()))
}

/// Entries enqueued but not yet started.
///
/// # Errors
///
/// Returns `InvalidQueue` if no such queue exists.
pub fn pending_count(qid: QueueId) -> Result<usize> {
    record(shared(qid).map(|q| q.pending()))
}

/// The queue whose thread is calling, or `None` off-queue.
pub fn this_queue() -> Option<QueueId> {
    CURRENT.with(Cell::get)
}

/// The process main queue, starting the runtime if needed.
///
/// # Errors
///
/// Returns an error if the runtime cannot be started.
pub fn main_queue() -> Result<QueueId> {
    Ok(runtime::get()?.main_queue())
}

/// Appends `f` to the queue.
///
/// With a `guard`, `f` runs under a lease on that object and sees
/// [`ExecMode::FreeOnly`] if the object is gone by then. Queue teardown also
/// delivers pending entries in free-only mode. A refused enqueue invokes `f`
/// free-only on the caller's thread before the error is returned.
///
/// # Errors
///
/// Returns `InvalidQueue` for an unknown queue and `QueueStopped` when the
/// queue is shutting down.
pub fn queue<F>(qid: QueueId, guard: Option<RefId>, name: &'static str, f: F) -> Result<()>
where
    F: FnOnce(ExecMode) + Send + 'static,
{
    let op = QueuedOp::new(name, guard, Box::new(f));
    record(match shared(qid) {
        Ok(q) => q.enqueue(op),
        Err(err) => {
            op.discard();
            Err(err)
        },
    })
}

/// Runs `f` on the queue and waits for its result.
///
/// Runs inline when already on `qid`. Two queues calling into each other
/// synchronously deadlock, as with any blocking cross-thread call.
///
/// # Errors
///
/// Returns `InvalidQueue`/`QueueStopped` if the entry cannot be queued, or
/// `Canceled` if the queue stopped before running it.
pub fn call<R, F>(qid: QueueId, guard: Option<RefId>, name: &'static str, f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce(ExecMode) -> R + Send + 'static,
{
    if this_queue() == Some(qid) {
        return Ok(match guard {
            Some(id) => aosl_core::refobj::with_lease(id, f),
            None => f(ExecMode::Exec),
        });
    }

    let (tx, rx) = std::sync::mpsc::sync_channel(1);
    queue(qid, guard, name, move |mode| {
        let value = match mode {
            ExecMode::Exec => Some(f(ExecMode::Exec)),
            // queue teardown
            ExecMode::FreeOnly if guard.is_none() => None,
            ExecMode::FreeOnly => Some(f(ExecMode::FreeOnly)),
        };
        if let Some(value) = value {
            let _ = tx.send(value);
        }
    })?;

    rx.recv().map_err(|_| AoslError::Canceled).inspect_err(aosl_core::error::set_last_error)
}

/// Re-enqueues `f` at the tail of the calling queue.
///
/// # Errors
///
/// Returns `NotOnQueue` when called off-queue.
pub fn yield_now<F>(name: &'static str, f: F) -> Result<()>
where
    F: FnOnce(ExecMode) + Send + 'static,
{
    match this_queue() {
        Some(qid) => queue(qid, None, name, f),
        None => record(Err(AoslError::NotOnQueue)),
    }
}

/// Posts a resume continuation to `qid`, falling back to an inline free-only
/// delivery when the queue refuses it.
pub(crate) fn post_resume<T>(
    qid: QueueId,
    guard: Option<RefId>,
    name: &'static str,
    resume: Resume<T>,
    result: Result<T>,
) where
    T: Send + 'static,
{
    let cell = Arc::new(Mutex::new(Some((resume, result))));
    let queued = Arc::clone(&cell);

    let posted = queue(qid, guard, name, move |mode| {
        let taken = lock(&queued).take();
        if let Some((resume, result)) = taken {
            match mode {
                ExecMode::Exec => resume(Resumed::Complete(result)),
                ExecMode::FreeOnly => resume(Resumed::FreeOnly),
            }
        }
    });

    if let Err(err) = posted {
        tracing::warn!(queue = %qid, op = name, error = %err, "resume target queue gone");
        let taken = lock(&cell).take();
        if let Some((resume, _)) = taken {
            resume(Resumed::FreeOnly);
        }
    }
}

/// Stops a queue. Entries that have not run yet are invoked free-only.
///
/// With `wait`, blocks until the queue thread has exited (unless called from
/// that queue itself).
///
/// # Errors
///
/// Returns `InvalidQueue` if no such queue exists.
pub fn destroy(qid: QueueId, wait: bool) -> Result<()> {
    let shared = {
        let mut registry = write(&REGISTRY);
        let Some(shared) = registry.by_id.remove(&qid) else {
            return record(Err(AoslError::InvalidQueue(qid.to_string())));
        };
        registry.by_name.remove(&shared.name);
        shared
    };

    shared.stopping.store(true, Ordering::Release);
    let _ = shared.tx.send(QueueMsg::Stop);
    tracing::debug!(queue = %qid, name = %shared.name, wait, "queue destroy requested");

    if wait && this_queue() != Some(qid) {
        let handle = lock(&shared.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(queue = %qid, "queue thread panicked during shutdown");
            }
        }
    }
    Ok(())
}
