// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Generation-checked reference objects.
//!
//! Objects shared across queues live in a process-wide slab. A [`RefId`] is an
//! `{index, generation}` pair: the generation (the object's "magic") is bumped
//! every time a slot is freed, so a stale id captured before destruction can
//! never resolve to a newer object that reuses the slot.
//!
//! Access goes through [`hold`], which performs the liveness check and the
//! usage increment atomically with respect to [`destroy`]. A dead or recycled
//! id is not an error for the holder: the callback runs with
//! [`Access::FreeOnly`] so it can release whatever it captured.
//!
//! # Destroy-wait
//!
//! `destroy(id, wait = true)` (or any destroy of an object created with
//! `destroy_wait`) blocks until every outstanding lease is released and then
//! runs the destructor on the calling thread. When the calling thread itself
//! holds a lease on the object, blocking would deadlock; in that case the
//! destructor is deferred to the release of the last lease instead. After
//! `destroy` returns, no new lease can be taken.

use std::any::{type_name, Any};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, LazyLock, Mutex, RwLock};

use crate::error::{record, AoslError, Result};
use crate::helpers::{lock, read, wait_until, write};
use crate::outcome::ExecMode;

/// Upper bound on simultaneously live reference objects.
pub const MAX_OBJECTS: usize = 1 << 24;

type Payload = Box<dyn Any + Send + Sync>;
type Dtor = Box<dyn FnOnce(&(dyn Any + Send + Sync)) + Send>;

/// Handle to a reference object: slot index plus generation ("magic").
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId {
    index: u32,
    generation: u32,
}

impl RefId {
    /// Never resolves to a live object.
    pub const INVALID: Self = Self { index: u32::MAX, generation: 0 };

    /// Rebuilds a handle from a previously captured index and magic.
    pub const fn from_parts(index: u32, magic: u32) -> Self {
        Self { index, generation: magic }
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation the handle was issued with.
    pub const fn magic(self) -> u32 {
        self.generation
    }

    pub const fn is_invalid(self) -> bool {
        self.generation == 0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}:{}", self.index, self.generation)
    }
}

impl fmt::Debug for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// What a [`hold`] callback sees.
#[derive(Debug)]
pub enum Access<'a, T> {
    /// The object is alive and leased for the duration of the callback.
    Live(&'a T),
    /// The object is gone; release captured resources only.
    FreeOnly,
}

impl<'a, T> Access<'a, T> {
    pub const fn live(&self) -> Option<&'a T> {
        match self {
            Self::Live(payload) => Some(*payload),
            Self::FreeOnly => None,
        }
    }

    pub const fn mode(&self) -> ExecMode {
        match self {
            Self::Live(_) => ExecMode::Exec,
            Self::FreeOnly => ExecMode::FreeOnly,
        }
    }
}

struct LeaseState {
    usage: usize,
    destroying: bool,
    dtor_deferred: bool,
}

struct Entry {
    id: RefId,
    type_name: &'static str,
    payload: Payload,
    dtor: Mutex<Option<Dtor>>,
    state: Mutex<LeaseState>,
    drained: Condvar,
    destroy_wait: bool,
}

impl Entry {
    fn run_dtor(&self) {
        let dtor = lock(&self.dtor).take();
        if let Some(dtor) = dtor {
            dtor(self.payload.as_ref());
        }
        tracing::trace!(ref_id = %self.id, payload = self.type_name, "ref object destroyed");
    }
}

struct Slot {
    generation: u32,
    entry: Option<Arc<Entry>>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Table {
    fn lookup(&self, id: RefId) -> Option<&Arc<Entry>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }
}

static TABLE: LazyLock<RwLock<Table>> = LazyLock::new(|| RwLock::new(Table::default()));

thread_local! {
    // Leases held by the current thread, innermost last.
    static HELD: RefCell<Vec<RefId>> = const { RefCell::new(Vec::new()) };
}

const fn next_generation(generation: u32) -> u32 {
    if generation == u32::MAX {
        1
    } else {
        generation + 1
    }
}

fn insert(
    payload: Payload,
    type_name: &'static str,
    dtor: Option<Dtor>,
    destroy_wait: bool,
) -> Result<RefId> {
    let mut table = write(&TABLE);
    let index = if let Some(index) = table.free.pop() {
        index
    } else {
        if table.slots.len() >= MAX_OBJECTS {
            return record(Err(AoslError::ResourceExhausted(format!(
                "reference table full ({MAX_OBJECTS} objects)"
            ))));
        }
        table.slots.push(Slot { generation: 1, entry: None });
        u32::try_from(table.slots.len() - 1)
            .map_err(|_| AoslError::ResourceExhausted("reference index overflow".to_string()))?
    };

    let generation = table.slots[index as usize].generation;
    let id = RefId { index, generation };
    table.slots[index as usize].entry = Some(Arc::new(Entry {
        id,
        type_name,
        payload,
        dtor: Mutex::new(dtor),
        state: Mutex::new(LeaseState { usage: 0, destroying: false, dtor_deferred: false }),
        drained: Condvar::new(),
        destroy_wait,
    }));
    table.live += 1;
    drop(table);

    tracing::trace!(ref_id = %id, payload = type_name, destroy_wait, "ref object created");
    Ok(id)
}

/// Creates a reference object owning `payload`.
///
/// `dtor` runs exactly once, after the object is destroyed and every lease
/// has been released. The payload itself is dropped right after.
///
/// # Errors
///
/// Returns `ResourceExhausted` when the reference table is full.
pub fn create<T, D>(payload: T, dtor: D, destroy_wait: bool) -> Result<RefId>
where
    T: Send + Sync + 'static,
    D: FnOnce(&T) + Send + 'static,
{
    let dtor: Dtor = Box::new(move |any: &(dyn Any + Send + Sync)| {
        if let Some(payload) = any.downcast_ref::<T>() {
            dtor(payload);
        }
    });
    insert(Box::new(payload), type_name::<T>(), Some(dtor), destroy_wait)
}

/// Creates a reference object whose teardown is just dropping the payload.
///
/// # Errors
///
/// Returns `ResourceExhausted` when the reference table is full.
pub fn create_plain<T>(payload: T, destroy_wait: bool) -> Result<RefId>
where
    T: Send + Sync + 'static,
{
    insert(Box::new(payload), type_name::<T>(), None, destroy_wait)
}

/// Current magic of the object `id` refers to.
///
/// # Errors
///
/// Returns `InvalidRef` if the object has been destroyed or the slot recycled.
pub fn magic(id: RefId) -> Result<u32> {
    let table = read(&TABLE);
    match table.lookup(id) {
        Some(entry) => Ok(entry.id.generation),
        None => record(Err(AoslError::InvalidRef(id.to_string()))),
    }
}

pub fn is_live(id: RefId) -> bool {
    read(&TABLE).lookup(id).is_some()
}

/// Number of live (not yet destroyed) reference objects in the process.
pub fn live_count() -> usize {
    read(&TABLE).live
}

struct Lease {
    entry: Arc<Entry>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let id = self.entry.id;
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|h| *h == id) {
                held.remove(pos);
            }
        });

        let run_dtor = {
            let mut state = lock(&self.entry.state);
            state.usage -= 1;
            if state.usage > 0 {
                false
            } else if state.dtor_deferred {
                state.dtor_deferred = false;
                true
            } else {
                self.entry.drained.notify_all();
                false
            }
        };
        if run_dtor {
            self.entry.run_dtor();
        }
    }
}

fn acquire(id: RefId) -> Option<Lease> {
    let table = read(&TABLE);
    let entry = table.lookup(id)?;
    {
        let mut state = lock(&entry.state);
        if state.destroying {
            return None;
        }
        state.usage += 1;
    }
    let entry = Arc::clone(entry);
    drop(table);

    let _ = HELD.try_with(|held| held.borrow_mut().push(id));
    Some(Lease { entry })
}

/// Runs `f` with a lease on the object `id` refers to.
///
/// The callback sees [`Access::Live`] when the object is alive and has
/// payload type `T`; otherwise it sees [`Access::FreeOnly`].
pub fn hold<T, R>(id: RefId, f: impl FnOnce(Access<'_, T>) -> R) -> R
where
    T: 'static,
{
    match acquire(id) {
        Some(lease) => match lease.entry.payload.downcast_ref::<T>() {
            Some(payload) => f(Access::Live(payload)),
            None => {
                tracing::warn!(
                    ref_id = %id,
                    expected = type_name::<T>(),
                    actual = lease.entry.type_name,
                    "hold with mismatched payload type"
                );
                f(Access::FreeOnly)
            },
        },
        None => f(Access::FreeOnly),
    }
}

/// Runs `f` under a lease on `id` without touching the payload.
///
/// Used by schedulers to guard queued work with the lifetime of an object.
pub fn with_lease<R>(id: RefId, f: impl FnOnce(ExecMode) -> R) -> R {
    match acquire(id) {
        Some(_lease) => f(ExecMode::Exec),
        None => f(ExecMode::FreeOnly),
    }
}

/// Whether the current thread is inside a lease on `id`.
pub fn held_by_current_thread(id: RefId) -> bool {
    HELD.try_with(|held| held.borrow().contains(&id)).unwrap_or(false)
}

/// Destroys the object `id` refers to.
///
/// The slot is released immediately, so every later [`hold`] sees
/// `FreeOnly`. With `wait` (or a destroy-wait object) the call blocks until
/// outstanding leases drain and runs the destructor itself; otherwise the
/// destructor runs on whichever thread releases the last lease.
///
/// # Errors
///
/// Returns `InvalidRef` if the object was already destroyed.
pub fn destroy(id: RefId, wait: bool) -> Result<()> {
    let entry = {
        let mut guard = write(&TABLE);
        let table = &mut *guard;
        let Some(slot) = table
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
        else {
            return record(Err(AoslError::InvalidRef(id.to_string())));
        };
        let Some(entry) = slot.entry.take() else {
            return record(Err(AoslError::InvalidRef(id.to_string())));
        };
        slot.generation = next_generation(slot.generation);
        table.free.push(id.index);
        table.live -= 1;
        lock(&entry.state).destroying = true;
        entry
    };

    let wait = wait || entry.destroy_wait;
    let self_held = held_by_current_thread(id);

    let mut state = lock(&entry.state);
    if state.usage == 0 {
        drop(state);
        entry.run_dtor();
        return Ok(());
    }

    if self_held || !wait {
        if self_held && wait {
            tracing::debug!(
                ref_id = %id,
                "destroy-wait issued under own lease, destructor deferred to lease release"
            );
        }
        state.dtor_deferred = true;
        return Ok(());
    }

    tracing::trace!(ref_id = %id, usage = state.usage, "waiting for leases to drain");
    let state = wait_until(&entry.drained, state, |s| s.usage == 0);
    drop(state);
    entry.run_dtor();
    Ok(())
}

/// Typed owner of a reference object. Destroys (waiting) when dropped.
pub struct RefObject<T> {
    id: RefId,
    _payload: PhantomData<fn() -> T>,
}

impl<T> RefObject<T>
where
    T: Send + Sync + 'static,
{
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when the reference table is full.
    pub fn new(payload: T, destroy_wait: bool) -> Result<Self> {
        Ok(Self { id: create_plain(payload, destroy_wait)?, _payload: PhantomData })
    }

    /// # Errors
    ///
    /// Returns `ResourceExhausted` when the reference table is full.
    pub fn with_dtor(
        payload: T,
        dtor: impl FnOnce(&T) + Send + 'static,
        destroy_wait: bool,
    ) -> Result<Self> {
        Ok(Self { id: create(payload, dtor, destroy_wait)?, _payload: PhantomData })
    }

    pub const fn id(&self) -> RefId {
        self.id
    }

    pub fn hold<R>(&self, f: impl FnOnce(Access<'_, T>) -> R) -> R {
        hold(self.id, f)
    }

    /// # Errors
    ///
    /// Returns `InvalidRef` if the object was already destroyed through its id.
    pub fn destroy(mut self, wait: bool) -> Result<()> {
        let id = std::mem::replace(&mut self.id, RefId::INVALID);
        destroy(id, wait)
    }
}

impl<T> Drop for RefObject<T> {
    fn drop(&mut self) {
        if !self.id.is_invalid() && is_live(self.id) {
            let _ = destroy(self.id, true);
        }
    }
}

impl<T> fmt::Debug for RefObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefObject").field("id", &self.id).finish()
    }
}
