// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Lock helpers shared by the runtime crates.
//!
//! The runtime never leaves shared state half-updated across a user callback,
//! so a poisoned lock only means some unrelated callback panicked. These helpers
//! recover the guard instead of propagating the poison.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Blocks on `cond` until `done` returns true for the guarded value.
pub fn wait_until<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    mut done: impl FnMut(&mut T) -> bool,
) -> MutexGuard<'a, T> {
    cond.wait_while(guard, |value| !done(value)).unwrap_or_else(PoisonError::into_inner)
}
