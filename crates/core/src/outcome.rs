// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Invocation modes and the tri-state completion contract.
//!
//! Asynchronous operations in the runtime (FSM triggers, coroutine I/O,
//! packet reads) all answer with `Result<Outcome>`:
//!
//! | result                 | code | meaning                                   |
//! |------------------------|------|-------------------------------------------|
//! | `Err(e)`               | `<0` | failed synchronously, resume already ran  |
//! | `Ok(Outcome::Pending)` | `0`  | queued, resume fires later on its queue   |
//! | `Ok(Outcome::Ready)`   | `>0` | completed inline, resume already ran      |
//!
//! The value produced by the operation travels through the resume callback
//! ([`Resumed`]) or a result slot, never through the outcome itself.

use crate::error::{AoslError, Result};

/// How a queued callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecMode {
    /// The target is alive; do the work.
    Exec,
    /// The target is gone (or the queue is tearing down). Release captured
    /// resources only.
    FreeOnly,
}

impl ExecMode {
    pub const fn is_free_only(self) -> bool {
        matches!(self, Self::FreeOnly)
    }
}

/// Successful half of the tri-state contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Accepted; completion is delivered later.
    Pending,
    /// Completed before the call returned.
    Ready,
}

impl Outcome {
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }

    pub const fn code(self) -> isize {
        match self {
            Self::Pending => 0,
            Self::Ready => 1,
        }
    }
}

/// Renders a tri-state result as its signed integer form (`-errno`, `0`, `1`).
pub fn tri_code(result: &Result<Outcome>) -> isize {
    match result {
        Ok(outcome) => outcome.code(),
        Err(err) => -(err.errno() as isize),
    }
}

/// What a resume continuation receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumed<T> {
    /// The operation finished, successfully or not.
    Complete(std::result::Result<T, AoslError>),
    /// The owning object died before the completion could be delivered.
    FreeOnly,
}

impl<T> Resumed<T> {
    pub const fn is_free_only(&self) -> bool {
        matches!(self, Self::FreeOnly)
    }

    /// The completion result, treating free-only delivery as cancellation.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Complete(result) => result,
            Self::FreeOnly => Err(AoslError::Canceled),
        }
    }
}

/// Boxed resume continuation.
pub type Resume<T> = Box<dyn FnOnce(Resumed<T>) + Send + 'static>;
