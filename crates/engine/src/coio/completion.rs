// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

use aosl_core::refobj::RefId;
use aosl_core::{AoslError, Result, Resume, RetSlot};

use crate::mpq::{self, QueueId};

struct Target {
    op: &'static str,
    queue: QueueId,
    guard: Option<RefId>,
    ret: Option<RetSlot>,
    resume: Option<Resume<usize>>,
}

impl Target {
    fn deliver(self, result: Result<usize>) {
        if let (Some(ret), Ok(n)) = (&self.ret, &result) {
            ret.set(*n);
        }
        match self.resume {
            Some(resume) => mpq::post_resume(self.queue, self.guard, self.op, resume, result),
            None => tracing::trace!(op = self.op, ok = result.is_ok(), "completion without resume"),
        }
    }
}

/// Completion handle of one deferred operation.
///
/// Completing it posts the resume continuation to the issuing queue, guarded
/// by the descriptor: if the descriptor is closed by then, the resume runs
/// free-only. A completion dropped without being completed reports
/// `Canceled`, so every deferred operation resumes exactly once.
pub struct Completion {
    target: Option<Target>,
}

impl Completion {
    pub(crate) fn new(
        op: &'static str,
        queue: QueueId,
        guard: Option<RefId>,
        ret: Option<RetSlot>,
        resume: Option<Resume<usize>>,
    ) -> Self {
        Self { target: Some(Target { op, queue, guard, ret, resume }) }
    }

    /// Queue the resume will run on.
    pub fn queue(&self) -> Option<QueueId> {
        self.target.as_ref().map(|target| target.queue)
    }

    pub fn complete(mut self, result: Result<usize>) {
        if let Some(target) = self.target.take() {
            target.deliver(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target.deliver(Err(AoslError::Canceled));
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("op", &self.target.as_ref().map(|target| target.op))
            .field("queue", &self.queue())
            .finish()
    }
}
