// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Unit tests for the engine crate.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

mod queue_order;
mod task_sched;
mod timers;

/// Upper bound for any cross-thread wait in these tests.
const WAIT: Duration = Duration::from_secs(5);

/// Queue names are process-global; tests run concurrently.
fn unique(prefix: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("{prefix}-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}
