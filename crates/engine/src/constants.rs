// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared defaults for queues, pools, timers and the I/O layer.
//!
//! This module provides the canonical default values for runtime
//! configuration. [`crate::config`] and the individual modules reference these
//! constants so the documented defaults and the effective ones never drift.
//!
//! # Queue backlog
//!
//! Queues are unbounded: an enqueue from the queue's own thread must never
//! block, and the scheduler never drops work. Backlog is only observed, with a
//! warning every time the pending count crosses a multiple of the threshold.

// === Queues ===

/// Name of the queue created for the process at runtime start.
pub const DEFAULT_MAIN_QUEUE_NAME: &str = "aosl.main";

/// Pending-entry count at which a queue starts logging backlog warnings.
///
/// A warning is emitted each time the count crosses a multiple of this value,
/// so a runaway producer shows up in logs without flooding them.
///
/// Recommended:
/// - Latency-sensitive queues: 256-1024
/// - General purpose: 4096
pub const DEFAULT_QUEUE_BACKLOG_WARN: usize = 4096;

// === Worker pool ===

/// Name prefix of the pool that executes large-cost FSM actions.
pub const DEFAULT_WORKER_POOL_NAME: &str = "aosl.worker";

/// Number of queues in the large-cost worker pool.
///
/// Large-cost actions block their queue for their whole duration, so the pool
/// size bounds how many of them can run at once across all FSMs.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

// === I/O runtime ===

/// Worker threads of the tokio runtime that drives deferred socket, file and
/// DNS operations. Completions never run user code on these threads; they are
/// posted back to the owning queue.
pub const DEFAULT_IO_WORKER_THREADS: usize = 2;

/// Thread name prefix of the I/O runtime.
pub const DEFAULT_IO_THREAD_NAME: &str = "aosl-io";

// === Timers ===

/// Shortest accepted timer interval in milliseconds. Shorter requests are
/// clamped up to this value.
pub const DEFAULT_TIMER_MIN_INTERVAL_MS: u64 = 1;

// === Packet splitter ===

/// Largest packet a splitter accepts before failing the stream.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

/// Bytes requested from the descriptor per splitter read.
pub const DEFAULT_SPLITTER_READ_CHUNK: usize = 4096;
