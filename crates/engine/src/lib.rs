// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! engine: the executing half of AOSL.
//!
//! Queues ([`mpq`]) run closures in FIFO order on their own threads. Timers,
//! task objects, the generic state machine and coroutine I/O all schedule
//! their work onto queues, and guard it with reference objects from
//! `aosl-core` so that teardown races degrade into free-only invocations.
//!
//! ```no_run
//! use std::time::Duration;
//! use aosl_engine::{config, logging, runtime, timer};
//!
//! let loaded = config::load(Some("aosl.toml")).unwrap();
//! logging::init_logging(&loaded.config.log).unwrap();
//! let rt = runtime::init(loaded.config).unwrap();
//!
//! let tick = timer::set_timer(rt.main_queue(), "tick", Duration::from_millis(100), |now| {
//!     tracing::info!(?now, "tick");
//! })
//! .unwrap();
//! std::thread::sleep(Duration::from_secs(1));
//! timer::kill(tick).unwrap();
//! ```

// --- Public Modules ---

pub mod coio;
pub mod config;
pub mod constants;
pub mod gfsm;
pub mod logging;
pub mod mpq;
pub mod pool;
pub mod runtime;
pub mod sbus;
pub mod task;
pub mod timer;

// Queue internals
mod queue_actor;
mod queue_messages;

// Re-exports
pub use config::EngineConfig;
pub use coio::CoFd;
pub use gfsm::{ActCost, FsmId, StateDef, Transition};
pub use mpq::QueueId;
pub use pool::PoolId;
pub use runtime::Runtime;
pub use task::{OpFlow, TaskId, TaskKind, TaskTarget};
pub use timer::{TimerId, TimerKind};

#[cfg(test)]
mod tests;
