// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Process-wide runtime: the main queue, the large-cost worker pool and the
//! tokio runtime that drives deferred I/O.
//!
//! The runtime is built once, either explicitly with [`init`] or lazily with
//! default configuration on first use.

use std::sync::{Mutex, OnceLock};

use aosl_core::error::record;
use aosl_core::helpers::lock;
use aosl_core::{AoslError, Result};

use crate::config::EngineConfig;
use crate::mpq::{self, QueueId};
use crate::pool::{self, PoolId};

pub struct Runtime {
    config: EngineConfig,
    main_queue: QueueId,
    worker_pool: PoolId,
    io: tokio::runtime::Runtime,
}

impl Runtime {
    fn build(config: EngineConfig) -> Result<Self> {
        let main_queue = match mpq::lookup(&config.main_queue.name) {
            Some(existing) => existing,
            None => mpq::create_with(&config.main_queue.name, &config.queue)?,
        };
        let worker_pool = pool::create(&config.worker_pool.name, config.worker_pool.size, &config.queue)?;

        // Last, so no early return drops a tokio runtime on a queue thread.
        let io = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io.worker_threads.max(1))
            .thread_name(config.io.thread_name.clone())
            .enable_all()
            .build()?;

        tracing::info!(
            main_queue = %main_queue,
            worker_pool = %worker_pool,
            workers = config.worker_pool.size,
            io_threads = config.io.worker_threads,
            "AOSL runtime started"
        );
        Ok(Self { config, main_queue, worker_pool, io })
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn main_queue(&self) -> QueueId {
        self.main_queue
    }

    /// Pool that executes large-cost FSM actions.
    pub const fn worker_pool(&self) -> PoolId {
        self.worker_pool
    }

    /// Handle of the tokio runtime that drives deferred I/O.
    pub fn io_handle(&self) -> &tokio::runtime::Handle {
        self.io.handle()
    }
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// Builds the runtime from `config`.
///
/// # Errors
///
/// Returns `AlreadyExists` if the runtime is already running, or the error
/// that prevented a queue or the I/O runtime from starting.
pub fn init(config: EngineConfig) -> Result<&'static Runtime> {
    let _init = lock(&INIT);
    if RUNTIME.get().is_some() {
        return record(Err(AoslError::AlreadyExists("runtime already initialized".to_string())));
    }
    let runtime = record(Runtime::build(config))?;
    Ok(RUNTIME.get_or_init(|| runtime))
}

/// The running runtime, started with default configuration if needed.
///
/// # Errors
///
/// Returns the error that prevented the default runtime from starting.
pub fn get() -> Result<&'static Runtime> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let _init = lock(&INIT);
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = record(Runtime::build(EngineConfig::default()))?;
    Ok(RUNTIME.get_or_init(|| runtime))
}

/// The runtime if it has been started, without starting it.
pub fn try_current() -> Option<&'static Runtime> {
    RUNTIME.get()
}
