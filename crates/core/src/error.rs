// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for the AOSL runtime.
//!
//! Every fallible operation returns [`AoslError`]. Each variant carries a
//! positive errno-style code (see [`AoslError::errno`]) so callers that speak
//! the signed-integer contract can render `-errno` directly, and every public
//! API that fails also records the code in a per-thread "last error" slot
//! ([`last_errno`]).

use std::cell::Cell;
use std::io;

use thiserror::Error;

/// errno values used by the runtime (Linux numbering).
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const EPIPE: i32 = 32;
    pub const ENOTSUP: i32 = 95;
    pub const EOPNOTSUPP: i32 = 95;
    pub const EADDRINUSE: i32 = 98;
    pub const ENOTCONN: i32 = 107;
    pub const ESHUTDOWN: i32 = 108;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
    pub const ECONNRESET: i32 = 104;
    pub const ECANCELED: i32 = 125;
}

/// Main error type for AOSL operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AoslError {
    /// A parameter failed validation.
    ///
    /// Examples:
    /// - Zero timer interval
    /// - Buffer region outside the data object
    /// - FSM initial state missing from the table
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The reference id is stale, destroyed or of a different payload type.
    #[error("invalid reference {0}")]
    InvalidRef(String),

    /// No queue (or pool) exists with the given id or name.
    #[error("invalid queue: {0}")]
    InvalidQueue(String),

    /// The I/O descriptor has been closed.
    #[error("bad descriptor {0}")]
    BadDescriptor(String),

    /// The FSM has no transition for the event in its current state.
    #[error("event {event} not handled in state {state}")]
    NotHandled { state: i32, event: u32 },

    /// The call requires running on a queue thread.
    #[error("not running on a queue")]
    NotOnQueue,

    /// A named object already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The target refuses the request in its current condition.
    #[error("busy: {0}")]
    Busy(String),

    /// The operation was abandoned before it completed.
    #[error("operation canceled")]
    Canceled,

    /// The operation did not complete in time.
    #[error("operation timed out")]
    TimedOut,

    /// The queue is shutting down and accepts no more work.
    #[error("queue stopped: {0}")]
    QueueStopped(String),

    /// A table or allocation limit was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The device does not implement the requested operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// An operating system I/O failure.
    #[error("I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    /// A user action reported failure with its own (positive) code.
    #[error("action failed with code {0}")]
    Action(i32),
}

impl AoslError {
    /// Positive errno-style code for this error.
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => errno::EINVAL,
            Self::InvalidRef(_) | Self::InvalidQueue(_) => errno::ENOENT,
            Self::BadDescriptor(_) => errno::EBADF,
            Self::NotHandled { .. } => errno::ENOTSUP,
            Self::NotOnQueue => errno::EPERM,
            Self::AlreadyExists(_) => errno::EEXIST,
            Self::Busy(_) => errno::EBUSY,
            Self::Canceled => errno::ECANCELED,
            Self::TimedOut => errno::ETIMEDOUT,
            Self::QueueStopped(_) => errno::ESHUTDOWN,
            Self::ResourceExhausted(_) => errno::ENOMEM,
            Self::Unsupported(_) => errno::EOPNOTSUPP,
            Self::Io { kind, .. } => io_kind_errno(*kind),
            Self::Action(code) => {
                if *code == 0 {
                    errno::EIO
                } else {
                    code.saturating_abs()
                }
            },
        }
    }

    /// Whether a retry of the same operation could succeed.
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::Io { kind: io::ErrorKind::WouldBlock, .. })
    }
}

const fn io_kind_errno(kind: io::ErrorKind) -> i32 {
    match kind {
        io::ErrorKind::NotFound => errno::ENOENT,
        io::ErrorKind::PermissionDenied => errno::EPERM,
        io::ErrorKind::ConnectionRefused => errno::ECONNREFUSED,
        io::ErrorKind::ConnectionReset => errno::ECONNRESET,
        io::ErrorKind::NotConnected => errno::ENOTCONN,
        io::ErrorKind::AddrInUse => errno::EADDRINUSE,
        io::ErrorKind::BrokenPipe => errno::EPIPE,
        io::ErrorKind::AlreadyExists => errno::EEXIST,
        io::ErrorKind::WouldBlock => errno::EAGAIN,
        io::ErrorKind::InvalidInput => errno::EINVAL,
        io::ErrorKind::TimedOut => errno::ETIMEDOUT,
        _ => errno::EIO,
    }
}

impl From<io::Error> for AoslError {
    fn from(err: io::Error) -> Self {
        Self::Io { kind: err.kind(), message: err.to_string() }
    }
}

/// Convenience type alias for Results using `AoslError`.
pub type Result<T> = std::result::Result<T, AoslError>;

thread_local! {
    static LAST_ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Records `err` as this thread's last error.
pub fn set_last_error(err: &AoslError) {
    LAST_ERRNO.with(|slot| slot.set(err.errno()));
}

/// Returns the errno recorded by the most recent failing call on this thread, or 0.
pub fn last_errno() -> i32 {
    LAST_ERRNO.with(Cell::get)
}

pub fn clear_last_error() {
    LAST_ERRNO.with(|slot| slot.set(0));
}

/// Records the error of a failed result before handing it back.
pub fn record<T>(result: Result<T>) -> Result<T> {
    result.inspect_err(set_last_error)
}
