// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Coroutine-style I/O.
//!
//! Every operation follows one tri-state contract:
//!
//! - `Err(_)`: synchronous failure. The resume continuation (if any) has
//!   already run with the same error.
//! - `Ok(Outcome::Pending)`: the operation is in flight. The resume runs
//!   exactly once later, on the queue the operation was issued from (the main
//!   queue when issued off-queue).
//! - `Ok(Outcome::Ready)`: the operation completed inside the call and the
//!   resume has already run.
//!
//! A pending operation owns its buffers (through [`BufRegion`] and [`Slot`]
//! clones) until it completes. Closing a descriptor cancels its in-flight
//! work; their resumes run in free-only mode.
//!
//! [`awaitable`] turns any of these operations into a [`std::future::Future`].
//!
//! Devices implement [`CoDevice`]: a non-blocking [`CoDevice::try_io`]
//! attempt and a deferred [`CoDevice::start_io`] path that finishes through a
//! [`Completion`].

mod awaitable;
mod completion;
mod file;
mod net;
mod pktspltr;
mod resolve;

use std::fmt;
use std::future::Future;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aosl_core::error::record;
use aosl_core::refobj::{self, Access, RefId};
use aosl_core::{AoslError, BufRegion, Outcome, Result, Resume, Resumed, RetSlot, Slot};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub use awaitable::{awaitable, CoFuture};
pub use completion::Completion;
pub use file::CoFile;
pub use net::{CoTcpListener, CoTcpStream, CoUdpSocket};
pub use pktspltr::{PacketCheck, PacketSplitter};
pub use resolve::resolve_host;

use crate::mpq::{self, QueueId};
use crate::runtime;

/// Side-channel data of a datagram operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extra {
    pub flags: i32,
    /// Destination for sends, source for receives.
    pub addr: Option<SocketAddr>,
    pub control: Option<Bytes>,
}

/// A connection produced by [`accept`].
#[derive(Debug)]
pub struct Accepted {
    pub fd: CoFd,
    pub peer: SocketAddr,
}

/// One I/O request handed to a device.
#[derive(Debug)]
pub enum CoOp {
    Read { buf: BufRegion },
    Write { buf: BufRegion },
    Recv { buf: BufRegion, extra: Option<Slot<Extra>> },
    Send { buf: BufRegion, extra: Option<Extra> },
    Connect { addr: SocketAddr, timeout: Option<Duration> },
    Accept { conn: Slot<Accepted> },
    Seek { pos: SeekFrom },
}

impl CoOp {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "co_read",
            Self::Write { .. } => "co_write",
            Self::Recv { .. } => "co_recv",
            Self::Send { .. } => "co_send",
            Self::Connect { .. } => "co_connect",
            Self::Accept { .. } => "co_accept",
            Self::Seek { .. } => "co_lseek",
        }
    }

    pub(crate) fn unsupported(&self, device: &str) -> AoslError {
        AoslError::Unsupported(format!("{} on {device}", self.name()))
    }
}

/// An I/O collaborator behind a descriptor.
pub trait CoDevice: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// Attempts `op` without blocking. `Ok(None)` means it would block and
    /// must go through [`CoDevice::start_io`].
    ///
    /// # Errors
    ///
    /// Any immediate failure of the operation.
    fn try_io(&self, op: &CoOp) -> Result<Option<usize>>;

    /// Runs `op` in the background and reports through `done`. Work should
    /// stop once `cancel` fires; dropping `done` reports `Canceled`.
    fn start_io(self: Arc<Self>, op: CoOp, done: Completion, cancel: CancellationToken);

    /// # Errors
    ///
    /// `Unsupported` unless the device is a bound socket.
    fn local_addr(&self) -> Result<SocketAddr> {
        Err(AoslError::Unsupported(format!("local_addr on {}", self.kind())))
    }
}

struct FdState {
    device: Arc<dyn CoDevice>,
    cancel: CancellationToken,
}

/// Descriptor of an attached device.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoFd(RefId);

impl CoFd {
    pub const fn ref_id(self) -> RefId {
        self.0
    }
}

impl fmt::Display for CoFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cofd({})", self.0)
    }
}

impl fmt::Debug for CoFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Wraps `device` in a descriptor.
///
/// # Errors
///
/// Returns `ResourceExhausted` when the object table is full.
pub fn attach<D: CoDevice>(device: D) -> Result<CoFd> {
    attach_arc(Arc::new(device))
}

fn attach_arc(device: Arc<dyn CoDevice>) -> Result<CoFd> {
    let kind = device.kind();
    let state = FdState { device, cancel: CancellationToken::new() };
    let fd = CoFd(refobj::create(
        state,
        |state: &FdState| {
            state.cancel.cancel();
            tracing::debug!(kind = state.device.kind(), "descriptor closed");
        },
        true,
    )?);
    tracing::debug!(fd = %fd, kind, "descriptor attached");
    Ok(fd)
}

/// Closes the descriptor. In-flight operations are canceled and their
/// resumes run free-only.
///
/// # Errors
///
/// Returns `BadDescriptor` if it is already closed.
pub fn close(fd: CoFd) -> Result<()> {
    record(refobj::destroy(fd.0, true).map_err(|_| AoslError::BadDescriptor(fd.to_string())))
}

/// # Errors
///
/// Returns `BadDescriptor` for a closed descriptor.
pub fn kind(fd: CoFd) -> Result<&'static str> {
    record(device(fd).map(|(device, _)| device.kind()))
}

/// Local address of a socket descriptor.
///
/// # Errors
///
/// Returns `BadDescriptor` for a closed descriptor and `Unsupported` for a
/// device without an address.
pub fn local_addr(fd: CoFd) -> Result<SocketAddr> {
    record(device(fd).and_then(|(device, _)| device.local_addr()))
}

fn device(fd: CoFd) -> Result<(Arc<dyn CoDevice>, CancellationToken)> {
    refobj::hold::<FdState, _>(fd.0, |access| match access {
        Access::Live(state) => Ok((Arc::clone(&state.device), state.cancel.clone())),
        Access::FreeOnly => Err(AoslError::BadDescriptor(fd.to_string())),
    })
}

fn fail<T>(resume: Option<Resume<T>>, err: AoslError) -> Result<Outcome> {
    if let Some(resume) = resume {
        resume(Resumed::Complete(Err(err.clone())));
    }
    record(Err(err))
}

/// Queue that receives completions of operations issued from this thread.
pub(crate) fn origin_queue() -> Result<QueueId> {
    match mpq::this_queue() {
        Some(queue) => Ok(queue),
        None => mpq::main_queue(),
    }
}

fn issue(fd: CoFd, op: CoOp, ret: Option<RetSlot>, resume: Option<Resume<usize>>) -> Result<Outcome> {
    let (device, cancel) = match device(fd) {
        Ok(found) => found,
        Err(err) => {
            if let Some(resume) = resume {
                resume(Resumed::FreeOnly);
            }
            return record(Err(err));
        },
    };

    let name = op.name();
    match device.try_io(&op) {
        Ok(Some(n)) => {
            tracing::trace!(fd = %fd, op = name, n, "completed inline");
            if let Some(ret) = ret {
                ret.set(n);
            }
            if let Some(resume) = resume {
                resume(Resumed::Complete(Ok(n)));
            }
            Ok(Outcome::Ready)
        },
        Ok(None) => {
            let queue = match origin_queue() {
                Ok(queue) => queue,
                Err(err) => return fail(resume, err),
            };
            tracing::trace!(fd = %fd, op = name, queue = %queue, "deferred");
            let done = Completion::new(name, queue, Some(fd.0), ret, resume);
            device.start_io(op, done, cancel);
            Ok(Outcome::Pending)
        },
        Err(err) => {
            tracing::debug!(fd = %fd, op = name, error = %err, "failed inline");
            fail(resume, err)
        },
    }
}

/// Reads into `buf`. The result is the byte count; `0` is end of stream.
///
/// # Errors
///
/// See the module documentation.
pub fn read(fd: CoFd, buf: BufRegion, ret: Option<RetSlot>, resume: Option<Resume<usize>>) -> Result<Outcome> {
    issue(fd, CoOp::Read { buf }, ret, resume)
}

/// Writes `buf`. The result is the byte count written.
///
/// # Errors
///
/// See the module documentation.
pub fn write(fd: CoFd, buf: BufRegion, ret: Option<RetSlot>, resume: Option<Resume<usize>>) -> Result<Outcome> {
    issue(fd, CoOp::Write { buf }, ret, resume)
}

/// Receives into `buf`; the peer address lands in `extra` when given.
///
/// # Errors
///
/// See the module documentation.
pub fn recv(
    fd: CoFd,
    buf: BufRegion,
    extra: Option<Slot<Extra>>,
    ret: Option<RetSlot>,
    resume: Option<Resume<usize>>,
) -> Result<Outcome> {
    issue(fd, CoOp::Recv { buf, extra }, ret, resume)
}

/// Sends `buf`, to `extra.addr` when given.
///
/// # Errors
///
/// See the module documentation.
pub fn send(
    fd: CoFd,
    buf: BufRegion,
    extra: Option<Extra>,
    ret: Option<RetSlot>,
    resume: Option<Resume<usize>>,
) -> Result<Outcome> {
    issue(fd, CoOp::Send { buf, extra }, ret, resume)
}

/// Connects to `addr`, failing with `TimedOut` after `timeout`.
///
/// # Errors
///
/// See the module documentation.
pub fn connect(
    fd: CoFd,
    addr: SocketAddr,
    timeout: Option<Duration>,
    resume: Option<Resume<usize>>,
) -> Result<Outcome> {
    issue(fd, CoOp::Connect { addr, timeout }, None, resume)
}

/// Accepts one connection into `conn`.
///
/// # Errors
///
/// See the module documentation.
pub fn accept(fd: CoFd, conn: Slot<Accepted>, resume: Option<Resume<usize>>) -> Result<Outcome> {
    issue(fd, CoOp::Accept { conn }, None, resume)
}

/// Repositions a file descriptor. The result is the new offset.
///
/// # Errors
///
/// See the module documentation.
pub fn lseek(fd: CoFd, pos: SeekFrom, ret: Option<RetSlot>, resume: Option<Resume<usize>>) -> Result<Outcome> {
    issue(fd, CoOp::Seek { pos }, ret, resume)
}

/// Drives `work` on the I/O runtime, racing it against `cancel`.
pub(crate) fn spawn_io<F>(cancel: CancellationToken, done: Completion, work: F)
where
    F: Future<Output = Result<usize>> + Send + 'static,
{
    let rt = match runtime::get() {
        Ok(rt) => rt,
        Err(err) => {
            done.complete(Err(err));
            return;
        },
    };
    rt.io_handle().spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => done.complete(Err(AoslError::Canceled)),
            result = work => done.complete(result),
        }
    });
}

/// Maps a non-blocking attempt to the device contract.
pub(crate) fn would_block(result: std::io::Result<usize>) -> Result<Option<usize>> {
    match result {
        Ok(n) => Ok(Some(n)),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(err.into()),
    }
}
