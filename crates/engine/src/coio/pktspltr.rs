// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Packet splitter: turns a byte stream descriptor into whole packets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use aosl_core::error::record;
use aosl_core::helpers::lock;
use aosl_core::{AoslError, BufRegion, Data, Outcome, Result, Resume, Resumed};
use bytes::{Bytes, BytesMut};

use super::CoFd;
use crate::constants::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_SPLITTER_READ_CHUNK};
use crate::runtime;

/// Inspects buffered bytes: `Ok(Some(len))` when a whole packet of `len`
/// bytes is at the front, `Ok(None)` when more bytes are needed.
pub type PacketCheck = Box<dyn Fn(&[u8]) -> Result<Option<usize>> + Send + Sync>;

enum Step {
    Packet(Bytes),
    NeedMore(usize),
}

struct Splitter {
    fd: CoFd,
    check: PacketCheck,
    max_packet_size: usize,
    read_chunk: usize,
    buf: Mutex<BytesMut>,
    reading: AtomicBool,
}

impl Splitter {
    fn next_step(&self) -> Result<Step> {
        let mut buf = lock(&self.buf);
        if !buf.is_empty() {
            if let Some(len) = (self.check)(&buf[..])? {
                if len == 0 || len > self.max_packet_size {
                    return Err(AoslError::InvalidArgument(format!(
                        "packet length {len} outside 1..={}",
                        self.max_packet_size
                    )));
                }
                if len <= buf.len() {
                    return Ok(Step::Packet(buf.split_to(len).freeze()));
                }
            }
        }

        let room = self.max_packet_size.saturating_sub(buf.len());
        if room == 0 {
            return Err(AoslError::ResourceExhausted(format!(
                "no packet within {} buffered bytes",
                self.max_packet_size
            )));
        }
        Ok(Step::NeedMore(room.min(self.read_chunk)))
    }

    /// Appends the bytes of a finished read. `Ok(false)` when the read was
    /// released free-only.
    fn append(&self, chunk: &Data, resumed: Resumed<usize>) -> Result<bool> {
        let Resumed::Complete(result) = resumed else {
            return Ok(false);
        };
        let n = result?;
        if n == 0 {
            return Err(AoslError::Io {
                kind: std::io::ErrorKind::UnexpectedEof,
                message: "stream ended inside a packet".to_string(),
            });
        }
        chunk.with(|bytes| lock(&self.buf).extend_from_slice(&bytes[..n.min(bytes.len())]));
        Ok(true)
    }

    /// Delivers the next packet through `resume`, reading as needed.
    ///
    /// Reads that complete inline are consumed by this loop, so the result is
    /// `Ready` whenever the packet was delivered before returning. Only a
    /// deferred read re-enters `pump`, from its completion.
    fn pump(self: Arc<Self>, resume: Resume<Bytes>) -> Result<Outcome> {
        loop {
            let want = match self.next_step() {
                Ok(Step::Packet(packet)) => {
                    resume(Resumed::Complete(Ok(packet)));
                    return Ok(Outcome::Ready);
                },
                Ok(Step::NeedMore(want)) => want,
                Err(err) => {
                    resume(Resumed::Complete(Err(err.clone())));
                    return Err(err);
                },
            };

            let chunk = Data::zeroed(want);
            let read = Arc::new(Mutex::new(ReadState::Issuing(None)));
            let on_read: Resume<usize> = {
                let read = Arc::clone(&read);
                let splitter = Arc::clone(&self);
                let chunk = chunk.clone();
                Box::new(move |resumed: Resumed<usize>| {
                    let mut state = lock(&read);
                    match std::mem::replace(&mut *state, ReadState::Finished) {
                        ReadState::Issuing(_) => *state = ReadState::Issuing(Some(resumed)),
                        ReadState::Deferred(resume) => {
                            drop(state);
                            splitter.continue_after(&chunk, resumed, resume);
                        },
                        ReadState::Finished => {},
                    }
                })
            };

            let issued = super::read(self.fd, BufRegion::whole(chunk.clone()), None, Some(on_read));
            let resumed = {
                let mut state = lock(&read);
                match std::mem::replace(&mut *state, ReadState::Finished) {
                    ReadState::Issuing(Some(resumed)) => resumed,
                    ReadState::Issuing(None) => match issued {
                        Ok(_) => {
                            *state = ReadState::Deferred(resume);
                            return Ok(Outcome::Pending);
                        },
                        Err(err) => {
                            drop(state);
                            resume(Resumed::Complete(Err(err.clone())));
                            return Err(err);
                        },
                    },
                    ReadState::Deferred(_) | ReadState::Finished => return issued,
                }
            };

            match self.append(&chunk, resumed) {
                Ok(true) => {},
                Ok(false) => {
                    resume(Resumed::FreeOnly);
                    return Err(AoslError::BadDescriptor(self.fd.to_string()));
                },
                Err(err) => {
                    resume(Resumed::Complete(Err(err.clone())));
                    return Err(err);
                },
            }
        }
    }

    /// Picks the packet read back up once a deferred read completes.
    fn continue_after(self: Arc<Self>, chunk: &Data, resumed: Resumed<usize>, resume: Resume<Bytes>) {
        match self.append(chunk, resumed) {
            Ok(true) => {
                let fd = self.fd;
                if let Err(err) = self.pump(resume) {
                    tracing::debug!(fd = %fd, error = %err, "packet read failed after deferred read");
                }
            },
            Ok(false) => resume(Resumed::FreeOnly),
            Err(err) => resume(Resumed::Complete(Err(err))),
        }
    }
}

/// Progress of one read issued by [`Splitter::pump`].
enum ReadState {
    /// `read` has not returned yet; an inline completion parks its result here.
    Issuing(Option<Resumed<usize>>),
    /// `read` went deferred; the completion continues the packet read.
    Deferred(Resume<Bytes>),
    Finished,
}

/// Reads whole packets from a stream descriptor.
///
/// One read may be outstanding at a time. Bytes past the end of a packet stay
/// buffered for the next [`PacketSplitter::read_packet`].
pub struct PacketSplitter {
    inner: Arc<Splitter>,
}

impl PacketSplitter {
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero `max_packet_size`.
    pub fn new<F>(fd: CoFd, max_packet_size: usize, check: F) -> Result<Self>
    where
        F: Fn(&[u8]) -> Result<Option<usize>> + Send + Sync + 'static,
    {
        if max_packet_size == 0 {
            return record(Err(AoslError::InvalidArgument("max packet size must be non-zero".to_string())));
        }
        Ok(Self {
            inner: Arc::new(Splitter {
                fd,
                check: Box::new(check),
                max_packet_size,
                read_chunk: DEFAULT_SPLITTER_READ_CHUNK,
                buf: Mutex::new(BytesMut::new()),
                reading: AtomicBool::new(false),
            }),
        })
    }

    /// A splitter limited to the configured `packet.max_packet_size`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configured limit is zero.
    pub fn with_configured_limit<F>(fd: CoFd, check: F) -> Result<Self>
    where
        F: Fn(&[u8]) -> Result<Option<usize>> + Send + Sync + 'static,
    {
        let max = runtime::try_current().map_or(DEFAULT_MAX_PACKET_SIZE, |rt| rt.config().packet.max_packet_size);
        Self::new(fd, max, check)
    }

    /// Overrides how many bytes one read asks for.
    #[must_use]
    pub fn with_read_chunk(self, read_chunk: usize) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut splitter) => {
                splitter.read_chunk = read_chunk.max(1);
                Arc::new(splitter)
            },
            Err(shared) => shared,
        };
        Self { inner }
    }

    /// Delivers the next packet to `resume` with the tri-state contract of
    /// the coroutine I/O layer.
    ///
    /// # Errors
    ///
    /// `Busy` while another read is outstanding; check failures, oversize
    /// packets and read errors otherwise.
    pub fn read_packet(&self, resume: Resume<Bytes>) -> Result<Outcome> {
        if self.inner.reading.swap(true, Ordering::AcqRel) {
            let err = AoslError::Busy("packet read already outstanding".to_string());
            resume(Resumed::Complete(Err(err.clone())));
            return record(Err(err));
        }

        let splitter = Arc::clone(&self.inner);
        let finish: Resume<Bytes> = Box::new(move |resumed| {
            splitter.reading.store(false, Ordering::Release);
            resume(resumed);
        });
        record(Arc::clone(&self.inner).pump(finish))
    }

    /// Bytes buffered beyond the packets delivered so far.
    pub fn buffered(&self) -> usize {
        lock(&self.inner.buf).len()
    }

    pub fn fd(&self) -> CoFd {
        self.inner.fd
    }
}
