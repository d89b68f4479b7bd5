// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Socket collaborators backed by tokio.
//!
//! Sockets are registered with the I/O runtime's reactor. Non-blocking
//! attempts (`try_read`, `try_send_to`, ...) serve the inline path; the
//! deferred path waits for readiness on the I/O runtime and retries.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use aosl_core::helpers::lock;
use aosl_core::{AoslError, BufRegion, Result, Slot};
use futures::FutureExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::{attach, spawn_io, would_block, Accepted, CoDevice, CoFd, CoOp, Completion, Extra};
use crate::runtime;

fn not_connected() -> AoslError {
    AoslError::Io { kind: std::io::ErrorKind::NotConnected, message: "socket is not connected".to_string() }
}

/// A TCP stream, either accepted or created unconnected for [`super::connect`].
pub struct CoTcpStream {
    socket: Mutex<Option<TcpSocket>>,
    stream: OnceLock<TcpStream>,
}

impl CoTcpStream {
    /// An unconnected stream socket for the address family of `peer`.
    ///
    /// # Errors
    ///
    /// Returns the socket creation error.
    pub fn new_for(peer: SocketAddr) -> Result<CoFd> {
        let rt = runtime::get()?;
        let _enter = rt.io_handle().enter();
        let socket = if peer.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        attach(Self { socket: Mutex::new(Some(socket)), stream: OnceLock::new() })
    }

    /// Wraps an already connected stream.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when the object table is full.
    pub fn from_stream(stream: TcpStream) -> Result<CoFd> {
        let connected = OnceLock::new();
        let _ = connected.set(stream);
        attach(Self { socket: Mutex::new(None), stream: connected })
    }

    fn connected(&self) -> Result<&TcpStream> {
        self.stream.get().ok_or_else(not_connected)
    }

    fn try_read_into(stream: &TcpStream, buf: &BufRegion) -> Result<Option<usize>> {
        would_block(buf.with_slice_mut(|bytes| stream.try_read(bytes))?)
    }

    fn try_write_from(stream: &TcpStream, buf: &BufRegion) -> Result<Option<usize>> {
        would_block(buf.with_slice(|bytes| stream.try_write(bytes))?)
    }

    async fn run(&self, op: CoOp) -> Result<usize> {
        match op {
            CoOp::Connect { addr, timeout } => {
                let socket = lock(&self.socket)
                    .take()
                    .ok_or_else(|| AoslError::Busy("socket already connecting or connected".to_string()))?;
                let stream = match timeout {
                    Some(limit) => tokio::time::timeout(limit, socket.connect(addr))
                        .await
                        .map_err(|_| AoslError::TimedOut)??,
                    None => socket.connect(addr).await?,
                };
                tracing::debug!(peer = %addr, "tcp connected");
                self.stream
                    .set(stream)
                    .map_err(|_| AoslError::AlreadyExists("socket already connected".to_string()))?;
                Ok(0)
            },
            CoOp::Read { buf } | CoOp::Recv { buf, .. } => {
                let stream = self.connected()?;
                loop {
                    stream.readable().await?;
                    if let Some(n) = Self::try_read_into(stream, &buf)? {
                        return Ok(n);
                    }
                }
            },
            CoOp::Write { buf } | CoOp::Send { buf, .. } => {
                let stream = self.connected()?;
                loop {
                    stream.writable().await?;
                    if let Some(n) = Self::try_write_from(stream, &buf)? {
                        return Ok(n);
                    }
                }
            },
            other => Err(other.unsupported("tcp stream")),
        }
    }
}

impl CoDevice for CoTcpStream {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn try_io(&self, op: &CoOp) -> Result<Option<usize>> {
        match op {
            CoOp::Connect { .. } => {
                if self.stream.get().is_some() {
                    return Err(AoslError::AlreadyExists("socket already connected".to_string()));
                }
                Ok(None)
            },
            CoOp::Read { buf } | CoOp::Recv { buf, .. } => Self::try_read_into(self.connected()?, buf),
            CoOp::Write { buf } | CoOp::Send { buf, .. } => Self::try_write_from(self.connected()?, buf),
            other => Err(other.unsupported("tcp stream")),
        }
    }

    fn start_io(self: Arc<Self>, op: CoOp, done: Completion, cancel: CancellationToken) {
        spawn_io(cancel, done, async move { self.run(op).await });
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.connected()?.local_addr()?)
    }
}

/// A listening TCP socket.
pub struct CoTcpListener {
    listener: TcpListener,
}

impl CoTcpListener {
    /// Binds and listens on `addr`.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub fn bind(addr: SocketAddr) -> Result<CoFd> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let rt = runtime::get()?;
        let _enter = rt.io_handle().enter();
        let listener = TcpListener::from_std(listener)?;
        tracing::debug!(addr = ?listener.local_addr().ok(), "tcp listening");
        attach(Self { listener })
    }

    fn deliver(conn: &Slot<Accepted>, stream: TcpStream, peer: SocketAddr) -> Result<usize> {
        let fd = CoTcpStream::from_stream(stream)?;
        tracing::debug!(fd = %fd, peer = %peer, "tcp accepted");
        conn.set(Accepted { fd, peer });
        Ok(1)
    }
}

impl CoDevice for CoTcpListener {
    fn kind(&self) -> &'static str {
        "tcp-listener"
    }

    fn try_io(&self, op: &CoOp) -> Result<Option<usize>> {
        let CoOp::Accept { conn } = op else {
            return Err(op.unsupported("tcp listener"));
        };
        match self.listener.accept().now_or_never() {
            Some(accepted) => {
                let (stream, peer) = accepted?;
                Self::deliver(conn, stream, peer).map(Some)
            },
            None => Ok(None),
        }
    }

    fn start_io(self: Arc<Self>, op: CoOp, done: Completion, cancel: CancellationToken) {
        spawn_io(cancel, done, async move {
            let CoOp::Accept { conn } = op else {
                return Err(AoslError::Unsupported("only accept on tcp listener".to_string()));
            };
            let (stream, peer) = self.listener.accept().await?;
            Self::deliver(&conn, stream, peer)
        });
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// A UDP socket. Sends go to `Extra::addr` when given, otherwise to the
/// connected peer; receives report the source in the `Extra` slot.
pub struct CoUdpSocket {
    socket: UdpSocket,
}

impl CoUdpSocket {
    /// # Errors
    ///
    /// Returns the bind error.
    pub fn bind(addr: SocketAddr) -> Result<CoFd> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let rt = runtime::get()?;
        let _enter = rt.io_handle().enter();
        let socket = UdpSocket::from_std(socket)?;
        tracing::debug!(addr = ?socket.local_addr().ok(), "udp bound");
        attach(Self { socket })
    }

    fn try_send(&self, buf: &BufRegion, dest: Option<SocketAddr>) -> Result<Option<usize>> {
        would_block(buf.with_slice(|bytes| match dest {
            Some(dest) => self.socket.try_send_to(bytes, dest),
            None => self.socket.try_send(bytes),
        })?)
    }

    fn try_recv(&self, buf: &BufRegion, extra: Option<&Slot<Extra>>) -> Result<Option<usize>> {
        would_block(buf.with_slice_mut(|bytes| {
            self.socket.try_recv_from(bytes).map(|(n, from)| {
                if let Some(extra) = extra {
                    extra.update(|slot| slot.get_or_insert_with(Extra::default).addr = Some(from));
                }
                n
            })
        })?)
    }

    async fn run(&self, op: CoOp) -> Result<usize> {
        match op {
            CoOp::Connect { addr, .. } => {
                self.socket.connect(addr).await?;
                Ok(0)
            },
            CoOp::Read { buf } => self.recv_loop(&buf, None).await,
            CoOp::Recv { buf, extra } => self.recv_loop(&buf, extra.as_ref()).await,
            CoOp::Write { buf } => self.send_loop(&buf, None).await,
            CoOp::Send { buf, extra } => self.send_loop(&buf, extra.and_then(|extra| extra.addr)).await,
            other => Err(other.unsupported("udp socket")),
        }
    }

    async fn recv_loop(&self, buf: &BufRegion, extra: Option<&Slot<Extra>>) -> Result<usize> {
        loop {
            self.socket.readable().await?;
            if let Some(n) = self.try_recv(buf, extra)? {
                return Ok(n);
            }
        }
    }

    async fn send_loop(&self, buf: &BufRegion, dest: Option<SocketAddr>) -> Result<usize> {
        loop {
            self.socket.writable().await?;
            if let Some(n) = self.try_send(buf, dest)? {
                return Ok(n);
            }
        }
    }
}

impl CoDevice for CoUdpSocket {
    fn kind(&self) -> &'static str {
        "udp"
    }

    fn try_io(&self, op: &CoOp) -> Result<Option<usize>> {
        match op {
            CoOp::Connect { .. } => Ok(None),
            CoOp::Read { buf } => self.try_recv(buf, None),
            CoOp::Recv { buf, extra } => self.try_recv(buf, extra.as_ref()),
            CoOp::Write { buf } => self.try_send(buf, None),
            CoOp::Send { buf, extra } => self.try_send(buf, extra.as_ref().and_then(|extra| extra.addr)),
            other => Err(other.unsupported("udp socket")),
        }
    }

    fn start_io(self: Arc<Self>, op: CoOp, done: Completion, cancel: CancellationToken) {
        spawn_io(cancel, done, async move { self.run(op).await });
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
