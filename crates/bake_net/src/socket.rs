//! Thin wrapper over an OS socket with a non-blocking write queue.
//!
//! [`Socket::write`] (or [`WriteQueue::push`] from another thread) only
//! copies the buffer into a FIFO of pending blocks and wakes the owning
//! loop. The loop calls [`Socket::flush`] when the socket is writable, which
//! transmits blocks in order and keeps exactly the unsent remainder.

use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token, Waker};
use socket2::{Domain, Protocol, Type};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{NetError, Result};

/// Transport flavour of a [`Socket`].
#[derive(Debug)]
pub enum SocketKind {
  /// Connected stream.
  Tcp(TcpStream),
  /// Datagram socket; writes go to `target` (usually a broadcast address).
  Udp { socket: UdpSocket, target: Option<SocketAddr> },
}

/// Write side of a [`Socket`], shared with any thread that sends on it.
#[derive(Debug, Default)]
pub struct WriteQueue {
  pending: Mutex<VecDeque<Vec<u8>>>,
  waker: Mutex<Option<Arc<Waker>>>,
  close_requested: AtomicBool,
}

impl WriteQueue {
  /// Queue a copy of `buf` and wake the owning loop. Never blocks on the
  /// network.
  pub fn push(&self, buf: &[u8]) {
    if buf.is_empty() {
      return;
    }
    self.lock_pending().push_back(buf.to_vec());
    self.wake();
  }

  pub fn has_pending(&self) -> bool {
    !self.lock_pending().is_empty()
  }

  /// Bytes still waiting in the queue.
  pub fn pending_bytes(&self) -> usize {
    self.lock_pending().iter().map(Vec::len).sum()
  }

  /// Ask the owning loop to close the connection after draining the queue.
  pub fn request_close(&self) {
    self.close_requested.store(true, Ordering::Release);
    self.wake();
  }

  pub fn close_requested(&self) -> bool {
    self.close_requested.load(Ordering::Acquire)
  }

  /// Route wake-ups to the loop that currently owns the socket.
  pub(crate) fn attach(&self, waker: Arc<Waker>) {
    *self.waker.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(waker);
  }

  fn wake(&self) {
    let waker = self.waker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(waker) = waker.as_ref() {
      if let Err(err) = waker.wake() {
        tracing::debug!(%err, "failed to wake socket loop");
      }
    }
  }

  fn lock_pending(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
    self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Non-blocking socket owned by exactly one loop.
#[derive(Debug)]
pub struct Socket {
  kind: SocketKind,
  queue: Arc<WriteQueue>,
}

impl Socket {
  /// Wrap a connected stream.
  pub fn from_stream(stream: std::net::TcpStream) -> Result<Self> {
    stream.set_nonblocking(true)?;
    Self::from_accepted(TcpStream::from_std(stream))
  }

  pub(crate) fn from_accepted(stream: TcpStream) -> Result<Self> {
    stream.set_nodelay(true)?;
    Ok(Self::new(SocketKind::Tcp(stream)))
  }

  /// Connect a stream socket. The connect itself blocks so that a refused
  /// connection is reported here.
  pub fn connect(addr: SocketAddr) -> Result<Self> {
    let stream = std::net::TcpStream::connect(addr)?;
    Self::from_stream(stream)
  }

  /// Datagram socket bound to `bind` with address reuse and broadcast
  /// permission enabled. Writes are sent to `target` when set.
  pub fn udp(bind: SocketAddr, target: Option<SocketAddr>) -> Result<Self> {
    let raw = socket2::Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    raw.set_reuse_address(true)?;
    raw.set_broadcast(true)?;
    raw.set_nonblocking(true)?;
    raw.bind(&bind.into())?;
    let socket = UdpSocket::from_std(raw.into());
    Ok(Self::new(SocketKind::Udp { socket, target }))
  }

  fn new(kind: SocketKind) -> Self {
    Self {
      kind,
      queue: Arc::new(WriteQueue::default()),
    }
  }

  pub fn kind(&self) -> &SocketKind {
    &self.kind
  }

  pub fn is_datagram(&self) -> bool {
    matches!(self.kind, SocketKind::Udp { .. })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    let addr = match &self.kind {
      SocketKind::Tcp(stream) => stream.local_addr()?,
      SocketKind::Udp { socket, .. } => socket.local_addr()?,
    };
    Ok(addr)
  }

  pub fn peer_addr(&self) -> Option<SocketAddr> {
    match &self.kind {
      SocketKind::Tcp(stream) => stream.peer_addr().ok(),
      SocketKind::Udp { target, .. } => *target,
    }
  }

  /// Handle for queueing writes from other threads.
  pub fn queue(&self) -> &Arc<WriteQueue> {
    &self.queue
  }

  pub fn write(&self, buf: &[u8]) {
    self.queue.push(buf);
  }

  /// Read whatever is available. For datagram sockets one call returns one
  /// datagram.
  pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
    match &self.kind {
      SocketKind::Tcp(stream) => (&*stream).read(buf),
      SocketKind::Udp { socket, .. } => socket.recv_from(buf).map(|(n, _)| n),
    }
  }

  pub fn has_pending(&self) -> bool {
    self.queue.has_pending()
  }

  pub fn pending_bytes(&self) -> usize {
    self.queue.pending_bytes()
  }

  /// Transmit queued blocks in order.
  ///
  /// Returns the number of bytes handed to the kernel. A full send buffer
  /// leaves the rest queued until the socket reports writable again. Any
  /// other failure discards every pending block.
  pub fn flush(&self) -> Result<usize> {
    let mut pending = self.queue.lock_pending();
    let mut sent = 0;

    while let Some(block) = pending.front_mut() {
      match self.send_block(block) {
        Ok(0) => {
          pending.clear();
          return Err(NetError::Closed);
        }
        Ok(n) if n < block.len() => {
          block.drain(..n);
          sent += n;
        }
        Ok(n) => {
          sent += n;
          pending.pop_front();
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(sent),
        Err(err) => {
          let dropped = pending.len();
          pending.clear();
          tracing::warn!(%err, dropped, "send failed, discarding queued blocks");
          return Err(err.into());
        }
      }
    }

    Ok(sent)
  }

  fn send_block(&self, block: &[u8]) -> io::Result<usize> {
    match &self.kind {
      SocketKind::Tcp(stream) => (&*stream).write(block),
      SocketKind::Udp { socket, target } => match target {
        Some(target) => socket.send_to(block, *target),
        None => Err(io::Error::new(
          io::ErrorKind::NotConnected,
          "datagram socket has no target",
        )),
      },
    }
  }

  pub fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
    match &mut self.kind {
      SocketKind::Tcp(stream) => registry.register(stream, token, interest),
      SocketKind::Udp { socket, .. } => registry.register(socket, token, interest),
    }
  }

  pub fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
    match &mut self.kind {
      SocketKind::Tcp(stream) => registry.reregister(stream, token, interest),
      SocketKind::Udp { socket, .. } => registry.reregister(socket, token, interest),
    }
  }

  pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
    match &mut self.kind {
      SocketKind::Tcp(stream) => registry.deregister(stream),
      SocketKind::Udp { socket, .. } => registry.deregister(socket),
    }
  }

  pub fn shutdown(&self) {
    if let SocketKind::Tcp(stream) = &self.kind {
      let _ = stream.shutdown(std::net::Shutdown::Both);
    }
  }
}

/// Listening stream socket with address reuse.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
  let raw = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
  raw.set_reuse_address(true)?;
  raw.bind(&addr.into())?;
  raw.listen(128)?;
  raw.set_nonblocking(true)?;
  Ok(raw.into())
}

#[cfg(test)]
#[path = "socket_test.rs"]
mod socket_test;
