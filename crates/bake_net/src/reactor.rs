//! Readiness plumbing shared by client and server loops.
//!
//! Every loop owns one [`mio::Poll`]. Sockets are registered for readable
//! interest under a per-connection [`Token`]; writable interest is added
//! only while a connection's write queue holds data. Writers on other
//! threads wake the loop through the [`Waker`] attached to each queue.

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::PrefixLengthCodec;
use crate::handler::{ConnectionId, NetworkHandler};
use crate::socket::Socket;

/// Upper bound on a single readiness wait; the stop flag is checked at
/// least this often.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Read buffer size per loop iteration.
pub const READ_CHUNK: usize = 64 * 1024;

/// Readiness events collected per wait.
pub const EVENT_CAPACITY: usize = 256;

/// Token reserved for cross-thread wake-ups.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpStatus {
  /// Nothing was read or written.
  Idle,
  /// Bytes moved in either direction.
  Active,
  /// The connection is gone and must be removed.
  Closed,
}

/// Cancellation flag observed by a loop at the top of every iteration.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
  pub fn stop(&self) {
    self.0.store(true, Ordering::Release);
  }

  pub fn is_stopped(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }

  pub(crate) fn reset(&self) {
    self.0.store(false, Ordering::Release);
  }
}

/// A fresh poll instance and the waker writers use to interrupt it.
pub fn new_poll() -> io::Result<(Poll, Arc<Waker>)> {
  let poll = Poll::new()?;
  let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
  Ok((poll, waker))
}

/// Block for at most [`POLL_INTERVAL`]. An interrupted wait counts as an
/// empty one.
pub fn wait(poll: &mut Poll, events: &mut Events) -> io::Result<()> {
  match poll.poll(events, Some(POLL_INTERVAL)) {
    Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
    other => other,
  }
}

/// One connection driven by a loop: its socket and its own codec.
pub struct Connection {
  pub id: ConnectionId,
  pub socket: Socket,
  pub codec: PrefixLengthCodec,
  writable: bool,
}

impl Connection {
  pub fn new(id: ConnectionId, socket: Socket, max_frame_len: usize) -> Self {
    Self {
      id,
      socket,
      codec: PrefixLengthCodec::with_max_frame_len(max_frame_len),
      writable: false,
    }
  }

  pub fn token(&self) -> Token {
    Token(self.id.0 as usize)
  }

  /// Interest matching the current write queue.
  pub fn interest(&self) -> Interest {
    if self.writable {
      Interest::READABLE | Interest::WRITABLE
    } else {
      Interest::READABLE
    }
  }

  /// Register with `registry` and route queue wake-ups to `waker`.
  pub fn register(&mut self, registry: &Registry, waker: &Arc<Waker>) -> io::Result<()> {
    self.socket.queue().attach(Arc::clone(waker));
    self.writable = self.socket.has_pending();
    let (token, interest) = (self.token(), self.interest());
    self.socket.register(registry, token, interest)
  }

  pub fn deregister(&mut self, registry: &Registry) {
    if let Err(err) = self.socket.deregister(registry) {
      tracing::debug!(conn = self.id.0, %err, "deregister failed");
    }
  }

  /// Read every available byte into the codec.
  pub fn read_ready(&mut self, handler: &dyn NetworkHandler, buf: &mut [u8]) -> PumpStatus {
    let mut status = PumpStatus::Idle;
    // Datagram sockets have no connection to lose.
    let datagram = self.socket.is_datagram();

    loop {
      match self.socket.read(buf) {
        Ok(0) if datagram => continue,
        Ok(0) => return PumpStatus::Closed,
        Ok(n) => {
          status = PumpStatus::Active;
          let id = self.id;
          let fed = self.codec.feed(&buf[..n], |message| handler.on_message(id, message));
          if datagram {
            // Each datagram carries whole frames; never carry state across.
            if let Err(err) = fed {
              tracing::warn!(conn = id.0, %err, "dropping malformed datagram");
            }
            self.codec.reset();
          } else if let Err(err) = fed {
            tracing::warn!(conn = id.0, %err, "closing connection after framing error");
            return PumpStatus::Closed;
          }
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) if datagram => {
          tracing::debug!(conn = self.id.0, %err, "datagram receive failed");
          break;
        }
        Err(err) => {
          tracing::debug!(conn = self.id.0, %err, "read failed");
          return PumpStatus::Closed;
        }
      }
    }

    status
  }

  /// Drain the write queue, honour a pending close request and keep
  /// writable interest only while blocks remain queued.
  pub fn write_ready(&mut self, registry: &Registry) -> PumpStatus {
    let datagram = self.socket.is_datagram();
    let mut status = PumpStatus::Idle;

    if self.socket.has_pending() {
      match self.socket.flush() {
        Ok(0) => {}
        Ok(_) => status = PumpStatus::Active,
        Err(err) if datagram => {
          tracing::warn!(conn = self.id.0, %err, "datagram send failed");
        }
        Err(err) => {
          tracing::debug!(conn = self.id.0, %err, "write failed");
          return PumpStatus::Closed;
        }
      }
    }

    if !datagram && self.socket.queue().close_requested() {
      self.socket.shutdown();
      return PumpStatus::Closed;
    }

    let writable = self.socket.has_pending();
    if writable != self.writable {
      self.writable = writable;
      let (token, interest) = (self.token(), self.interest());
      if let Err(err) = self.socket.reregister(registry, token, interest) {
        tracing::debug!(conn = self.id.0, %err, "reregister failed");
        if !datagram {
          return PumpStatus::Closed;
        }
      }
    }

    status
  }
}
