//! Single-connection client with its own polling loop.

use mio::{Events, Poll, Waker};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::codec::{send_frame, PrefixLengthCodec, DEFAULT_MAX_FRAME_LEN};
use crate::context::NetworkContext;
use crate::error::{NetError, Result};
use crate::handler::{ConnectionId, NetworkHandler};
use crate::reactor::{self, Connection, PumpStatus, StopHandle, EVENT_CAPACITY, READ_CHUNK};
use crate::socket::{Socket, WriteQueue};

const FINAL_FLUSH_ATTEMPTS: usize = 10;

pub struct SocketClient {
  id: ConnectionId,
  /// Present while no loop owns the connection.
  conn: Option<Connection>,
  queue: Arc<WriteQueue>,
  local_addr: SocketAddr,
  handler: Arc<dyn NetworkHandler>,
  max_frame_len: usize,
  connected: Arc<AtomicBool>,
  stop: StopHandle,
  thread: Option<JoinHandle<Connection>>,
}

impl SocketClient {
  /// Connect a stream to `addr`.
  pub fn connect(ctx: &Arc<NetworkContext>, addr: SocketAddr, handler: Arc<dyn NetworkHandler>) -> Result<Self> {
    let socket = Socket::connect(addr)?;
    Self::new(ctx, socket, handler)
  }

  /// Datagram sender targeting `target`, usually a broadcast address.
  pub fn broadcast(ctx: &Arc<NetworkContext>, target: SocketAddr, handler: Arc<dyn NetworkHandler>) -> Result<Self> {
    let socket = Socket::udp((Ipv4Addr::UNSPECIFIED, 0).into(), Some(target))?;
    Self::new(ctx, socket, handler)
  }

  fn new(ctx: &Arc<NetworkContext>, socket: Socket, handler: Arc<dyn NetworkHandler>) -> Result<Self> {
    let id = ctx.next_connection_id();
    let local_addr = socket.local_addr()?;
    let queue = Arc::clone(socket.queue());
    Ok(Self {
      id,
      conn: Some(Connection::new(id, socket, DEFAULT_MAX_FRAME_LEN)),
      queue,
      local_addr,
      handler,
      max_frame_len: DEFAULT_MAX_FRAME_LEN,
      connected: Arc::new(AtomicBool::new(true)),
      stop: StopHandle::default(),
      thread: None,
    })
  }

  pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
    self.max_frame_len = max_frame_len;
    if let Some(conn) = self.conn.as_mut() {
      conn.codec = PrefixLengthCodec::with_max_frame_len(max_frame_len);
    }
    self
  }

  pub fn id(&self) -> ConnectionId {
    self.id
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn is_connected(&self) -> bool {
    self.connected.load(Ordering::Acquire)
  }

  pub fn stop_handle(&self) -> StopHandle {
    self.stop.clone()
  }

  /// Spawn the loop thread.
  pub fn start(&mut self) -> Result<()> {
    if self.conn.is_none() {
      return Err(NetError::AlreadyRunning("client"));
    }
    let (poll, waker) = reactor::new_poll()?;
    let conn = self.conn.take().ok_or(NetError::AlreadyRunning("client"))?;
    self.stop.reset();

    let handler = Arc::clone(&self.handler);
    let connected = Arc::clone(&self.connected);
    let stop = self.stop.clone();
    let thread = std::thread::Builder::new()
      .name(format!("bake-net-client-{}", self.id.0))
      .spawn(move || run_loop(conn, poll, &waker, handler.as_ref(), &connected, &stop))?;

    self.thread = Some(thread);
    Ok(())
  }

  /// Run the loop on the calling thread until the stop handle fires or the
  /// peer disconnects.
  pub fn run(&mut self) -> Result<()> {
    if self.conn.is_none() {
      return Err(NetError::AlreadyRunning("client"));
    }
    let (poll, waker) = reactor::new_poll()?;
    let conn = self.conn.take().ok_or(NetError::AlreadyRunning("client"))?;
    let conn = run_loop(conn, poll, &waker, self.handler.as_ref(), &self.connected, &self.stop);
    self.conn = Some(conn);
    Ok(())
  }

  /// Signal the loop, flush what is queued and wait for the thread.
  pub fn stop(&mut self) {
    self.stop.stop();
    if let Some(thread) = self.thread.take() {
      match thread.join() {
        Ok(conn) => self.conn = Some(conn),
        Err(_) => tracing::error!(conn = self.id.0, "client loop panicked"),
      }
    }
  }

  pub fn sender(&self) -> FrameSender {
    FrameSender {
      queue: Arc::clone(&self.queue),
      max_frame_len: self.max_frame_len,
    }
  }

  /// Queue a framed message.
  pub fn send(&self, payload: &[u8]) -> Result<()> {
    if !self.is_connected() {
      return Err(NetError::Closed);
    }
    send_frame(&self.queue, payload, self.max_frame_len)
  }
}

/// Cloneable handle that queues frames on a client's socket from any thread.
#[derive(Clone)]
pub struct FrameSender {
  queue: Arc<WriteQueue>,
  max_frame_len: usize,
}

impl FrameSender {
  pub fn send(&self, payload: &[u8]) -> Result<()> {
    send_frame(&self.queue, payload, self.max_frame_len)
  }
}

impl Drop for SocketClient {
  fn drop(&mut self) {
    self.stop();
    if let Some(conn) = &self.conn {
      conn.socket.shutdown();
    }
  }
}

fn run_loop(
  mut conn: Connection,
  mut poll: Poll,
  waker: &Arc<Waker>,
  handler: &dyn NetworkHandler,
  connected: &AtomicBool,
  stop: &StopHandle,
) -> Connection {
  let mut buf = vec![0u8; READ_CHUNK];
  let mut events = Events::with_capacity(EVENT_CAPACITY);

  if let Err(err) = conn.register(poll.registry(), waker) {
    tracing::error!(conn = conn.id.0, %err, "failed to register client socket");
    return conn;
  }
  handler.on_connect(conn.id);

  // Bytes may have arrived before registration.
  let mut status = conn.read_ready(handler, &mut buf);
  while !stop.is_stopped() && status != PumpStatus::Closed {
    if let Err(err) = reactor::wait(&mut poll, &mut events) {
      tracing::error!(conn = conn.id.0, %err, "readiness wait failed");
      break;
    }
    let token = conn.token();
    if events.iter().any(|event| event.token() == token) {
      status = conn.read_ready(handler, &mut buf);
    }
    if status != PumpStatus::Closed {
      status = conn.write_ready(poll.registry());
    }
  }

  if status == PumpStatus::Closed {
    tracing::debug!(conn = conn.id.0, "peer closed connection");
    connected.store(false, Ordering::Release);
    conn.deregister(poll.registry());
    handler.on_disconnect(conn.id);
    return conn;
  }

  // Leave nothing queued behind on a clean stop.
  for _ in 0..FINAL_FLUSH_ATTEMPTS {
    if !conn.socket.has_pending() {
      break;
    }
    if let Err(err) = conn.socket.flush() {
      tracing::debug!(conn = conn.id.0, %err, "final flush failed");
      break;
    }
    if conn.socket.has_pending() {
      let _ = reactor::wait(&mut poll, &mut events);
    }
  }
  conn.deregister(poll.registry());
  conn
}

#[cfg(test)]
#[path = "client_test.rs"]
mod client_test;
