//! Accepting server that fans out over many framed connections.

use mio::net::TcpListener;
use mio::{Events, Interest, Registry, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::codec::{send_frame, DEFAULT_MAX_FRAME_LEN};
use crate::context::NetworkContext;
use crate::error::{NetError, Result};
use crate::handler::{ConnectionId, NetworkHandler};
use crate::reactor::{self, Connection, PumpStatus, StopHandle, EVENT_CAPACITY, READ_CHUNK, WAKE_TOKEN};
use crate::socket::{bind_listener, Socket, WriteQueue};

const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

enum Listener {
  /// Connection-oriented: accept new streams when the listener is readable.
  Stream(TcpListener),
  /// Broadcast: every datagram belongs to one logical peer.
  Broadcast(Socket),
}

/// Listener as registered with a running loop.
enum Source {
  Stream(TcpListener),
  Broadcast(Connection),
}

struct ServerShared {
  ctx: Arc<NetworkContext>,
  connections: Mutex<HashMap<ConnectionId, Arc<WriteQueue>>>,
  max_frame_len: usize,
}

impl ServerShared {
  fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<WriteQueue>>> {
    self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Owns one polling loop serving every accepted connection.
pub struct SocketServer {
  shared: Arc<ServerShared>,
  handler: Arc<dyn NetworkHandler>,
  listener: Option<Listener>,
  local_addr: SocketAddr,
  stop: StopHandle,
  thread: Option<JoinHandle<Listener>>,
}

impl SocketServer {
  /// Bind a stream listener. Nothing is accepted until [`start`](Self::start).
  pub fn bind(ctx: &Arc<NetworkContext>, addr: SocketAddr, handler: Arc<dyn NetworkHandler>) -> Result<Self> {
    let listener = bind_listener(addr)?;
    let local_addr = listener.local_addr()?;
    Ok(Self::new(ctx, Listener::Stream(TcpListener::from_std(listener)), local_addr, handler))
  }

  /// Bind a datagram listener (address reuse and broadcast enabled).
  pub fn bind_broadcast(
    ctx: &Arc<NetworkContext>,
    addr: SocketAddr,
    handler: Arc<dyn NetworkHandler>,
  ) -> Result<Self> {
    let socket = Socket::udp(addr, None)?;
    let local_addr = socket.local_addr()?;
    Ok(Self::new(ctx, Listener::Broadcast(socket), local_addr, handler))
  }

  fn new(
    ctx: &Arc<NetworkContext>,
    listener: Listener,
    local_addr: SocketAddr,
    handler: Arc<dyn NetworkHandler>,
  ) -> Self {
    Self {
      shared: Arc::new(ServerShared {
        ctx: Arc::clone(ctx),
        connections: Mutex::new(HashMap::new()),
        max_frame_len: DEFAULT_MAX_FRAME_LEN,
      }),
      handler,
      listener: Some(listener),
      local_addr,
      stop: StopHandle::default(),
      thread: None,
    }
  }

  /// Limit the size of a single inbound or outbound message.
  pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
    if let Some(shared) = Arc::get_mut(&mut self.shared) {
      shared.max_frame_len = max_frame_len;
    }
    self
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn stop_handle(&self) -> StopHandle {
    self.stop.clone()
  }

  pub fn is_running(&self) -> bool {
    self.thread.is_some()
  }

  /// Spawn the loop thread.
  pub fn start(&mut self) -> Result<()> {
    if self.listener.is_none() {
      return Err(NetError::AlreadyRunning("server"));
    }
    let (poll, waker) = reactor::new_poll()?;
    let listener = self.listener.take().ok_or(NetError::AlreadyRunning("server"))?;
    self.stop.reset();

    let shared = Arc::clone(&self.shared);
    let handler = Arc::clone(&self.handler);
    let stop = self.stop.clone();
    let thread = std::thread::Builder::new()
      .name(format!("bake-net-server-{}", self.local_addr.port()))
      .spawn(move || run_loop(&shared, listener, poll, &waker, handler.as_ref(), &stop))?;

    self.thread = Some(thread);
    Ok(())
  }

  /// Run the loop on the calling thread until the stop handle fires.
  pub fn run(&mut self) -> Result<()> {
    if self.listener.is_none() {
      return Err(NetError::AlreadyRunning("server"));
    }
    let (poll, waker) = reactor::new_poll()?;
    let listener = self.listener.take().ok_or(NetError::AlreadyRunning("server"))?;
    let listener = run_loop(&self.shared, listener, poll, &waker, self.handler.as_ref(), &self.stop);
    self.listener = Some(listener);
    Ok(())
  }

  /// Signal the loop and wait for it to exit. The server can be started again.
  pub fn stop(&mut self) {
    self.stop.stop();
    if let Some(thread) = self.thread.take() {
      match thread.join() {
        Ok(listener) => self.listener = Some(listener),
        Err(_) => tracing::error!(addr = %self.local_addr, "server loop panicked"),
      }
    }
  }

  /// Queue a framed message for one connection.
  pub fn send(&self, conn: ConnectionId, payload: &[u8]) -> Result<()> {
    let queue = self
      .shared
      .connections()
      .get(&conn)
      .cloned()
      .ok_or(NetError::UnknownConnection(conn))?;
    send_frame(&queue, payload, self.shared.max_frame_len)
  }

  /// Queue a framed message for every open connection.
  pub fn send_all(&self, payload: &[u8]) -> Result<()> {
    let queues: Vec<_> = self.shared.connections().values().cloned().collect();
    for queue in queues {
      send_frame(&queue, payload, self.shared.max_frame_len)?;
    }
    Ok(())
  }

  /// Close one connection once its queue drains; the loop reports the
  /// disconnect.
  pub fn disconnect(&self, conn: ConnectionId) {
    if let Some(queue) = self.shared.connections().get(&conn) {
      queue.request_close();
    }
  }

  pub fn connection_count(&self) -> usize {
    self.shared.connections().len()
  }
}

impl Drop for SocketServer {
  fn drop(&mut self) {
    self.stop();
  }
}

fn run_loop(
  shared: &ServerShared,
  listener: Listener,
  mut poll: mio::Poll,
  waker: &Arc<Waker>,
  handler: &dyn NetworkHandler,
  stop: &StopHandle,
) -> Listener {
  let mut buf = vec![0u8; READ_CHUNK];
  let mut events = Events::with_capacity(EVENT_CAPACITY);
  let mut conns: HashMap<Token, Connection> = HashMap::new();
  let mut closed: Vec<Token> = Vec::new();

  let mut source = match listener {
    Listener::Stream(mut tcp) => {
      if let Err(err) = poll.registry().register(&mut tcp, LISTENER_TOKEN, Interest::READABLE) {
        tracing::error!(%err, "failed to register listener");
        return Listener::Stream(tcp);
      }
      Source::Stream(tcp)
    }
    Listener::Broadcast(socket) => {
      let mut conn = Connection::new(shared.ctx.next_connection_id(), socket, shared.max_frame_len);
      if let Err(err) = conn.register(poll.registry(), waker) {
        tracing::error!(%err, "failed to register broadcast socket");
        return Listener::Broadcast(conn.socket);
      }
      shared.connections().insert(conn.id, Arc::clone(conn.socket.queue()));
      Source::Broadcast(conn)
    }
  };

  while !stop.is_stopped() {
    if let Err(err) = reactor::wait(&mut poll, &mut events) {
      tracing::error!(%err, "readiness wait failed");
      break;
    }
    let registry = poll.registry();

    for event in events.iter() {
      let token = event.token();
      if token == WAKE_TOKEN {
        continue;
      }
      match &mut source {
        Source::Stream(tcp) if token == LISTENER_TOKEN => {
          accept_pending(shared, tcp, registry, waker, handler, &mut conns);
        }
        Source::Broadcast(conn) if token == conn.token() => {
          conn.read_ready(handler, &mut buf);
        }
        _ => {
          if let Some(conn) = conns.get_mut(&token) {
            if conn.read_ready(handler, &mut buf) == PumpStatus::Closed {
              closed.push(token);
            }
          }
        }
      }
    }

    for (token, conn) in conns.iter_mut() {
      if conn.write_ready(registry) == PumpStatus::Closed {
        closed.push(*token);
      }
    }
    if let Source::Broadcast(conn) = &mut source {
      conn.write_ready(registry);
    }

    for token in closed.drain(..) {
      if let Some(mut conn) = conns.remove(&token) {
        shared.connections().remove(&conn.id);
        conn.deregister(registry);
        handler.on_disconnect(conn.id);
      }
    }
  }

  let registry = poll.registry();
  for (_, mut conn) in conns.drain() {
    if conn.socket.has_pending() {
      let _ = conn.socket.flush();
    }
    conn.socket.shutdown();
    conn.deregister(registry);
    handler.on_disconnect(conn.id);
  }
  shared.connections().clear();

  match source {
    Source::Stream(mut tcp) => {
      if let Err(err) = registry.deregister(&mut tcp) {
        tracing::debug!(%err, "listener deregister failed");
      }
      Listener::Stream(tcp)
    }
    Source::Broadcast(mut conn) => {
      if conn.socket.has_pending() {
        let _ = conn.socket.flush();
      }
      conn.deregister(registry);
      Listener::Broadcast(conn.socket)
    }
  }
}

fn accept_pending(
  shared: &ServerShared,
  listener: &TcpListener,
  registry: &Registry,
  waker: &Arc<Waker>,
  handler: &dyn NetworkHandler,
  conns: &mut HashMap<Token, Connection>,
) {
  loop {
    match listener.accept() {
      Ok((stream, addr)) => {
        let socket = match Socket::from_accepted(stream) {
          Ok(socket) => socket,
          Err(err) => {
            tracing::warn!(%addr, %err, "failed to configure accepted stream");
            continue;
          }
        };
        let mut conn = Connection::new(shared.ctx.next_connection_id(), socket, shared.max_frame_len);
        if let Err(err) = conn.register(registry, waker) {
          tracing::warn!(%addr, %err, "failed to register accepted stream");
          continue;
        }
        tracing::debug!(conn = conn.id.0, %addr, "accepted connection");

        shared.connections().insert(conn.id, Arc::clone(conn.socket.queue()));
        handler.on_connect(conn.id);
        conns.insert(conn.token(), conn);
      }
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => {
        tracing::warn!(%err, "accept failed");
        break;
      }
    }
  }
}

#[cfg(test)]
#[path = "server_test.rs"]
mod server_test;
