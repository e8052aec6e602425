//! Message delivery from polling loops to the application.

use crossbeam_channel::{self as channel, Receiver, Sender};
use std::sync::Arc;

/// Identifies one peer connection for the lifetime of a loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Receives decoded traffic from a [`SocketClient`](crate::SocketClient) or
/// [`SocketServer`](crate::SocketServer).
///
/// Called on the loop thread; implementations must not block.
pub trait NetworkHandler: Send + Sync + 'static {
  fn on_connect(&self, _conn: ConnectionId) {}

  fn on_disconnect(&self, _conn: ConnectionId) {}

  fn on_message(&self, conn: ConnectionId, message: Vec<u8>);
}

/// Events forwarded by [`ChannelHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
  Connected(ConnectionId),
  Disconnected(ConnectionId),
  Message(ConnectionId, Vec<u8>),
}

/// Forwards every callback into an unbounded channel so the application
/// can consume traffic on its own thread.
pub struct ChannelHandler {
  tx: Sender<NetEvent>,
}

impl ChannelHandler {
  pub fn new() -> (Arc<Self>, Receiver<NetEvent>) {
    let (tx, rx) = channel::unbounded();
    (Arc::new(Self { tx }), rx)
  }
}

impl NetworkHandler for ChannelHandler {
  fn on_connect(&self, conn: ConnectionId) {
    let _ = self.tx.send(NetEvent::Connected(conn));
  }

  fn on_disconnect(&self, conn: ConnectionId) {
    let _ = self.tx.send(NetEvent::Disconnected(conn));
  }

  fn on_message(&self, conn: ConnectionId, message: Vec<u8>) {
    // Receiver gone means the application is shutting down.
    let _ = self.tx.send(NetEvent::Message(conn, message));
  }
}

/// Discards all traffic. Used for send-only sockets.
pub struct NullHandler;

impl NetworkHandler for NullHandler {
  fn on_message(&self, _conn: ConnectionId, _message: Vec<u8>) {}
}
