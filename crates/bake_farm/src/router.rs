//! Router-style message channel over length-framed TCP.
//!
//! Every connection announces its routing identity inside each frame. The
//! server learns which connection carries which identity from inbound
//! traffic and routes outgoing messages by identity. Sending to an identity
//! that has not spoken yet (or has disconnected) fails with
//! [`FarmError::UnknownPeer`] instead of being silently dropped.

use bake_net::{ConnectionId, NetworkContext, NetworkHandler, SocketClient, SocketServer};
use crossbeam_channel::{self as channel, Receiver, Sender};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{FarmError, Result};
use crate::protocol::{Envelope, Message, WireEnvelope, MAX_FRAME_LEN};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouterEvent {
	Message(Envelope),
	/// A peer that had identified itself went away.
	Disconnected(String),
}

#[derive(Default)]
struct Routes {
	by_identity: HashMap<String, ConnectionId>,
	by_connection: HashMap<ConnectionId, String>,
}

/// Decodes frames, maintains routes and forwards events.
struct RouterInbox {
	routes: Mutex<Routes>,
	events: Sender<RouterEvent>,
}

impl RouterInbox {
	fn routes(&self) -> MutexGuard<'_, Routes> {
		self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}

impl NetworkHandler for RouterInbox {
	fn on_disconnect(&self, conn: ConnectionId) {
		let identity = {
			let mut routes = self.routes();
			let identity = routes.by_connection.remove(&conn);
			if let Some(identity) = &identity {
				if routes.by_identity.get(identity) == Some(&conn) {
					routes.by_identity.remove(identity);
				}
			}
			identity
		};
		if let Some(identity) = identity {
			tracing::debug!(peer = %identity, "router peer disconnected");
			let _ = self.events.send(RouterEvent::Disconnected(identity));
		}
	}

	fn on_message(&self, conn: ConnectionId, bytes: Vec<u8>) {
		let wire = match WireEnvelope::from_bytes(&bytes) {
			Ok(wire) => wire,
			Err(err) => {
				tracing::warn!(conn = conn.0, %err, "dropping undecodable router frame");
				return;
			}
		};

		{
			let mut routes = self.routes();
			if routes.by_identity.get(&wire.identity) != Some(&conn) {
				tracing::trace!(peer = %wire.identity, conn = conn.0, "learned route");
				routes.by_identity.insert(wire.identity.clone(), conn);
				routes.by_connection.insert(conn, wire.identity.clone());
			}
		}

		let _ = self.events.send(RouterEvent::Message(Envelope {
			address: wire.identity,
			message: Message::from_frames(wire.frames),
		}));
	}
}

fn inbox() -> (Arc<RouterInbox>, Receiver<RouterEvent>) {
	let (tx, rx) = channel::unbounded();
	let inbox = Arc::new(RouterInbox {
		routes: Mutex::new(Routes::default()),
		events: tx,
	});
	(inbox, rx)
}

fn encode_wire(identity: &str, message: &Message) -> Result<Vec<u8>> {
	WireEnvelope {
		identity: identity.to_string(),
		frames: message.frames().to_vec(),
	}
	.to_bytes()
}

// =============================================================================
// Server side (bind)
// =============================================================================

pub struct RouterServer {
	identity: String,
	server: SocketServer,
	inbox: Arc<RouterInbox>,
	events: Receiver<RouterEvent>,
}

impl RouterServer {
	pub fn bind(ctx: &Arc<NetworkContext>, addr: SocketAddr, identity: impl Into<String>) -> Result<Self> {
		let (inbox, events) = inbox();
		let server = SocketServer::bind(ctx, addr, Arc::clone(&inbox) as Arc<dyn NetworkHandler>)?
			.with_max_frame_len(MAX_FRAME_LEN);
		Ok(Self {
			identity: identity.into(),
			server,
			inbox,
			events,
		})
	}

	pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
		self.server = self.server.with_max_frame_len(max_frame_len);
		self
	}

	pub fn identity(&self) -> &str {
		&self.identity
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.server.local_addr()
	}

	pub fn start(&mut self) -> Result<()> {
		Ok(self.server.start()?)
	}

	pub fn stop(&mut self) {
		self.server.stop();
	}

	/// Route `message` to the peer that identified itself as `address`.
	pub fn send(&self, address: &str, message: &Message) -> Result<()> {
		let conn = self
			.inbox
			.routes()
			.by_identity
			.get(address)
			.copied()
			.ok_or_else(|| FarmError::UnknownPeer(address.to_string()))?;

		let bytes = encode_wire(&self.identity, message)?;
		self.server.send(conn, &bytes).map_err(|err| match err {
			bake_net::NetError::UnknownConnection(_) => FarmError::UnknownPeer(address.to_string()),
			other => other.into(),
		})
	}

	pub fn is_routable(&self, address: &str) -> bool {
		self.inbox.routes().by_identity.contains_key(address)
	}

	pub fn try_recv(&self) -> Option<RouterEvent> {
		self.events.try_recv().ok()
	}

	pub fn recv_timeout(&self, timeout: Duration) -> Option<RouterEvent> {
		self.events.recv_timeout(timeout).ok()
	}
}

// =============================================================================
// Client side (connect)
// =============================================================================

pub struct RouterClient {
	identity: String,
	client: SocketClient,
	events: Receiver<RouterEvent>,
	loss_reported: AtomicBool,
}

impl RouterClient {
	/// Connect to a [`RouterServer`] and start the client loop.
	pub fn connect(ctx: &Arc<NetworkContext>, addr: SocketAddr, identity: impl Into<String>) -> Result<Self> {
		let (inbox, events) = inbox();
		let mut client =
			SocketClient::connect(ctx, addr, inbox as Arc<dyn NetworkHandler>)?.with_max_frame_len(MAX_FRAME_LEN);
		client.start()?;
		Ok(Self {
			identity: identity.into(),
			client,
			events,
			loss_reported: AtomicBool::new(false),
		})
	}

	pub fn identity(&self) -> &str {
		&self.identity
	}

	pub fn is_connected(&self) -> bool {
		self.client.is_connected()
	}

	pub fn send(&self, message: &Message) -> Result<()> {
		let bytes = encode_wire(&self.identity, message)?;
		self.client.send(&bytes).map_err(|err| match err {
			bake_net::NetError::Closed => FarmError::Disconnected,
			other => other.into(),
		})
	}

	/// Next event. A closed connection is reported exactly once as
	/// [`RouterEvent::Disconnected`], carrying an empty identity when the
	/// server never spoke. Later calls return `None`.
	pub fn try_recv(&self) -> Option<RouterEvent> {
		match self.events.try_recv() {
			Ok(event) => self.observe(event),
			Err(_) => self.lost_connection(),
		}
	}

	pub fn recv_timeout(&self, timeout: Duration) -> Option<RouterEvent> {
		match self.events.recv_timeout(timeout) {
			Ok(event) => self.observe(event),
			Err(_) => self.lost_connection(),
		}
	}

	fn observe(&self, event: RouterEvent) -> Option<RouterEvent> {
		match event {
			RouterEvent::Disconnected(_) if self.loss_reported.swap(true, Ordering::AcqRel) => None,
			event => Some(event),
		}
	}

	fn lost_connection(&self) -> Option<RouterEvent> {
		if self.client.is_connected() || self.loss_reported.swap(true, Ordering::AcqRel) {
			None
		} else {
			Some(RouterEvent::Disconnected(String::new()))
		}
	}

	/// Stop the loop after flushing queued messages.
	pub fn close(mut self) {
		self.client.stop();
	}
}

#[cfg(test)]
#[path = "router_test.rs"]
mod router_test;
