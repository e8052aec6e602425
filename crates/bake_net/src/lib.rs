//! bake_net - Length-framed socket transport and peer discovery
//!
//! This crate provides the networking layer of the bake farm. Every
//! socket-owning component runs one readiness loop ([`mio::Poll`]) on its
//! own thread and is driven by an explicit [`NetworkContext`] handle.
//!
//! # Features
//!
//! - **Framing**: 4-byte little-endian length prefix, one
//!   [`PrefixLengthCodec`] per connection
//! - **Write queue**: [`WriteQueue::push`] never blocks; it wakes the owning
//!   loop, which drains queued blocks while the socket reports writable
//! - **Client / Server**: [`SocketClient`] drives one connection,
//!   [`SocketServer`] accepts and fans out across many (or listens for UDP
//!   broadcast traffic as a single logical peer)
//! - **Discovery**: [`discovery::Beacon`] advertises a role over UDP
//!   broadcast and tracks peers of the complementary role
//!
//! # Example
//!
//! ```ignore
//! use bake_net::{ChannelHandler, NetEvent, NetworkContext, SocketServer};
//!
//! let ctx = NetworkContext::new();
//! let (handler, events) = ChannelHandler::new();
//! let mut server = SocketServer::bind(&ctx, "0.0.0.0:12134".parse()?, handler)?;
//! server.start()?;
//!
//! while let Ok(NetEvent::Message(conn, bytes)) = events.recv() {
//!     server.send(conn, &bytes)?; // echo
//! }
//! ```

pub mod client;
pub mod codec;
pub mod context;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod reactor;
pub mod server;
pub mod socket;

pub use client::{FrameSender, SocketClient};
pub use codec::{ParserState, PrefixLengthCodec, DEFAULT_MAX_FRAME_LEN, PREFIX_LEN};
pub use context::NetworkContext;
pub use error::{NetError, Result};
pub use handler::{ChannelHandler, ConnectionId, NetEvent, NetworkHandler, NullHandler};
pub use reactor::StopHandle;
pub use server::SocketServer;
pub use socket::{Socket, WriteQueue};
