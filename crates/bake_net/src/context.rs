//! Process-wide networking context.
//!
//! Created once at program start and handed to every socket-owning
//! component. It replaces hidden global state: connection ids are allocated
//! here and the outward-facing address is resolved once.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::handler::ConnectionId;

/// Shared handle for all sockets of one process.
#[derive(Debug)]
pub struct NetworkContext {
  local_ip: Ipv4Addr,
  next_connection: AtomicU64,
}

impl NetworkContext {
  /// Create the context, resolving the local address.
  pub fn new() -> Arc<Self> {
    Arc::new(Self::with_local_ip(resolve_local_ip()))
  }

  /// Create a context with a fixed local address (tests, multi-homed hosts).
  pub fn with_local_ip(local_ip: Ipv4Addr) -> Self {
    Self {
      local_ip,
      next_connection: AtomicU64::new(1),
    }
  }

  /// Address other machines should use to reach this process.
  pub fn local_ip(&self) -> Ipv4Addr {
    self.local_ip
  }

  pub(crate) fn next_connection_id(&self) -> ConnectionId {
    ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
  }
}

/// Route lookup without sending anything: connecting a UDP socket only
/// selects the outgoing interface.
fn resolve_local_ip() -> Ipv4Addr {
  let route = || -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(10, 254, 254, 254), 1))?;
    match socket.local_addr()?.ip() {
      std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
      _ => Ok(Ipv4Addr::LOCALHOST),
    }
  };

  match route() {
    Ok(ip) => ip,
    Err(err) => {
      tracing::debug!(%err, "no routable interface, using loopback");
      Ipv4Addr::LOCALHOST
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_connection_ids_are_unique() {
    let ctx = NetworkContext::with_local_ip(Ipv4Addr::LOCALHOST);
    let a = ctx.next_connection_id();
    let b = ctx.next_connection_id();
    assert_ne!(a, b);
    assert_eq!(ctx.local_ip(), Ipv4Addr::LOCALHOST);
  }
}
