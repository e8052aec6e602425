use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Well-known discovery port.
pub const DEFAULT_BEACON_PORT: u16 = 21343;

/// Timing and addressing for a [`Beacon`](super::Beacon).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
  /// Port the listener binds on all interfaces.
  pub port: u16,
  /// Destination of outgoing advertisements.
  pub announce: SocketAddr,
  /// Interval between `Alive` broadcasts and liveness sweeps.
  pub notify_interval_ms: u64,
  /// Silence after which an active peer is evicted.
  pub keep_alive_timeout_ms: u64,
  /// How long a departed peer is ignored before it may be rediscovered.
  pub holding_window_ms: u64,
}

impl Default for BeaconConfig {
  fn default() -> Self {
    Self {
      port: DEFAULT_BEACON_PORT,
      announce: (Ipv4Addr::BROADCAST, DEFAULT_BEACON_PORT).into(),
      notify_interval_ms: 2000,
      keep_alive_timeout_ms: 10_000,
      holding_window_ms: 2000,
    }
  }
}

impl BeaconConfig {
  pub fn notify_interval(&self) -> Duration {
    Duration::from_millis(self.notify_interval_ms)
  }

  pub fn keep_alive_timeout(&self) -> Duration {
    Duration::from_millis(self.keep_alive_timeout_ms)
  }

  pub fn holding_window(&self) -> Duration {
    Duration::from_millis(self.holding_window_ms)
  }
}
