use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, Sender};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::advertisement::{Advertisement, BeaconAction, BeaconRole};
use super::config::BeaconConfig;
use super::peer_table::{Observation, PeerRecord, PeerTable};
use crate::client::{FrameSender, SocketClient};
use crate::context::NetworkContext;
use crate::error::Result;
use crate::handler::{ConnectionId, NetworkHandler, NullHandler};
use crate::server::SocketServer;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BeaconEvent {
  Discovered(PeerRecord),
  Lost(PeerRecord),
}

struct BeaconShared {
  local: Advertisement,
  table: Mutex<PeerTable>,
  outbound: FrameSender,
  events: Sender<BeaconEvent>,
}

impl BeaconShared {
  fn table(&self) -> MutexGuard<'_, PeerTable> {
    self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn announce(&self, action: BeaconAction) {
    let sent = self
      .local
      .with_action(action)
      .to_bytes()
      .and_then(|bytes| self.outbound.send(&bytes));
    if let Err(err) = sent {
      tracing::warn!(?action, %err, "failed to queue advertisement");
    }
  }

  fn emit(&self, event: BeaconEvent) {
    let _ = self.events.send(event);
  }
}

impl NetworkHandler for BeaconShared {
  fn on_message(&self, _conn: ConnectionId, message: Vec<u8>) {
    let ad = match Advertisement::from_bytes(&message) {
      Ok(ad) => ad,
      Err(err) => {
        tracing::warn!(%err, "ignoring malformed advertisement");
        return;
      }
    };

    let observation = self.table().observe(&ad, Instant::now());
    match observation {
      Observation::Discovered(peer) => {
        tracing::info!(peer = %peer.id, ip = %peer.ip, role = ?peer.role, "discovered peer");
        self.emit(BeaconEvent::Discovered(peer));
        // Let a late joiner learn about us without waiting a full interval.
        self.announce(BeaconAction::Alive);
      }
      Observation::Lost(peer) => {
        tracing::info!(peer = %peer.id, "peer left");
        self.emit(BeaconEvent::Lost(peer));
      }
      Observation::Refreshed | Observation::Ignored => {}
    }
  }
}

/// Discovery endpoint: one broadcast listener, one broadcast sender and a
/// keep-alive timer thread.
pub struct Beacon {
  config: BeaconConfig,
  shared: Arc<BeaconShared>,
  server: SocketServer,
  client: SocketClient,
  keep_alive: Option<(Sender<()>, JoinHandle<()>)>,
  events: Receiver<BeaconEvent>,
}

impl Beacon {
  pub fn new(ctx: &Arc<NetworkContext>, config: BeaconConfig, role: BeaconRole, id: impl Into<String>) -> Result<Self> {
    let id = id.into();
    let client = SocketClient::broadcast(ctx, config.announce, Arc::new(NullHandler))?;
    let (tx, events) = channel::unbounded();

    let shared = Arc::new(BeaconShared {
      local: Advertisement {
        ip: ctx.local_ip().to_string(),
        id: id.clone(),
        action: BeaconAction::Entering,
        role,
      },
      table: Mutex::new(PeerTable::new(
        id,
        role,
        config.keep_alive_timeout(),
        config.holding_window(),
      )),
      outbound: client.sender(),
      events: tx,
    });

    let listen: SocketAddr = (Ipv4Addr::UNSPECIFIED, config.port).into();
    let server = SocketServer::bind_broadcast(ctx, listen, Arc::clone(&shared) as Arc<dyn NetworkHandler>)?;

    Ok(Self {
      config,
      shared,
      server,
      client,
      keep_alive: None,
      events,
    })
  }

  pub fn id(&self) -> &str {
    &self.shared.local.id
  }

  pub fn role(&self) -> BeaconRole {
    self.shared.local.role
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.server.local_addr()
  }

  /// Discovery and loss notifications.
  pub fn events(&self) -> &Receiver<BeaconEvent> {
    &self.events
  }

  /// Snapshot of currently active peers.
  pub fn peers(&self) -> Vec<PeerRecord> {
    self.shared.table().peers()
  }

  pub fn is_running(&self) -> bool {
    self.keep_alive.is_some()
  }

  /// Start listening, announce `Entering` and begin keep-alive broadcasts.
  pub fn start(&mut self) -> Result<()> {
    if self.is_running() {
      return Ok(());
    }
    self.server.start()?;
    self.client.start()?;
    self.shared.announce(BeaconAction::Entering);

    let (stop_tx, stop_rx) = channel::bounded(1);
    let shared = Arc::clone(&self.shared);
    let interval = self.config.notify_interval();
    let thread = std::thread::Builder::new()
      .name("bake-net-beacon".to_string())
      .spawn(move || keep_alive_loop(&shared, interval, &stop_rx))?;

    self.keep_alive = Some((stop_tx, thread));
    tracing::info!(id = %self.id(), role = ?self.role(), port = self.local_addr().port(), "beacon started");
    Ok(())
  }

  /// Announce `Leaving`, then stop the timer and both socket loops.
  pub fn stop(&mut self) {
    let Some((stop_tx, thread)) = self.keep_alive.take() else {
      return;
    };
    self.shared.announce(BeaconAction::Leaving);

    drop(stop_tx);
    if thread.join().is_err() {
      tracing::error!("beacon keep-alive thread panicked");
    }
    self.client.stop();
    self.server.stop();
    tracing::info!(id = %self.id(), "beacon stopped");
  }
}

impl Drop for Beacon {
  fn drop(&mut self) {
    self.stop();
  }
}

fn keep_alive_loop(shared: &BeaconShared, interval: Duration, stop: &Receiver<()>) {
  loop {
    match stop.recv_timeout(interval) {
      Err(RecvTimeoutError::Timeout) => {}
      Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
    }

    shared.announce(BeaconAction::Alive);

    let evicted = shared.table().sweep(Instant::now());
    for peer in evicted {
      tracing::info!(peer = %peer.id, "peer timed out");
      shared.emit(BeaconEvent::Lost(peer));
    }
  }
}
