//! Peer bookkeeping for discovery, independent of sockets and clocks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::advertisement::{Advertisement, BeaconAction, BeaconRole};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
  pub ip: String,
  pub id: String,
  pub role: BeaconRole,
  pub last_seen: Instant,
}

/// Result of feeding one advertisement into the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
  /// Self, same role, held, or unknown leaver.
  Ignored,
  /// First sighting; the caller answers with its own advertisement.
  Discovered(PeerRecord),
  /// Known peer, timestamp updated.
  Refreshed,
  /// Peer announced departure and moved to the holding set.
  Lost(PeerRecord),
}

pub struct PeerTable {
  local_id: String,
  local_role: BeaconRole,
  keep_alive_timeout: Duration,
  holding_window: Duration,
  active: HashMap<String, PeerRecord>,
  holding: HashMap<String, Instant>,
}

impl PeerTable {
  pub fn new(local_id: impl Into<String>, local_role: BeaconRole, keep_alive_timeout: Duration, holding_window: Duration) -> Self {
    Self {
      local_id: local_id.into(),
      local_role,
      keep_alive_timeout,
      holding_window,
      active: HashMap::new(),
      holding: HashMap::new(),
    }
  }

  pub fn observe(&mut self, ad: &Advertisement, now: Instant) -> Observation {
    if ad.id == self.local_id || ad.role == self.local_role {
      return Observation::Ignored;
    }

    match ad.action {
      BeaconAction::Entering | BeaconAction::Alive => {
        if let Some(record) = self.active.get_mut(&ad.id) {
          record.last_seen = now;
          return Observation::Refreshed;
        }
        if self.holding.contains_key(&ad.id) {
          return Observation::Ignored;
        }

        let record = PeerRecord {
          ip: ad.ip.clone(),
          id: ad.id.clone(),
          role: ad.role,
          last_seen: now,
        };
        self.active.insert(ad.id.clone(), record.clone());
        Observation::Discovered(record)
      }
      BeaconAction::Leaving => match self.active.remove(&ad.id) {
        Some(record) => {
          self.holding.insert(ad.id.clone(), now);
          Observation::Lost(record)
        }
        None => Observation::Ignored,
      },
    }
  }

  /// Drop expired holding entries and evict silent peers, returning the
  /// evicted records.
  pub fn sweep(&mut self, now: Instant) -> Vec<PeerRecord> {
    let holding_window = self.holding_window;
    self
      .holding
      .retain(|_, since| now.saturating_duration_since(*since) <= holding_window);

    let timeout = self.keep_alive_timeout;
    let stale: Vec<String> = self
      .active
      .values()
      .filter(|record| now.saturating_duration_since(record.last_seen) > timeout)
      .map(|record| record.id.clone())
      .collect();

    let mut lost = Vec::with_capacity(stale.len());
    for id in stale {
      if let Some(record) = self.active.remove(&id) {
        self.holding.insert(id, now);
        lost.push(record);
      }
    }
    lost
  }

  pub fn peers(&self) -> Vec<PeerRecord> {
    self.active.values().cloned().collect()
  }

  pub fn get(&self, id: &str) -> Option<&PeerRecord> {
    self.active.get(id)
  }

  pub fn is_holding(&self, id: &str) -> bool {
    self.holding.contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.active.len()
  }

  pub fn is_empty(&self) -> bool {
    self.active.is_empty()
  }
}

#[cfg(test)]
#[path = "peer_table_test.rs"]
mod peer_table_test;
