use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lifecycle step carried by an advertisement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconAction {
  Entering,
  Alive,
  Leaving,
}

/// Producers offer work capacity (brokers); consumers use it (hosts).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BeaconRole {
  Producer,
  Consumer,
}

/// One discovery datagram.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
  pub ip: String,
  pub id: String,
  pub action: BeaconAction,
  pub role: BeaconRole,
}

impl Advertisement {
  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(self)?)
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    Ok(postcard::from_bytes(bytes)?)
  }

  pub fn with_action(&self, action: BeaconAction) -> Self {
    Self {
      action,
      ..self.clone()
    }
  }
}
