//! UDP broadcast presence protocol.
//!
//! A [`Beacon`] advertises `{ip, id, role}` on a well-known port and tracks
//! peers of the complementary [`BeaconRole`]. Peer bookkeeping lives in the
//! clock-injected [`PeerTable`]; the beacon only moves datagrams and time.

mod advertisement;
mod beacon;
mod config;
mod peer_table;

pub use advertisement::{Advertisement, BeaconAction, BeaconRole};
pub use beacon::{Beacon, BeaconEvent};
pub use config::{BeaconConfig, DEFAULT_BEACON_PORT};
pub use peer_table::{Observation, PeerRecord, PeerTable};
