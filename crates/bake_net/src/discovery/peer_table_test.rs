use super::*;

const TIMEOUT: Duration = Duration::from_millis(10_000);
const HOLD: Duration = Duration::from_millis(2000);

fn table() -> PeerTable {
  PeerTable::new("host-a", BeaconRole::Consumer, TIMEOUT, HOLD)
}

fn ad(id: &str, action: BeaconAction, role: BeaconRole) -> Advertisement {
  Advertisement {
    ip: "10.0.0.7".to_string(),
    id: id.to_string(),
    action,
    role,
  }
}

#[test]
fn test_self_is_never_recorded() {
  let mut table = table();
  let now = Instant::now();
  let own = ad("host-a", BeaconAction::Entering, BeaconRole::Producer);
  assert_eq!(table.observe(&own, now), Observation::Ignored);
  assert!(table.is_empty());
}

#[test]
fn test_same_role_is_ignored() {
  let mut table = table();
  let other_host = ad("host-b", BeaconAction::Entering, BeaconRole::Consumer);
  assert_eq!(table.observe(&other_host, Instant::now()), Observation::Ignored);
  assert!(table.is_empty());
}

#[test]
fn test_discovery_then_refresh() {
  let mut table = table();
  let t0 = Instant::now();

  match table.observe(&ad("broker", BeaconAction::Entering, BeaconRole::Producer), t0) {
    Observation::Discovered(record) => {
      assert_eq!(record.id, "broker");
      assert_eq!(record.ip, "10.0.0.7");
    }
    other => panic!("expected discovery, got {:?}", other),
  }

  let t1 = t0 + Duration::from_millis(500);
  assert_eq!(
    table.observe(&ad("broker", BeaconAction::Alive, BeaconRole::Producer), t1),
    Observation::Refreshed
  );
  assert_eq!(table.len(), 1);
  assert_eq!(table.get("broker").unwrap().last_seen, t1);
}

#[test]
fn test_unknown_alive_discovers() {
  let mut table = table();
  let obs = table.observe(&ad("late", BeaconAction::Alive, BeaconRole::Producer), Instant::now());
  assert!(matches!(obs, Observation::Discovered(_)));
}

#[test]
fn test_leaving_moves_to_holding() {
  let mut table = table();
  let t0 = Instant::now();
  table.observe(&ad("broker", BeaconAction::Entering, BeaconRole::Producer), t0);

  let obs = table.observe(&ad("broker", BeaconAction::Leaving, BeaconRole::Producer), t0);
  assert!(matches!(obs, Observation::Lost(ref r) if r.id == "broker"));
  assert!(table.is_empty());
  assert!(table.is_holding("broker"));

  // A late duplicate leave or alive inside the window is absorbed.
  assert_eq!(
    table.observe(&ad("broker", BeaconAction::Leaving, BeaconRole::Producer), t0),
    Observation::Ignored
  );
  assert_eq!(
    table.observe(&ad("broker", BeaconAction::Alive, BeaconRole::Producer), t0 + Duration::from_millis(100)),
    Observation::Ignored
  );
  assert!(table.is_empty());
}

#[test]
fn test_rediscovered_after_holding_window() {
  let mut table = table();
  let t0 = Instant::now();
  table.observe(&ad("broker", BeaconAction::Entering, BeaconRole::Producer), t0);
  table.observe(&ad("broker", BeaconAction::Leaving, BeaconRole::Producer), t0);

  let later = t0 + HOLD + Duration::from_millis(1);
  assert!(table.sweep(later).is_empty());
  assert!(!table.is_holding("broker"));

  let obs = table.observe(&ad("broker", BeaconAction::Entering, BeaconRole::Producer), later);
  assert!(matches!(obs, Observation::Discovered(_)));
}

#[test]
fn test_eviction_only_after_timeout() {
  let mut table = table();
  let t0 = Instant::now();
  table.observe(&ad("broker", BeaconAction::Entering, BeaconRole::Producer), t0);

  assert!(table.sweep(t0 + TIMEOUT).is_empty());
  assert_eq!(table.len(), 1);

  let lost = table.sweep(t0 + TIMEOUT + Duration::from_millis(1));
  assert_eq!(lost.len(), 1);
  assert_eq!(lost[0].id, "broker");
  assert!(table.is_empty());
  assert!(table.is_holding("broker"));
}

#[test]
fn test_alive_postpones_eviction() {
  let mut table = table();
  let t0 = Instant::now();
  table.observe(&ad("broker", BeaconAction::Entering, BeaconRole::Producer), t0);

  let t1 = t0 + Duration::from_millis(8000);
  table.observe(&ad("broker", BeaconAction::Alive, BeaconRole::Producer), t1);

  assert!(table.sweep(t0 + TIMEOUT + Duration::from_millis(1)).is_empty());
  assert_eq!(table.sweep(t1 + TIMEOUT + Duration::from_millis(1)).len(), 1);
}
