//! Two beacons of complementary roles on loopback.

use bake_net::discovery::{Beacon, BeaconConfig, BeaconEvent, BeaconRole};
use bake_net::NetworkContext;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

fn free_udp_port() -> u16 {
  let slot = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
  slot.local_addr().unwrap().port()
}

fn config(port: u16, peer_port: u16) -> BeaconConfig {
  BeaconConfig {
    port,
    announce: SocketAddr::from((Ipv4Addr::LOCALHOST, peer_port)),
    notify_interval_ms: 200,
    keep_alive_timeout_ms: 1000,
    holding_window_ms: 400,
  }
}

fn expect_discovered(beacon: &Beacon, id: &str) {
  match beacon.events().recv_timeout(Duration::from_millis(1000)).unwrap() {
    BeaconEvent::Discovered(peer) => assert_eq!(peer.id, id),
    other => panic!("expected discovery of {id}, got {:?}", other),
  }
}

#[test]
fn test_producer_and_consumer_find_each_other() {
  let ctx = Arc::new(NetworkContext::with_local_ip(Ipv4Addr::LOCALHOST));
  let producer_port = free_udp_port();
  let consumer_port = free_udp_port();

  let mut producer = Beacon::new(
    &ctx,
    config(producer_port, consumer_port),
    BeaconRole::Producer,
    "broker-1",
  )
  .unwrap();
  let mut consumer = Beacon::new(
    &ctx,
    config(consumer_port, producer_port),
    BeaconRole::Consumer,
    "host-1",
  )
  .unwrap();

  producer.start().unwrap();
  std::thread::sleep(Duration::from_millis(50));
  consumer.start().unwrap();

  expect_discovered(&producer, "host-1");
  expect_discovered(&consumer, "broker-1");

  // Keep-alives must not create duplicates.
  std::thread::sleep(Duration::from_millis(450));
  assert_eq!(producer.peers().len(), 1);
  assert_eq!(consumer.peers().len(), 1);
  assert!(producer.events().try_recv().is_err());

  // Clean departure is seen well before the keep-alive timeout.
  consumer.stop();
  match producer.events().recv_timeout(Duration::from_millis(500)).unwrap() {
    BeaconEvent::Lost(peer) => assert_eq!(peer.id, "host-1"),
    other => panic!("expected loss, got {:?}", other),
  }
  assert!(producer.peers().is_empty());
}

#[test]
fn test_silent_peer_is_evicted() {
  let ctx = Arc::new(NetworkContext::with_local_ip(Ipv4Addr::LOCALHOST));
  let producer_port = free_udp_port();
  let consumer_port = free_udp_port();

  let mut producer = Beacon::new(
    &ctx,
    config(producer_port, consumer_port),
    BeaconRole::Producer,
    "broker-2",
  )
  .unwrap();
  producer.start().unwrap();

  // A consumer that announces itself once and then goes quiet.
  let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
  let ad = bake_net::discovery::Advertisement {
    ip: "127.0.0.1".to_string(),
    id: "ghost".to_string(),
    action: bake_net::discovery::BeaconAction::Entering,
    role: BeaconRole::Consumer,
  };
  let frame = bake_net::codec::encode_frame(&ad.to_bytes().unwrap()).unwrap();
  sender.send_to(&frame, (Ipv4Addr::LOCALHOST, producer_port)).unwrap();

  expect_discovered(&producer, "ghost");
  match producer.events().recv_timeout(Duration::from_millis(2000)).unwrap() {
    BeaconEvent::Lost(peer) => assert_eq!(peer.id, "ghost"),
    other => panic!("expected eviction, got {:?}", other),
  }
  assert!(producer.peers().is_empty());
}
