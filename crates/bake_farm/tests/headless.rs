//! Headless broker found over the beacon, stopped when its engine leaves.

use bake_farm::broker::{Broker, ThreadSpawner};
use bake_farm::config::BrokerConfig;
use bake_farm::host::{HostClient, HostEvent};
use bake_farm::splitter::DefaultSplitter;
use bake_farm::worker::PassthroughEncoder;
use bake_net::discovery::BeaconConfig;
use bake_net::NetworkContext;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn free_udp_port() -> u16 {
	let slot = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
	slot.local_addr().unwrap().port()
}

fn beacon(port: u16, peer_port: u16) -> BeaconConfig {
	BeaconConfig {
		port,
		announce: SocketAddr::from((Ipv4Addr::LOCALHOST, peer_port)),
		notify_interval_ms: 200,
		keep_alive_timeout_ms: 1000,
		holding_window_ms: 400,
	}
}

#[test]
fn test_engine_discovers_headless_broker() {
	let ctx = Arc::new(NetworkContext::with_local_ip(Ipv4Addr::LOCALHOST));
	let broker_beacon = free_udp_port();
	let engine_beacon = free_udp_port();

	let config = BrokerConfig {
		bind_ip: Ipv4Addr::LOCALHOST,
		front_port: 0,
		back_port: 0,
		max_workers: Some(1),
		idle_sleep_ms: 5,
		headless: true,
		beacon: beacon(broker_beacon, engine_beacon),
		..BrokerConfig::default()
	};
	let splitter = Arc::new(DefaultSplitter::default());
	let spawner = Arc::new(ThreadSpawner::new(&ctx, Arc::new(PassthroughEncoder)));
	let mut broker = Broker::new(&ctx, &config, spawner, splitter.clone(), splitter).unwrap();
	broker.start().unwrap();

	let host = HostClient::discover(
		&ctx,
		beacon(engine_beacon, broker_beacon),
		broker.front_addr().port(),
		"engine",
		Duration::from_secs(5),
	)
	.unwrap();

	host.request_cores().unwrap();
	assert!(matches!(host.next_event(Duration::from_secs(5)), Some(HostEvent::Cores(_))));

	// Leaving the beacon tells the broker its engine is gone.
	host.close();
	let deadline = Instant::now() + Duration::from_secs(5);
	while broker.is_running() && Instant::now() < deadline {
		std::thread::sleep(Duration::from_millis(20));
	}
	assert!(!broker.is_running());
	broker.wait();
}
