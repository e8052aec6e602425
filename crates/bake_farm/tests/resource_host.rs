//! Engine-side scheduling across brokers, and the local broker fallback.

use bake_farm::broker::{Broker, ThreadSpawner};
use bake_farm::config::{BrokerConfig, HostConfig};
use bake_farm::host::HostEvent;
use bake_farm::resource_host::{BrokerLauncher, InProcessLauncher, LocalBroker, ResourceHost};
use bake_farm::splitter::DefaultSplitter;
use bake_farm::task::TaskModel;
use bake_farm::worker::PassthroughEncoder;
use bake_farm::Result;
use bake_net::discovery::BeaconConfig;
use bake_net::NetworkContext;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(15);

fn context() -> Arc<NetworkContext> {
	Arc::new(NetworkContext::with_local_ip(Ipv4Addr::LOCALHOST))
}

fn free_udp_port() -> u16 {
	let slot = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
	slot.local_addr().unwrap().port()
}

fn free_tcp_port() -> u16 {
	let slot = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
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

fn broker_config(max_workers: usize) -> BrokerConfig {
	BrokerConfig {
		bind_ip: Ipv4Addr::LOCALHOST,
		front_port: 0,
		back_port: 0,
		max_workers: Some(max_workers),
		idle_sleep_ms: 5,
		..BrokerConfig::default()
	}
}

fn start_broker(ctx: &Arc<NetworkContext>, identity: &str, max_workers: usize) -> Broker {
	let config = BrokerConfig {
		identity: Some(identity.to_string()),
		..broker_config(max_workers)
	};
	let splitter = Arc::new(DefaultSplitter::default());
	let spawner = Arc::new(ThreadSpawner::new(ctx, Arc::new(PassthroughEncoder)));
	let mut broker = Broker::new(ctx, &config, spawner, splitter.clone(), splitter).unwrap();
	broker.start().unwrap();
	broker
}

/// A host that never hears a broker advertise.
fn quiet_host(ctx: &Arc<NetworkContext>, startup_delay_ms: u64, launcher: Option<Arc<dyn BrokerLauncher>>) -> ResourceHost {
	let config = HostConfig {
		identity: Some("engine".to_string()),
		startup_delay_ms,
		beacon: beacon(free_udp_port(), free_udp_port()),
		..HostConfig::default()
	};
	ResourceHost::new(ctx, config, launcher).unwrap()
}

fn wait_finished(host: &mut ResourceHost, expected: &[&str]) {
	let mut finished = HashSet::new();
	let deadline = Instant::now() + WAIT;
	while finished.len() < expected.len() && Instant::now() < deadline {
		if let Some(HostEvent::Finished { host_task_id }) = host.next_event(Duration::from_millis(100)) {
			finished.insert(host_task_id);
		}
	}
	let expected: HashSet<String> = expected.iter().map(|id| id.to_string()).collect();
	assert_eq!(finished, expected);
}

#[test]
fn test_tasks_spread_over_idle_brokers() {
	let ctx = context();
	let first = start_broker(&ctx, "b1", 1);
	let second = start_broker(&ctx, "b2", 1);

	let mut host = quiet_host(&ctx, 60_000, None);
	host.add_broker("b1", first.local_front_addr()).unwrap();
	host.add_broker("b2", second.local_front_addr()).unwrap();
	assert_eq!(host.broker_count(), 2);

	host.submit_model("a", TaskModel::default(), vec![1; 32]);
	host.submit_model("b", TaskModel::default(), vec![2; 32]);
	host.submit_model("c", TaskModel::default(), vec![3; 32]);

	// One task per broker; the third waits for whichever finishes first.
	assert_eq!(host.broker_of("a"), Some("b1"));
	assert_eq!(host.broker_of("b"), Some("b2"));
	assert_eq!(host.broker_of("c"), None);
	assert_eq!(host.pending(), 1);

	wait_finished(&mut host, &["a", "b", "c"]);
	assert_eq!(host.pending(), 0);
	assert!(!host.has_local_broker());
	host.close();
}

#[test]
fn test_lost_broker_task_moves_to_another() {
	let ctx = context();
	// No workers: the task sits on this broker until it goes away.
	let mut stalled = start_broker(&ctx, "stalled", 0);
	let healthy = start_broker(&ctx, "healthy", 1);

	let mut host = quiet_host(&ctx, 60_000, None);
	host.add_broker("stalled", stalled.local_front_addr()).unwrap();
	host.submit_model("a", TaskModel::default(), vec![7; 16]);
	assert_eq!(host.broker_of("a"), Some("stalled"));

	host.add_broker("healthy", healthy.local_front_addr()).unwrap();
	stalled.stop();

	wait_finished(&mut host, &["a"]);
	assert_eq!(host.broker_count(), 1);
	host.close();
}

/// Counts launches without starting anything.
struct CountingLauncher(AtomicUsize);

impl BrokerLauncher for CountingLauncher {
	fn launch(&self, _identity: &str, _front_port: u16) -> Result<Box<dyn LocalBroker>> {
		self.0.fetch_add(1, Ordering::SeqCst);
		Err(bake_farm::FarmError::Launch(std::io::Error::other("not launching")))
	}
}

#[test]
fn test_known_broker_suppresses_local_launch() {
	let ctx = context();
	let broker = start_broker(&ctx, "b1", 1);
	let launcher = Arc::new(CountingLauncher(AtomicUsize::new(0)));

	let mut host = quiet_host(&ctx, 50, Some(launcher.clone()));
	host.add_broker("b1", broker.local_front_addr()).unwrap();
	let _ = host.next_event(Duration::from_millis(200));

	assert_eq!(launcher.0.load(Ordering::SeqCst), 0);
	assert!(!host.has_local_broker());
	host.close();
}

#[test]
fn test_failed_launch_is_attempted_once() {
	let ctx = context();
	let launcher = Arc::new(CountingLauncher(AtomicUsize::new(0)));

	let mut host = quiet_host(&ctx, 20, Some(launcher.clone()));
	let _ = host.next_event(Duration::from_millis(200));
	let _ = host.next_event(Duration::from_millis(50));

	assert_eq!(launcher.0.load(Ordering::SeqCst), 1);
	assert!(!host.has_local_broker());
	host.close();
}

/// Records whether the launched broker exited by itself when stopped.
struct Recording {
	inner: InProcessLauncher,
	graceful: Arc<Mutex<Option<bool>>>,
}

struct Recorded {
	broker: Box<dyn LocalBroker>,
	graceful: Arc<Mutex<Option<bool>>>,
}

impl BrokerLauncher for Recording {
	fn launch(&self, identity: &str, front_port: u16) -> Result<Box<dyn LocalBroker>> {
		let broker = self.inner.launch(identity, front_port)?;
		Ok(Box::new(Recorded {
			broker,
			graceful: Arc::clone(&self.graceful),
		}))
	}
}

impl LocalBroker for Recorded {
	fn is_running(&mut self) -> bool {
		self.broker.is_running()
	}

	fn stop(&mut self, grace: Duration) -> bool {
		let graceful = self.broker.stop(grace);
		*self.graceful.lock().unwrap() = Some(graceful);
		graceful
	}
}

#[test]
fn test_local_broker_started_and_shut_down() {
	let ctx = context();
	let broker_beacon = free_udp_port();
	let engine_beacon = free_udp_port();
	let front_port = free_tcp_port();

	let splitter = Arc::new(DefaultSplitter::default());
	let spawner = Arc::new(ThreadSpawner::new(&ctx, Arc::new(PassthroughEncoder)));
	let broker_config = BrokerConfig {
		beacon: beacon(broker_beacon, engine_beacon),
		..broker_config(1)
	};
	let graceful = Arc::new(Mutex::new(None));
	let launcher = Arc::new(Recording {
		inner: InProcessLauncher::new(&ctx, broker_config, spawner, splitter.clone(), splitter),
		graceful: Arc::clone(&graceful),
	});

	let config = HostConfig {
		identity: Some("engine".to_string()),
		front_port,
		startup_delay_ms: 200,
		beacon: beacon(engine_beacon, broker_beacon),
		..HostConfig::default()
	};
	let mut host = ResourceHost::new(&ctx, config, Some(launcher)).unwrap();

	// The launched broker advertises itself and is connected like any other.
	let deadline = Instant::now() + WAIT;
	while host.broker_count() == 0 && Instant::now() < deadline {
		let _ = host.next_event(Duration::from_millis(50));
	}
	assert!(host.has_local_broker());
	assert_eq!(host.broker_count(), 1);

	host.submit_model("rock", TaskModel::default(), vec![9; 64]);
	wait_finished(&mut host, &["rock"]);

	host.close();
	assert_eq!(*graceful.lock().unwrap(), Some(true));
}
