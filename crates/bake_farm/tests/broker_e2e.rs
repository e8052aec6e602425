//! Broker end-to-end over loopback with in-process workers.

use bake_farm::broker::{Broker, ThreadSpawner};
use bake_farm::config::BrokerConfig;
use bake_farm::host::{HostClient, HostEvent, HostEvents};
use bake_farm::protocol::PROTOCOL_VERSION;
use bake_farm::splitter::DefaultSplitter;
use bake_farm::task::{TaskImage, TaskModel, TaskModelResult};
use bake_farm::worker::PassthroughEncoder;
use bake_net::NetworkContext;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(15);

fn start_broker(max_workers: usize) -> (Arc<NetworkContext>, Broker) {
	let ctx = Arc::new(NetworkContext::with_local_ip(Ipv4Addr::LOCALHOST));
	let config = BrokerConfig {
		bind_ip: Ipv4Addr::LOCALHOST,
		front_port: 0,
		back_port: 0,
		identity: Some("broker".to_string()),
		max_workers: Some(max_workers),
		idle_sleep_ms: 5,
		..BrokerConfig::default()
	};
	let splitter = Arc::new(DefaultSplitter::default());
	let spawner = Arc::new(ThreadSpawner::new(&ctx, Arc::new(PassthroughEncoder)));
	let mut broker = Broker::new(&ctx, &config, spawner, splitter.clone(), splitter).unwrap();
	broker.start().unwrap();
	(ctx, broker)
}

fn png(width: u32, height: u32) -> Vec<u8> {
	let img = RgbaImage::from_fn(width, height, |x, y| Rgba([x as u8, y as u8, 64, 255]));
	let mut bytes = Vec::new();
	DynamicImage::ImageRgba8(img)
		.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
		.unwrap();
	bytes
}

/// Events for `host_task_id` up to and including `Finished`.
fn events_until_finished(host: &HostClient, host_task_id: &str) -> Vec<HostEvent> {
	let deadline = Instant::now() + WAIT;
	let mut events = Vec::new();
	while Instant::now() < deadline {
		let Some(event) = host.next_event(Duration::from_millis(100)) else {
			continue;
		};
		assert_ne!(event, HostEvent::Disconnected, "broker went away");
		let finished = matches!(&event, HostEvent::Finished { host_task_id: id } if id == host_task_id);
		events.push(event);
		if finished {
			return events;
		}
	}
	panic!("task {host_task_id} did not finish, got {events:?}");
}

fn progress_values(events: &[HostEvent]) -> Vec<f32> {
	events
		.iter()
		.filter_map(|event| match event {
			HostEvent::Progress { progress, .. } | HostEvent::ProgressMessage { progress, .. } => Some(*progress),
			_ => None,
		})
		.collect()
}

#[test]
fn test_image_with_mips_is_joined() {
	let (ctx, broker) = start_broker(2);
	let host = HostClient::connect(&ctx, broker.front_addr(), "engine").unwrap();

	let image = TaskImage {
		extension: "png".to_string(),
		format: 71,
		generate_mips: true,
		..TaskImage::default()
	};
	host.submit_image("albedo", image, png(32, 32)).unwrap();
	let events = events_until_finished(&host, "albedo");

	assert_eq!(
		events.first(),
		Some(&HostEvent::Started {
			host_task_id: "albedo".to_string()
		})
	);

	let image_at = events
		.iter()
		.position(|e| matches!(e, HostEvent::Image { .. }))
		.expect("image response");
	assert_eq!(image_at, events.len() - 2, "response precedes TaskFinished");
	let HostEvent::Image { host_task_id, result } = &events[image_at] else {
		unreachable!()
	};
	assert_eq!(host_task_id, "albedo");
	assert_eq!(result.data.len(), 4096 + 1024 + 256 + 64);
	assert_eq!((result.width, result.height, result.mips), (32, 32, 4));

	// Final progress is exactly 1.0 and arrives right before the response.
	assert_eq!(
		events[image_at - 1],
		HostEvent::Progress {
			host_task_id: "albedo".to_string(),
			progress: 1.0
		}
	);

	let values = progress_values(&events);
	assert!(values.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {values:?}");
	assert_eq!(values.iter().filter(|&&p| p == 1.0).count(), 1);
}

#[test]
fn test_model_task_round_trip() {
	let (ctx, broker) = start_broker(1);
	let host = HostClient::connect(&ctx, broker.front_addr(), "engine").unwrap();

	let model = TaskModel {
		target_path: "meshes/rock.mesh".to_string(),
		asset_name: "rock".to_string(),
		..TaskModel::default()
	};
	host.submit_model("rock", model, vec![5; 300]).unwrap();
	let events = events_until_finished(&host, "rock");

	let model = events.iter().find_map(|e| match e {
		HostEvent::Model { result, .. } => Some(result.clone()),
		_ => None,
	});
	assert_eq!(
		model,
		Some(TaskModelResult {
			model_data: vec![5; 300],
			prefab_data: Vec::new(),
		})
	);
}

#[test]
fn test_tasks_complete_with_more_splits_than_workers() {
	let (ctx, broker) = start_broker(1);
	let host = HostClient::connect(&ctx, broker.front_addr(), "engine").unwrap();

	let image = TaskImage {
		generate_mips: true,
		..TaskImage::default()
	};
	host.submit_image("a", image, png(16, 16)).unwrap();
	host.submit_model("b", TaskModel::default(), vec![1; 8]).unwrap();

	let mut finished = Vec::new();
	let deadline = Instant::now() + WAIT;
	while finished.len() < 2 && Instant::now() < deadline {
		if let Some(HostEvent::Finished { host_task_id }) = host.next_event(Duration::from_millis(100)) {
			finished.push(host_task_id);
		}
	}
	finished.sort();
	assert_eq!(finished, vec!["a".to_string(), "b".to_string()]);
	assert_eq!(broker.queued(), 0);
}

#[test]
fn test_core_request() {
	let (ctx, broker) = start_broker(3);
	let host = HostClient::connect(&ctx, broker.front_addr(), "engine").unwrap();
	host.request_cores().unwrap();

	match host.next_event(WAIT) {
		Some(HostEvent::Cores(cores)) => {
			assert_eq!(cores.cores, 3);
			assert_eq!(cores.protocol_version, PROTOCOL_VERSION);
		}
		other => panic!("expected cores, got {other:?}"),
	}
}

#[test]
fn test_undecodable_image_finishes_without_result() {
	let (ctx, broker) = start_broker(1);
	let host = HostClient::connect(&ctx, broker.front_addr(), "engine").unwrap();

	host.submit_image("bad", TaskImage::default(), vec![0xde, 0xad, 0xbe, 0xef]).unwrap();
	let events = events_until_finished(&host, "bad");

	assert!(!events.iter().any(|e| matches!(e, HostEvent::Image { .. })));
	assert!(broker.is_running());
}

#[derive(Default)]
struct Tally {
	started: usize,
	finished: Vec<String>,
	model_bytes: usize,
}

impl HostEvents for Tally {
	fn on_started(&mut self, _host_task_id: &str) {
		self.started += 1;
	}

	fn on_model(&mut self, _host_task_id: &str, result: TaskModelResult) {
		self.model_bytes += result.model_data.len();
	}

	fn on_finished(&mut self, host_task_id: &str) {
		self.finished.push(host_task_id.to_string());
	}
}

#[test]
fn test_dispatch_to_handler() {
	let (ctx, broker) = start_broker(1);
	let host = HostClient::connect(&ctx, broker.front_addr(), "engine").unwrap();
	host.submit_model("m", TaskModel::default(), vec![3; 12]).unwrap();

	let mut tally = Tally::default();
	let deadline = Instant::now() + WAIT;
	while tally.finished.is_empty() && Instant::now() < deadline {
		host.dispatch(&mut tally, Duration::from_millis(100));
	}
	assert_eq!(tally.started, 1);
	assert_eq!(tally.model_bytes, 12);
	assert_eq!(tally.finished, vec!["m".to_string()]);
}

#[test]
fn test_shutdown_processor_stops_broker() {
	let (ctx, mut broker) = start_broker(1);
	let host = HostClient::connect(&ctx, broker.front_addr(), "engine").unwrap();
	host.shutdown_broker().unwrap();

	broker.wait();
	assert!(!broker.is_running());

	let deadline = Instant::now() + WAIT;
	let mut disconnected = false;
	while !disconnected && Instant::now() < deadline {
		disconnected = host.next_event(Duration::from_millis(50)) == Some(HostEvent::Disconnected);
	}
	assert!(disconnected);
}
