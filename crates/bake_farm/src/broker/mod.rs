//! Resource broker.
//!
//! Two threads share the [`TaskQueues`](queues::TaskQueues):
//!
//! - the communication thread owns the engine-facing and worker-facing
//!   routers, the worker pool and the dispatcher;
//! - the task-processing thread runs the splitter and joiner.
//!
//! ```no_run
//! use bake_farm::broker::{Broker, ProcessSpawner};
//! use bake_farm::config::BrokerConfig;
//! use bake_farm::splitter::DefaultSplitter;
//! use bake_net::NetworkContext;
//! use std::sync::Arc;
//!
//! let ctx = NetworkContext::new();
//! let splitter = Arc::new(DefaultSplitter::default());
//! let spawner = Arc::new(ProcessSpawner::beside_current_exe()?);
//! let mut broker = Broker::new(&ctx, &BrokerConfig::default(), spawner, splitter.clone(), splitter)?;
//! broker.start()?;
//! broker.wait();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod dispatch;
mod pool;
mod processor;
mod queues;
mod service;

pub use self::dispatch::{Dispatcher, Outbox};
pub use self::pool::{ProcessSpawner, ThreadSpawner, WorkerPool, WorkerProcess, WorkerSpawner};
pub use self::queues::{Completion, TaskQueues, WorkQueue};

use bake_net::discovery::{Beacon, BeaconRole};
use bake_net::{NetError, NetworkContext, StopHandle};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::error::{FarmError, Result};
use crate::router::RouterServer;
use crate::splitter::{TaskJoiner, TaskSplitter};

use self::processor::Processor;
use self::service::Service;

pub struct Broker {
	identity: String,
	front_addr: SocketAddr,
	back_addr: SocketAddr,
	queues: Arc<TaskQueues>,
	stop: StopHandle,
	idle_sleep: Duration,
	pending: Option<(Service, Processor)>,
	comm: Option<JoinHandle<()>>,
	tasks: Option<JoinHandle<()>>,
}

impl Broker {
	/// Bind both routers. Ports of 0 pick ephemeral ports.
	pub fn new(
		ctx: &Arc<NetworkContext>,
		config: &BrokerConfig,
		spawner: Arc<dyn WorkerSpawner>,
		splitter: Arc<dyn TaskSplitter>,
		joiner: Arc<dyn TaskJoiner>,
	) -> Result<Self> {
		let identity = config
			.identity
			.clone()
			.unwrap_or_else(|| format!("broker-{}", uuid::Uuid::new_v4()));
		let back_identity = format!("{identity}-workers");

		let front = RouterServer::bind(ctx, (config.bind_ip, config.front_port).into(), identity.clone())?
			.with_max_frame_len(config.max_frame_len);
		let back = RouterServer::bind(ctx, (config.bind_ip, config.back_port).into(), back_identity.clone())?
			.with_max_frame_len(config.max_frame_len);
		let front_addr = front.local_addr();
		let back_addr = back.local_addr();

		let worker_ip = if config.bind_ip.is_unspecified() {
			ctx.local_ip()
		} else {
			config.bind_ip
		};
		let pool = WorkerPool::new(
			spawner,
			config.worker_capacity(),
			worker_ip.to_string(),
			back_addr.port(),
			back_identity,
		);

		let beacon = if config.headless {
			Some(Beacon::new(ctx, config.beacon.clone(), BeaconRole::Producer, identity.clone())?)
		} else {
			None
		};

		let queues = Arc::new(TaskQueues::default());
		let stop = StopHandle::default();
		let service = Service::new(front, back, Arc::clone(&queues), pool, beacon, stop.clone(), config.idle_sleep());
		let processor = Processor {
			queues: Arc::clone(&queues),
			splitter,
			joiner,
		};

		tracing::debug!(%identity, %front_addr, %back_addr, "broker bound");
		Ok(Self {
			identity,
			front_addr,
			back_addr,
			queues,
			stop,
			idle_sleep: config.idle_sleep(),
			pending: Some((service, processor)),
			comm: None,
			tasks: None,
		})
	}

	/// Routing identity of the engine-facing channel.
	pub fn identity(&self) -> &str {
		&self.identity
	}

	pub fn front_addr(&self) -> SocketAddr {
		self.front_addr
	}

	pub fn back_addr(&self) -> SocketAddr {
		self.back_addr
	}

	/// Address an engine on this machine should connect to.
	pub fn local_front_addr(&self) -> SocketAddr {
		match self.front_addr {
			SocketAddr::V4(addr) if addr.ip().is_unspecified() => (Ipv4Addr::LOCALHOST, addr.port()).into(),
			other => other,
		}
	}

	/// Tasks waiting in a queue outside the dispatcher.
	pub fn queued(&self) -> usize {
		self.queues.queued()
	}

	pub fn is_running(&self) -> bool {
		self.comm.as_ref().is_some_and(|handle| !handle.is_finished())
	}

	/// Start the communication and task-processing threads.
	pub fn start(&mut self) -> Result<()> {
		let (mut service, processor) = self
			.pending
			.take()
			.ok_or(FarmError::Net(NetError::AlreadyRunning("broker")))?;

		service.start()?;
		let tasks = processor.spawn(self.stop.clone(), self.idle_sleep).map_err(FarmError::Spawn)?;
		self.tasks = Some(tasks);

		let comm = std::thread::Builder::new()
			.name("bake-broker-comm".to_string())
			.spawn(move || service.run())
			.map_err(FarmError::Spawn);
		match comm {
			Ok(handle) => {
				self.comm = Some(handle);
				Ok(())
			}
			Err(err) => {
				self.stop();
				Err(err)
			}
		}
	}

	/// Block until the broker stops by itself (`ShutdownProcessor`, or losing
	/// its engine when headless), then tear down.
	pub fn wait(&mut self) {
		if let Some(handle) = self.comm.take() {
			let _ = handle.join();
		}
		self.stop();
	}

	pub fn stop(&mut self) {
		self.stop.stop();
		if let Some(handle) = self.comm.take() {
			let _ = handle.join();
		}
		if let Some(handle) = self.tasks.take() {
			let _ = handle.join();
		}
	}
}

impl Drop for Broker {
	fn drop(&mut self) {
		self.stop();
	}
}
