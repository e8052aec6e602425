//! Engine-side scheduler over every broker on the network.
//!
//! A [`ResourceHost`] listens on the beacon for brokers, keeps one
//! [`HostClient`] per broker and hands each queued task to a broker with
//! nothing in flight. When no broker advertises itself within the startup
//! delay it launches a headless broker through a [`BrokerLauncher`] and asks
//! it to shut down again on [`close`](ResourceHost::close).
//!
//! ```no_run
//! use bake_farm::config::HostConfig;
//! use bake_farm::resource_host::{BrokerLauncher, ProcessLauncher, ResourceHost};
//! use bake_farm::task::TaskModel;
//! use bake_net::NetworkContext;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let ctx = NetworkContext::new();
//! let launcher: Arc<dyn BrokerLauncher> = Arc::new(ProcessLauncher::beside_current_exe()?);
//! let mut host = ResourceHost::new(&ctx, HostConfig::default(), Some(launcher))?;
//! host.submit_model("rock", TaskModel::default(), std::fs::read("rock.fbx")?);
//! while let Some(event) = host.next_event(Duration::from_secs(30)) {
//!     println!("{event:?}");
//! }
//! host.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use bake_net::discovery::{Beacon, BeaconEvent, BeaconRole};
use bake_net::NetworkContext;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broker::{Broker, WorkerSpawner};
use crate::config::{BrokerConfig, HostConfig};
use crate::error::{FarmError, Result};
use crate::host::{broker_addr, HostClient, HostEvent};
use crate::splitter::{TaskJoiner, TaskSplitter};
use crate::task::{TaskImage, TaskModel};

const POLL_SLEEP: Duration = Duration::from_millis(5);

// =============================================================================
// Local broker
// =============================================================================

/// A broker started by this host.
pub trait LocalBroker: Send {
	fn is_running(&mut self) -> bool;

	/// Wait up to `grace` for the broker to exit, then force it down. Returns
	/// `true` if it exited by itself.
	fn stop(&mut self, grace: Duration) -> bool;
}

/// Starts a headless broker that advertises as `identity` and serves engines
/// on `front_port`.
pub trait BrokerLauncher: Send + Sync {
	fn launch(&self, identity: &str, front_port: u16) -> Result<Box<dyn LocalBroker>>;
}

fn wait_for_exit(broker: &mut dyn LocalBroker, grace: Duration) -> bool {
	let deadline = Instant::now() + grace;
	while broker.is_running() {
		if Instant::now() >= deadline {
			return false;
		}
		std::thread::sleep(POLL_SLEEP);
	}
	true
}

struct BrokerProcess(Child);

impl LocalBroker for BrokerProcess {
	fn is_running(&mut self) -> bool {
		matches!(self.0.try_wait(), Ok(None))
	}

	fn stop(&mut self, grace: Duration) -> bool {
		let exited = wait_for_exit(self, grace);
		if !exited {
			let _ = self.0.kill();
		}
		let _ = self.0.wait();
		exited
	}
}

/// Launches the `bake_broker` executable.
pub struct ProcessLauncher {
	executable: PathBuf,
}

impl ProcessLauncher {
	pub fn new(executable: impl Into<PathBuf>) -> Self {
		Self {
			executable: executable.into(),
		}
	}

	/// `bake_broker` in the directory of the running executable.
	pub fn beside_current_exe() -> io::Result<Self> {
		let current = std::env::current_exe()?;
		let dir = current.parent().map(PathBuf::from).unwrap_or_default();
		Self::locate(&dir)
	}

	pub fn locate(dir: &Path) -> io::Result<Self> {
		let executable = dir.join(format!("bake_broker{}", std::env::consts::EXE_SUFFIX));
		if !executable.is_file() {
			return Err(io::Error::new(
				io::ErrorKind::NotFound,
				format!("broker executable not found: {}", executable.display()),
			));
		}
		Ok(Self::new(executable))
	}

	fn args(identity: &str, front_port: u16) -> Vec<String> {
		vec![
			"--headless".to_string(),
			format!("--identity={identity}"),
			format!("--front-port={front_port}"),
		]
	}
}

impl BrokerLauncher for ProcessLauncher {
	fn launch(&self, identity: &str, front_port: u16) -> Result<Box<dyn LocalBroker>> {
		let child = Command::new(&self.executable)
			.args(Self::args(identity, front_port))
			.stdin(Stdio::null())
			.spawn()
			.map_err(FarmError::Launch)?;
		tracing::debug!(%identity, pid = child.id(), "launched broker process");
		Ok(Box::new(BrokerProcess(child)))
	}
}

impl LocalBroker for Broker {
	fn is_running(&mut self) -> bool {
		Broker::is_running(self)
	}

	fn stop(&mut self, grace: Duration) -> bool {
		let exited = wait_for_exit(self, grace);
		Broker::stop(self);
		exited
	}
}

/// Runs headless brokers on threads of the calling process.
pub struct InProcessLauncher {
	ctx: Arc<NetworkContext>,
	config: BrokerConfig,
	spawner: Arc<dyn WorkerSpawner>,
	splitter: Arc<dyn TaskSplitter>,
	joiner: Arc<dyn TaskJoiner>,
}

impl InProcessLauncher {
	pub fn new(
		ctx: &Arc<NetworkContext>,
		config: BrokerConfig,
		spawner: Arc<dyn WorkerSpawner>,
		splitter: Arc<dyn TaskSplitter>,
		joiner: Arc<dyn TaskJoiner>,
	) -> Self {
		Self {
			ctx: Arc::clone(ctx),
			config,
			spawner,
			splitter,
			joiner,
		}
	}
}

impl BrokerLauncher for InProcessLauncher {
	fn launch(&self, identity: &str, front_port: u16) -> Result<Box<dyn LocalBroker>> {
		let config = BrokerConfig {
			identity: Some(identity.to_string()),
			front_port,
			headless: true,
			..self.config.clone()
		};
		let mut broker = Broker::new(
			&self.ctx,
			&config,
			Arc::clone(&self.spawner),
			Arc::clone(&self.splitter),
			Arc::clone(&self.joiner),
		)?;
		broker.start()?;
		Ok(Box::new(broker))
	}
}

// =============================================================================
// Resource host
// =============================================================================

#[derive(Clone)]
enum Request {
	Image(TaskImage),
	Model(TaskModel),
}

#[derive(Clone)]
struct HostTask {
	host_task_id: String,
	request: Request,
	data: Vec<u8>,
}

impl HostTask {
	fn send(&self, client: &HostClient) -> Result<()> {
		match &self.request {
			Request::Image(image) => client.submit_image(self.host_task_id.clone(), image.clone(), self.data.clone()),
			Request::Model(model) => client.submit_model(self.host_task_id.clone(), model.clone(), self.data.clone()),
		}
	}
}

struct BrokerSlot {
	peer: String,
	client: HostClient,
	cores: u32,
	/// Submitted and not yet finished; kept for resubmission if the broker
	/// is lost.
	active: Vec<HostTask>,
}

impl BrokerSlot {
	fn is_idle(&self) -> bool {
		self.active.is_empty()
	}
}

pub struct ResourceHost {
	ctx: Arc<NetworkContext>,
	id: String,
	config: HostConfig,
	beacon: Beacon,
	brokers: Vec<BrokerSlot>,
	queue: VecDeque<HostTask>,
	/// Notifications raised by the host itself rather than a broker.
	events: VecDeque<HostEvent>,
	launcher: Option<Arc<dyn BrokerLauncher>>,
	local: Option<(String, Box<dyn LocalBroker>)>,
	started: Instant,
	fallback_checked: bool,
}

impl ResourceHost {
	/// Start a consumer beacon. Brokers are connected as they advertise.
	pub fn new(
		ctx: &Arc<NetworkContext>,
		config: HostConfig,
		launcher: Option<Arc<dyn BrokerLauncher>>,
	) -> Result<Self> {
		let id = config
			.identity
			.clone()
			.unwrap_or_else(|| format!("engine-{}", uuid::Uuid::new_v4()));
		let mut beacon = Beacon::new(ctx, config.beacon.clone(), BeaconRole::Consumer, id.clone())?;
		beacon.start()?;
		tracing::info!(%id, startup_delay = ?config.startup_delay(), "resource host started");

		Ok(Self {
			ctx: Arc::clone(ctx),
			id,
			config,
			beacon,
			brokers: Vec::new(),
			queue: VecDeque::new(),
			events: VecDeque::new(),
			launcher,
			local: None,
			started: Instant::now(),
			fallback_checked: false,
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn broker_count(&self) -> usize {
		self.brokers.len()
	}

	/// Cores reported by every connected broker.
	pub fn total_cores(&self) -> u32 {
		self.brokers.iter().map(|slot| slot.cores).sum()
	}

	/// Tasks waiting for an idle broker.
	pub fn pending(&self) -> usize {
		self.queue.len()
	}

	pub fn has_local_broker(&self) -> bool {
		self.local.is_some()
	}

	/// Identity of the broker currently running `host_task_id`.
	pub fn broker_of(&self, host_task_id: &str) -> Option<&str> {
		self.brokers
			.iter()
			.find(|slot| slot.active.iter().any(|task| task.host_task_id == host_task_id))
			.map(|slot| slot.peer.as_str())
	}

	/// Connect to a broker at a known address. Brokers found over the beacon
	/// are added the same way.
	pub fn add_broker(&mut self, peer: impl Into<String>, addr: SocketAddr) -> Result<()> {
		let peer = peer.into();
		if self.brokers.iter().any(|slot| slot.peer == peer) {
			return Ok(());
		}
		let client = HostClient::connect(&self.ctx, addr, self.id.clone())?;
		client.request_cores()?;
		tracing::info!(%peer, %addr, "broker added");
		self.brokers.push(BrokerSlot {
			peer,
			client,
			cores: 0,
			active: Vec::new(),
		});
		self.assign();
		Ok(())
	}

	pub fn submit_image(&mut self, host_task_id: impl Into<String>, image: TaskImage, data: Vec<u8>) {
		self.enqueue(HostTask {
			host_task_id: host_task_id.into(),
			request: Request::Image(image),
			data,
		});
	}

	pub fn submit_model(&mut self, host_task_id: impl Into<String>, model: TaskModel, data: Vec<u8>) {
		self.enqueue(HostTask {
			host_task_id: host_task_id.into(),
			request: Request::Model(model),
			data,
		});
	}

	fn enqueue(&mut self, task: HostTask) {
		self.queue.push_back(task);
		self.assign();
	}

	/// Next notification from any broker, waiting up to `timeout`. Discovery,
	/// the local fallback and task assignment advance while waiting. Broker
	/// disconnects are handled here and never surface as
	/// [`HostEvent::Disconnected`].
	pub fn next_event(&mut self, timeout: Duration) -> Option<HostEvent> {
		let deadline = Instant::now() + timeout;
		loop {
			self.watch_beacon();
			self.check_fallback();
			self.assign();
			if let Some(event) = self.poll_brokers() {
				return Some(event);
			}
			if Instant::now() >= deadline {
				return None;
			}
			std::thread::sleep(POLL_SLEEP);
		}
	}

	fn watch_beacon(&mut self) {
		loop {
			let Ok(event) = self.beacon.events().try_recv() else {
				break;
			};
			match event {
				BeaconEvent::Discovered(peer) if peer.role == BeaconRole::Producer => {
					let added = broker_addr(&peer.ip, self.config.front_port)
						.and_then(|addr| self.add_broker(peer.id.clone(), addr));
					if let Err(err) = added {
						tracing::warn!(peer = %peer.id, ip = %peer.ip, %err, "failed to connect to broker");
					}
				}
				BeaconEvent::Lost(peer) if peer.role == BeaconRole::Producer => self.remove_broker(&peer.id),
				other => tracing::debug!(?other, "beacon event"),
			}
		}
	}

	fn check_fallback(&mut self) {
		if self.fallback_checked || self.started.elapsed() < self.config.startup_delay() {
			return;
		}
		self.fallback_checked = true;
		if !self.brokers.is_empty() {
			return;
		}
		let Some(launcher) = &self.launcher else {
			tracing::warn!("no broker found and no local broker configured");
			return;
		};

		let identity = format!("broker-{}", uuid::Uuid::new_v4());
		match launcher.launch(&identity, self.config.front_port) {
			Ok(broker) => {
				tracing::info!(%identity, port = self.config.front_port, "no broker found, started a local one");
				self.local = Some((identity, broker));
			}
			Err(err) => tracing::error!(%err, "failed to start local broker"),
		}
	}

	/// Hand queued tasks to idle brokers, oldest first.
	fn assign(&mut self) {
		while !self.queue.is_empty() {
			let Some(slot) = self.brokers.iter_mut().find(|slot| slot.is_idle()) else {
				return;
			};
			let Some(task) = self.queue.pop_front() else {
				return;
			};

			match task.send(&slot.client) {
				Ok(()) => {
					tracing::debug!(broker = %slot.peer, host_task = %task.host_task_id, "task assigned");
					slot.active.push(task);
				}
				Err(FarmError::Disconnected) => {
					let peer = slot.peer.clone();
					self.queue.push_front(task);
					self.remove_broker(&peer);
				}
				Err(err) => {
					// No broker could take it either; finish it unprocessed.
					tracing::error!(host_task = %task.host_task_id, %err, "task cannot be submitted");
					self.events.push_back(HostEvent::Finished {
						host_task_id: task.host_task_id,
					});
				}
			}
		}
	}

	fn poll_brokers(&mut self) -> Option<HostEvent> {
		if let Some(event) = self.events.pop_front() {
			return Some(event);
		}

		let mut lost = None;
		let mut found = None;
		for slot in &mut self.brokers {
			match slot.client.next_event(Duration::ZERO) {
				None => {}
				Some(HostEvent::Disconnected) => {
					lost = Some(slot.peer.clone());
					break;
				}
				Some(HostEvent::Cores(cores)) => {
					tracing::info!(broker = %slot.peer, cores = cores.cores, "broker capacity");
					slot.cores = cores.cores;
				}
				Some(event) => {
					if let HostEvent::Finished { host_task_id } = &event {
						slot.active.retain(|task| &task.host_task_id != host_task_id);
					}
					found = Some(event);
					break;
				}
			}
		}

		if let Some(peer) = lost {
			self.remove_broker(&peer);
		}
		found
	}

	/// Drop a broker and put its unfinished tasks back at the head of the
	/// queue.
	fn remove_broker(&mut self, peer: &str) {
		let Some(index) = self.brokers.iter().position(|slot| slot.peer == peer) else {
			return;
		};
		let slot = self.brokers.remove(index);
		tracing::info!(%peer, requeued = slot.active.len(), "broker lost");
		for task in slot.active.into_iter().rev() {
			self.queue.push_front(task);
		}
		slot.client.close();
	}

	/// Stop a local broker, disconnect from every broker and leave the beacon.
	pub fn close(mut self) {
		self.teardown();
	}

	fn teardown(&mut self) {
		if let Some((identity, mut broker)) = self.local.take() {
			match self.brokers.iter().find(|slot| slot.peer == identity) {
				Some(slot) => {
					if let Err(err) = slot.client.shutdown_broker() {
						tracing::warn!(%identity, %err, "failed to ask local broker to shut down");
					}
				}
				None => tracing::debug!(%identity, "local broker never connected"),
			}
			let graceful = broker.stop(self.config.shutdown_grace());
			tracing::info!(%identity, graceful, "local broker stopped");
		}
		for slot in self.brokers.drain(..) {
			slot.client.close();
		}
		self.beacon.stop();
	}
}

impl Drop for ResourceHost {
	fn drop(&mut self) {
		self.teardown();
	}
}
