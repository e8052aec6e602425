//! Worker pool: spawning, readiness and disposal.
//!
//! Workers are never reused. One is spawned per sub-task, bound when it says
//! `Helo`, and released after its result arrives. Released processes are kept
//! in a retiring list until they exit. A worker whose connection is lost is
//! terminated outright.

use bake_net::{NetworkContext, StopHandle};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{FarmError, Result};
use crate::worker::{Encoder, Worker, WorkerOptions};

/// Handle to a running worker.
pub trait WorkerProcess: Send {
	/// `true` once the worker has exited.
	fn try_reap(&mut self) -> bool;

	fn terminate(&mut self);
}

/// Starts workers that connect back with the given options.
pub trait WorkerSpawner: Send + Sync {
	fn spawn(&self, options: &WorkerOptions) -> Result<Box<dyn WorkerProcess>>;
}

// =============================================================================
// Process spawner
// =============================================================================

impl WorkerProcess for Child {
	fn try_reap(&mut self) -> bool {
		!matches!(self.try_wait(), Ok(None))
	}

	fn terminate(&mut self) {
		let _ = self.kill();
		let _ = self.wait();
	}
}

/// Launches the `bake_worker` executable.
pub struct ProcessSpawner {
	executable: PathBuf,
}

impl ProcessSpawner {
	pub fn new(executable: impl Into<PathBuf>) -> Self {
		Self {
			executable: executable.into(),
		}
	}

	/// `bake_worker` in the directory of the running executable.
	pub fn beside_current_exe() -> io::Result<Self> {
		let current = std::env::current_exe()?;
		let dir = current.parent().map(PathBuf::from).unwrap_or_default();
		Self::locate(&dir)
	}

	/// `bake_worker` in `dir`. Fails up front when the binary is missing so a
	/// misconfigured broker never starts.
	pub fn locate(dir: &Path) -> io::Result<Self> {
		let executable = dir.join(format!("bake_worker{}", std::env::consts::EXE_SUFFIX));
		if !executable.is_file() {
			return Err(io::Error::new(
				io::ErrorKind::NotFound,
				format!("worker executable not found: {}", executable.display()),
			));
		}
		Ok(Self::new(executable))
	}
}

impl WorkerSpawner for ProcessSpawner {
	fn spawn(&self, options: &WorkerOptions) -> Result<Box<dyn WorkerProcess>> {
		let child = Command::new(&self.executable)
			.args(options.to_args())
			.stdin(Stdio::null())
			.spawn()
			.map_err(FarmError::Spawn)?;
		tracing::debug!(worker = %options.id, pid = child.id(), "spawned worker process");
		Ok(Box::new(child))
	}
}

// =============================================================================
// In-process spawner
// =============================================================================

struct WorkerThread {
	handle: Option<JoinHandle<()>>,
	cancel: StopHandle,
}

impl WorkerProcess for WorkerThread {
	fn try_reap(&mut self) -> bool {
		match self.handle.take() {
			Some(handle) if handle.is_finished() => {
				let _ = handle.join();
				true
			}
			Some(handle) => {
				self.handle = Some(handle);
				false
			}
			None => true,
		}
	}

	fn terminate(&mut self) {
		self.cancel.stop();
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}

/// Runs each worker on a thread of this process.
pub struct ThreadSpawner {
	ctx: Arc<NetworkContext>,
	encoder: Arc<dyn Encoder>,
}

impl ThreadSpawner {
	pub fn new(ctx: &Arc<NetworkContext>, encoder: Arc<dyn Encoder>) -> Self {
		Self {
			ctx: Arc::clone(ctx),
			encoder,
		}
	}
}

impl WorkerSpawner for ThreadSpawner {
	fn spawn(&self, options: &WorkerOptions) -> Result<Box<dyn WorkerProcess>> {
		let ctx = Arc::clone(&self.ctx);
		let encoder = Arc::clone(&self.encoder);
		let options = options.clone();
		let cancel = StopHandle::default();
		let worker_cancel = cancel.clone();
		let handle = std::thread::Builder::new()
			.name(format!("bake-worker-{}", &options.id[..8.min(options.id.len())]))
			.spawn(move || {
				let id = options.id.clone();
				let worker = Worker::connect(&ctx, options, encoder).map(|w| w.with_cancel(worker_cancel));
				match worker.and_then(Worker::run) {
					Ok(completed) => tracing::debug!(worker = %id, completed, "worker thread exited"),
					Err(err) => tracing::warn!(worker = %id, %err, "worker thread failed"),
				}
			})
			.map_err(FarmError::Spawn)?;
		Ok(Box::new(WorkerThread {
			handle: Some(handle),
			cancel,
		}))
	}
}

// =============================================================================
// Pool
// =============================================================================

struct PooledWorker {
	id: String,
	ready: bool,
	bound: bool,
	process: Box<dyn WorkerProcess>,
}

pub struct WorkerPool {
	spawner: Arc<dyn WorkerSpawner>,
	capacity: usize,
	broker_ip: String,
	broker_port: u16,
	host_id: String,
	workers: Vec<PooledWorker>,
	retiring: Vec<Box<dyn WorkerProcess>>,
}

impl WorkerPool {
	pub fn new(spawner: Arc<dyn WorkerSpawner>, capacity: usize, broker_ip: String, broker_port: u16, host_id: String) -> Self {
		Self {
			spawner,
			capacity,
			broker_ip,
			broker_port,
			host_id,
			workers: Vec::new(),
			retiring: Vec::new(),
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Workers spawned and not yet released.
	pub fn active_count(&self) -> usize {
		self.workers.len()
	}

	pub fn can_grow(&self) -> bool {
		self.workers.len() < self.capacity
	}

	/// Workers spawned but not yet bound to a sub-task.
	pub fn unbound_count(&self) -> usize {
		self.workers.iter().filter(|w| !w.bound).count()
	}

	pub fn contains(&self, id: &str) -> bool {
		self.workers.iter().any(|w| w.id == id)
	}

	/// Start a new worker. It becomes usable after its `Helo`.
	pub fn spawn(&mut self) -> Result<String> {
		let options = WorkerOptions {
			ip: self.broker_ip.clone(),
			port: self.broker_port,
			id: uuid::Uuid::new_v4().to_string(),
			host_id: self.host_id.clone(),
		};
		let process = self.spawner.spawn(&options)?;
		tracing::info!(worker = %options.id, active = self.workers.len() + 1, capacity = self.capacity, "started worker");
		self.workers.push(PooledWorker {
			id: options.id.clone(),
			ready: false,
			bound: false,
			process,
		});
		Ok(options.id)
	}

	/// Record a `Helo`. Returns `false` for unknown workers.
	pub fn mark_ready(&mut self, id: &str) -> bool {
		match self.workers.iter_mut().find(|w| w.id == id) {
			Some(worker) => {
				if !worker.ready {
					tracing::debug!(worker = %id, "worker ready");
				}
				worker.ready = true;
				true
			}
			None => false,
		}
	}

	/// Bind the oldest ready, unbound worker.
	pub fn take_ready(&mut self) -> Option<String> {
		let worker = self.workers.iter_mut().find(|w| w.ready && !w.bound)?;
		worker.bound = true;
		Some(worker.id.clone())
	}

	/// Release a worker after its sub-task completed.
	pub fn dispose(&mut self, id: &str) {
		if let Some(index) = self.workers.iter().position(|w| w.id == id) {
			let worker = self.workers.remove(index);
			self.retiring.push(worker.process);
		}
	}

	/// Terminate and drop a worker that can no longer be reached. Returns
	/// whether it was bound to a sub-task.
	pub fn forget(&mut self, id: &str) -> Option<bool> {
		let index = self.workers.iter().position(|w| w.id == id)?;
		let mut worker = self.workers.remove(index);
		worker.process.terminate();
		Some(worker.bound)
	}

	/// Collect exited workers. Returns the ids of unbound workers that exited
	/// before taking a sub-task; their slots are free again.
	pub fn reap(&mut self) -> Vec<String> {
		self.retiring.retain_mut(|process| !process.try_reap());

		let mut exited = Vec::new();
		self.workers.retain_mut(|worker| {
			if worker.bound || !worker.process.try_reap() {
				return true;
			}
			exited.push(worker.id.clone());
			false
		});
		exited
	}

	pub fn retiring_count(&self) -> usize {
		self.retiring.len()
	}

	pub fn shutdown(&mut self) {
		for mut worker in self.workers.drain(..) {
			worker.process.terminate();
		}
		for mut process in self.retiring.drain(..) {
			process.terminate();
		}
	}
}

impl Drop for WorkerPool {
	fn drop(&mut self) {
		self.shutdown();
	}
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
