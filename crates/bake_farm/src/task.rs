//! Task data model: requests, sub-tasks, results and per-task bundles.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::protocol::SubTaskHeader;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
	Image,
	Model,
}

// =============================================================================
// Requests
// =============================================================================

/// Image encode settings sent by the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskImage {
	/// Source file extension, used when the payload format cannot be sniffed.
	pub extension: String,
	/// Requested block format; 0 lets the encoder choose.
	pub format: i32,
	pub generate_mips: bool,
	pub flip_normal: bool,
	pub alpha_clipped: bool,
}

/// Model encode settings sent by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskModel {
	pub target_path: String,
	pub asset_name: String,
	pub scale: Vec3,
	pub rotation: Quat,
}

impl Default for TaskModel {
	fn default() -> Self {
		Self {
			target_path: String::new(),
			asset_name: String::new(),
			scale: Vec3::ONE,
			rotation: Quat::IDENTITY,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TaskSpec {
	Image(TaskImage),
	Model(TaskModel),
}

/// One unit of work accepted by the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct Task {
	/// Routing identity of the requesting engine.
	pub host_id: String,
	/// Engine-side id, echoed in every notification.
	pub host_task_id: String,
	/// Broker-side unique id.
	pub task_id: String,
	pub spec: TaskSpec,
	pub data: Vec<u8>,
}

impl Task {
	pub fn kind(&self) -> TaskKind {
		match self.spec {
			TaskSpec::Image(_) => TaskKind::Image,
			TaskSpec::Model(_) => TaskKind::Model,
		}
	}
}

// =============================================================================
// Sub-tasks
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitImageTask {
	pub width: u32,
	pub height: u32,
	/// Bytes per row of `data`.
	pub stride: u32,
	pub source_format: i32,
	pub target_format: i32,
	pub original_format: i32,
	pub mip_count: u32,
	pub mip: u32,
	pub part_id: u32,
	pub part_width: u32,
	pub part_height: u32,
	pub flip_normal: bool,
	pub alpha_clipped: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitModelTask {
	pub target_path: String,
	pub asset_name: String,
	pub scale: Vec3,
	pub rotation: Quat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SplitWork {
	Image(SplitImageTask),
	Model(SplitModelTask),
}

/// Payload frame of a `TaskRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitTaskBody {
	pub work: SplitWork,
	pub data: Vec<u8>,
}

/// Where a sub-task is in its life. Exactly one phase at a time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SplitPhase {
	/// No worker requested yet.
	#[default]
	Pending,
	/// A worker was spawned for this sub-task and has not been bound.
	AwaitingWorker,
	Processing { worker: String },
	/// Result received, worker not yet released.
	Done { worker: String },
	/// Worker released with a `DoneRequest`.
	Returned,
}

/// One dispatchable piece of a [`Task`].
#[derive(Clone, Debug, PartialEq)]
pub struct SplitTask {
	pub header: SubTaskHeader,
	pub body: SplitTaskBody,
	/// Cost weight for aggregate progress.
	pub bytes: u64,
	pub progress: f32,
	pub progress_message: String,
	pub phase: SplitPhase,
	pub result: Option<SplitTaskResult>,
}

impl SplitTask {
	pub fn new(header: SubTaskHeader, work: SplitWork, data: Vec<u8>, bytes: u64) -> Self {
		Self {
			header,
			body: SplitTaskBody { work, data },
			bytes,
			progress: 0.0,
			progress_message: String::new(),
			phase: SplitPhase::Pending,
			result: None,
		}
	}

	pub fn sub_task_id(&self) -> &str {
		&self.header.sub_task_id
	}

	pub fn requested_worker(&self) -> bool {
		!matches!(self.phase, SplitPhase::Pending)
	}

	pub fn is_processing(&self) -> bool {
		matches!(self.phase, SplitPhase::Processing { .. })
	}

	pub fn is_done(&self) -> bool {
		matches!(self.phase, SplitPhase::Done { .. } | SplitPhase::Returned)
	}

	pub fn returned_worker(&self) -> bool {
		matches!(self.phase, SplitPhase::Returned)
	}

	/// Worker currently bound to this sub-task, if any.
	pub fn worker(&self) -> Option<&str> {
		match &self.phase {
			SplitPhase::Processing { worker } | SplitPhase::Done { worker } => Some(worker),
			_ => None,
		}
	}
}

// =============================================================================
// Results
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitImageResult {
	pub width: u32,
	pub height: u32,
	pub format: i32,
	pub mip_count: u32,
	pub mip: u32,
	pub part_id: u32,
	pub part_width: u32,
	pub part_height: u32,
	pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitModelResult {
	pub model_data: Vec<u8>,
	pub prefab_data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitTaskResult {
	Image(SplitImageResult),
	Model(SplitModelResult),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskImageResult {
	pub data: Vec<u8>,
	pub width: u32,
	pub height: u32,
	pub mips: u32,
	pub format: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskModelResult {
	pub model_data: Vec<u8>,
	pub prefab_data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutput {
	Image(TaskImageResult),
	Model(TaskModelResult),
}

/// Joined artifact ready for delivery to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskResult {
	pub host_id: String,
	pub host_task_id: String,
	pub task_id: String,
	pub output: TaskOutput,
}

impl TaskResult {
	pub fn byte_size(&self) -> usize {
		match &self.output {
			TaskOutput::Image(image) => image.data.len(),
			TaskOutput::Model(model) => model.model_data.len() + model.prefab_data.len(),
		}
	}
}

// =============================================================================
// Bundles and progress
// =============================================================================

/// Highest value reported while any sub-task is unfinished.
pub const MAX_PARTIAL_PROGRESS: f32 = 1.0 - f32::EPSILON;

/// Byte-weighted progress over `(progress, bytes, done)` parts.
///
/// Done parts count as complete. The result is exactly `1.0` only when every
/// part is done; otherwise it is capped at [`MAX_PARTIAL_PROGRESS`]. With a
/// zero total weight the fraction of done parts is used.
pub fn weighted_progress<I>(parts: I) -> f32
where
	I: IntoIterator<Item = (f32, u64, bool)>,
{
	let mut weighted = 0.0f64;
	let mut total = 0u64;
	let mut count = 0usize;
	let mut done = 0usize;

	for (progress, bytes, is_done) in parts {
		let progress = if is_done { 1.0 } else { f64::from(progress.clamp(0.0, 1.0)) };
		weighted += progress * bytes as f64;
		total += bytes;
		count += 1;
		done += usize::from(is_done);
	}

	if count == 0 {
		return 0.0;
	}
	if done == count {
		return 1.0;
	}

	let value = if total == 0 {
		done as f64 / count as f64
	} else {
		weighted / total as f64
	};
	(value as f32).min(MAX_PARTIAL_PROGRESS)
}

/// Progress change that should be forwarded to the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressUpdate {
	pub progress: f32,
	/// Set when the latest progress message changed.
	pub message: Option<String>,
}

/// A task together with its sub-tasks while they are in flight.
#[derive(Clone, Debug)]
pub struct TaskBundle {
	pub task: Task,
	pub splits: Vec<SplitTask>,
	pub total_bytes: u64,
	latest_message: String,
	last_reported: Option<f32>,
	last_reported_message: String,
}

impl TaskBundle {
	pub fn new(task: Task, splits: Vec<SplitTask>) -> Self {
		let total_bytes = splits.iter().map(|s| s.bytes).sum();
		Self {
			task,
			splits,
			total_bytes,
			latest_message: String::new(),
			last_reported: None,
			last_reported_message: String::new(),
		}
	}

	pub fn progress(&self) -> f32 {
		weighted_progress(self.splits.iter().map(|s| (s.progress, s.bytes, s.is_done())))
	}

	/// Every sub-task has a result.
	pub fn is_complete(&self) -> bool {
		self.splits.iter().all(SplitTask::is_done)
	}

	pub fn split_mut(&mut self, sub_task_id: &str) -> Option<&mut SplitTask> {
		self.splits.iter_mut().find(|s| s.header.sub_task_id == sub_task_id)
	}

	/// Record a worker progress report.
	pub fn set_progress(&mut self, sub_task_id: &str, progress: f32, message: Option<&str>) -> bool {
		let Some(split) = self.split_mut(sub_task_id) else {
			return false;
		};
		split.progress = progress.clamp(0.0, 1.0);
		if let Some(message) = message {
			split.progress_message = message.to_string();
			self.latest_message = message.to_string();
		}
		true
	}

	/// Aggregate progress if it or the latest message changed since the last
	/// call.
	pub fn take_progress_update(&mut self) -> Option<ProgressUpdate> {
		let progress = self.progress();
		let message_changed = self.latest_message != self.last_reported_message;
		if self.last_reported == Some(progress) && !message_changed {
			return None;
		}

		self.last_reported = Some(progress);
		let message = if message_changed {
			self.last_reported_message = self.latest_message.clone();
			Some(self.latest_message.clone())
		} else {
			None
		};
		Some(ProgressUpdate { progress, message })
	}

	/// Results in split order. `None` while any sub-task lacks a result.
	pub fn take_results(&mut self) -> Option<Vec<SplitTaskResult>> {
		if !self.splits.iter().all(|s| s.result.is_some()) {
			return None;
		}
		Some(self.splits.iter_mut().filter_map(|s| s.result.take()).collect())
	}
}

#[cfg(test)]
#[path = "task_test.rs"]
mod task_test;
