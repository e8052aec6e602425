//! Wire vocabulary of the two router channels.
//!
//! Every message is a list of frames. Frame 0 is the message type, later
//! frames are typed payload records. All records are serialized with
//! postcard. The engine-facing channel speaks [`HostMessageType`], the
//! worker-facing channel speaks [`WorkerMessageType`]; the two never mix.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FarmError, Result};
use crate::splitter::MAX_IMAGE_SIZE;
use crate::task::{SplitTaskResult, TaskImage, TaskImageResult, TaskKind, TaskModel, TaskModelResult};

/// Bumped whenever a record layout changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest router frame. A joined response for a [`MAX_IMAGE_SIZE`] texture
/// carries the RGBA8 top level plus its whole mip chain (under 4/3 of the
/// top level); twice the top level leaves room for records and envelope.
pub const MAX_FRAME_LEN: usize = 2 * 4 * (MAX_IMAGE_SIZE as usize) * (MAX_IMAGE_SIZE as usize);

// =============================================================================
// Framing
// =============================================================================

/// One length-prefixed frame on a router connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
	/// Routing identity of the sender.
	pub identity: String,
	pub frames: Vec<Vec<u8>>,
}

impl WireEnvelope {
	pub fn to_bytes(&self) -> Result<Vec<u8>> {
		Ok(postcard::to_allocvec(self)?)
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
		Ok(postcard::from_bytes(bytes)?)
	}
}

/// Multi-part message: a type frame followed by payload frames.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
	frames: Vec<Vec<u8>>,
}

impl Message {
	/// Start a message with its type frame.
	pub fn new<T: Serialize>(kind: &T) -> Result<Self> {
		Ok(Self {
			frames: vec![postcard::to_allocvec(kind)?],
		})
	}

	pub fn from_frames(frames: Vec<Vec<u8>>) -> Self {
		Self { frames }
	}

	/// Append a serialized payload record.
	pub fn with<T: Serialize>(mut self, payload: &T) -> Result<Self> {
		self.frames.push(postcard::to_allocvec(payload)?);
		Ok(self)
	}

	/// Append an already serialized frame verbatim.
	pub fn with_raw(mut self, frame: Vec<u8>) -> Self {
		self.frames.push(frame);
		self
	}

	pub fn frames(&self) -> &[Vec<u8>] {
		&self.frames
	}

	pub fn into_frames(self) -> Vec<Vec<u8>> {
		self.frames
	}

	/// Decode the type frame.
	pub fn kind<T: DeserializeOwned>(&self) -> Result<T> {
		let frame = self
			.frames
			.first()
			.ok_or_else(|| FarmError::Protocol("message has no type frame".to_string()))?;
		Ok(postcard::from_bytes(frame)?)
	}

	/// Decode payload `index` (0 is the first frame after the type).
	pub fn payload<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
		Ok(postcard::from_bytes(self.raw_payload(index)?)?)
	}

	pub fn raw_payload(&self, index: usize) -> Result<&[u8]> {
		self.frames.get(index + 1).map(Vec::as_slice).ok_or_else(|| {
			FarmError::Protocol(format!(
				"expected at least {} frames, got {}",
				index + 2,
				self.frames.len()
			))
		})
	}
}

/// A message together with the routing identity of its peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
	pub address: String,
	pub message: Message,
}

// =============================================================================
// Engine <-> broker
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostMessageType {
	CoreRequest,
	CoreResponse,
	TaskImageRequest,
	TaskImageResponse,
	TaskModelRequest,
	TaskModelResponse,
	TaskStarted,
	TaskProgress,
	TaskProgressMessage,
	TaskFinished,
	ShutdownProcessor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreResponse {
	/// Number of workers the broker will run concurrently.
	pub cores: u32,
	pub protocol_version: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
	pub host_task_id: String,
	pub image: TaskImage,
	pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
	pub host_task_id: String,
	pub model: TaskModel,
	pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResponse {
	pub host_task_id: String,
	pub result: TaskImageResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
	pub host_task_id: String,
	pub result: TaskModelResult,
}

/// Payload of `TaskStarted` and `TaskFinished`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNotice {
	pub host_task_id: String,
}

/// Progress of a task (engine channel) or sub-task (worker channel).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
	pub id: String,
	pub progress: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessageReport {
	pub id: String,
	pub progress: f32,
	pub message: String,
}

// =============================================================================
// Broker <-> worker
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMessageType {
	Helo,
	TaskRequest,
	TaskProgress,
	TaskProgressMessage,
	TaskResponse,
	DoneRequest,
	DoneResponse,
}

/// Second frame of a `TaskRequest`; echoed verbatim in the `TaskResponse`
/// so the broker can match the answer without trusting worker state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskHeader {
	pub kind: TaskKind,
	pub task_id: String,
	pub sub_task_id: String,
}

/// Third frame of a `TaskResponse`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskResponse {
	pub sub_task_id: String,
	pub result: SplitTaskResult,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
	Ok(postcard::to_allocvec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
	Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod protocol_test;
