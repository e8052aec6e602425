//! Worker process state machine.
//!
//! A worker connects back to the broker's worker-facing router, repeats
//! `Helo` until the broker first talks to it, executes sub-tasks with an
//! [`Encoder`] and exits after answering a `DoneRequest`.

use bake_net::{NetworkContext, StopHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{FarmError, Result};
use crate::protocol::{
	ProgressMessageReport, ProgressReport, SubTaskHeader, SubTaskResponse, WorkerMessageType, Message,
};
use crate::router::{RouterClient, RouterEvent};
use crate::task::{SplitImageResult, SplitModelResult, SplitTaskBody, SplitTaskResult, SplitWork};

/// Interval between `Helo` messages while unacknowledged.
pub const HELO_INTERVAL: Duration = Duration::from_millis(300);

const RECV_TIMEOUT: Duration = Duration::from_millis(20);

// =============================================================================
// Encoder collaborator
// =============================================================================

/// Receives progress from a running encoder.
pub trait ProgressSink {
	fn progress(&mut self, value: f32);

	fn message(&mut self, value: f32, text: &str);
}

/// Performs the actual encoding of one sub-task.
pub trait Encoder: Send + Sync {
	fn encode(&self, header: &SubTaskHeader, body: &SplitTaskBody, progress: &mut dyn ProgressSink) -> Result<SplitTaskResult>;
}

/// Returns the sub-task payload unchanged.
#[derive(Default)]
pub struct PassthroughEncoder;

impl Encoder for PassthroughEncoder {
	fn encode(&self, _header: &SubTaskHeader, body: &SplitTaskBody, progress: &mut dyn ProgressSink) -> Result<SplitTaskResult> {
		progress.progress(0.0);
		let result = match &body.work {
			SplitWork::Image(image) => {
				progress.message(0.5, &format!("mip {} of {}", image.mip + 1, image.mip_count));
				SplitTaskResult::Image(SplitImageResult {
					width: image.width,
					height: image.height,
					format: image.target_format,
					mip_count: image.mip_count,
					mip: image.mip,
					part_id: image.part_id,
					part_width: image.part_width,
					part_height: image.part_height,
					data: body.data.clone(),
				})
			}
			SplitWork::Model(model) => {
				progress.message(0.5, &model.asset_name);
				SplitTaskResult::Model(SplitModelResult {
					model_data: body.data.clone(),
					prefab_data: Vec::new(),
				})
			}
		};
		progress.progress(1.0);
		Ok(result)
	}
}

// =============================================================================
// State machine
// =============================================================================

/// Launch parameters, mirrored by the `bake_worker` command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerOptions {
	pub ip: String,
	pub port: u16,
	/// Routing identity of this worker.
	pub id: String,
	/// Routing identity of the broker's worker-facing channel.
	pub host_id: String,
}

impl WorkerOptions {
	/// Arguments for a worker executable.
	pub fn to_args(&self) -> Vec<String> {
		vec![
			format!("--ip={}", self.ip),
			format!("--port={}", self.port),
			format!("--id={}", self.id),
			format!("--hostid={}", self.host_id),
		]
	}

	fn broker_addr(&self) -> Result<SocketAddr> {
		format!("{}:{}", self.ip, self.port)
			.parse()
			.map_err(|err| FarmError::Protocol(format!("invalid broker address {}:{}: {err}", self.ip, self.port)))
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
	WaitingForHelo,
	PerformingTask,
	Finished,
}

pub struct Worker {
	options: WorkerOptions,
	client: RouterClient,
	encoder: Arc<dyn Encoder>,
	state: WorkerState,
	last_helo: Option<Instant>,
	completed: usize,
	cancel: StopHandle,
}

/// Forwards encoder progress to the broker as it happens.
struct BrokerProgress<'a> {
	client: &'a RouterClient,
	sub_task_id: &'a str,
}

impl ProgressSink for BrokerProgress<'_> {
	fn progress(&mut self, value: f32) {
		let report = ProgressReport {
			id: self.sub_task_id.to_string(),
			progress: value,
		};
		let sent = Message::new(&WorkerMessageType::TaskProgress)
			.and_then(|m| m.with(&report))
			.and_then(|m| self.client.send(&m));
		if let Err(err) = sent {
			tracing::warn!(%err, "failed to send progress");
		}
	}

	fn message(&mut self, value: f32, text: &str) {
		let report = ProgressMessageReport {
			id: self.sub_task_id.to_string(),
			progress: value,
			message: text.to_string(),
		};
		let sent = Message::new(&WorkerMessageType::TaskProgressMessage)
			.and_then(|m| m.with(&report))
			.and_then(|m| self.client.send(&m));
		if let Err(err) = sent {
			tracing::warn!(%err, "failed to send progress message");
		}
	}
}

impl Worker {
	pub fn connect(ctx: &Arc<NetworkContext>, options: WorkerOptions, encoder: Arc<dyn Encoder>) -> Result<Self> {
		let addr = options.broker_addr()?;
		let client = RouterClient::connect(ctx, addr, options.id.clone())?;
		tracing::info!(id = %options.id, broker = %options.host_id, %addr, "worker connected");
		Ok(Self {
			options,
			client,
			encoder,
			state: WorkerState::WaitingForHelo,
			last_helo: None,
			completed: 0,
			cancel: StopHandle::default(),
		})
	}

	/// Stop [`run`](Self::run) between messages once `cancel` fires.
	pub fn with_cancel(mut self, cancel: StopHandle) -> Self {
		self.cancel = cancel;
		self
	}

	pub fn state(&self) -> WorkerState {
		self.state
	}

	/// Run until the broker releases this worker. Returns the number of
	/// sub-tasks completed.
	pub fn run(mut self) -> Result<usize> {
		while self.state != WorkerState::Finished {
			if self.cancel.is_stopped() {
				tracing::info!(id = %self.options.id, "worker cancelled");
				break;
			}
			if self.state == WorkerState::WaitingForHelo {
				self.send_helo_if_due()?;
			}

			match self.client.recv_timeout(RECV_TIMEOUT) {
				Some(RouterEvent::Message(envelope)) => {
					if envelope.address != self.options.host_id {
						tracing::warn!(from = %envelope.address, "message from unexpected broker identity");
					}
					self.state = WorkerState::PerformingTask;
					self.handle(&envelope.message)?;
				}
				Some(RouterEvent::Disconnected(_)) => return Err(FarmError::Disconnected),
				None => {}
			}
		}

		let completed = self.completed;
		self.client.close();
		Ok(completed)
	}

	fn send_helo_if_due(&mut self) -> Result<()> {
		let due = self.last_helo.map_or(true, |at| at.elapsed() >= HELO_INTERVAL);
		if due {
			self.client.send(&Message::new(&WorkerMessageType::Helo)?)?;
			self.last_helo = Some(Instant::now());
			tracing::trace!(id = %self.options.id, "sent helo");
		}
		Ok(())
	}

	fn handle(&mut self, message: &Message) -> Result<()> {
		let kind = match message.kind::<WorkerMessageType>() {
			Ok(kind) => kind,
			Err(err) => {
				tracing::warn!(%err, "dropping malformed message");
				return Ok(());
			}
		};

		match kind {
			WorkerMessageType::TaskRequest => self.perform(message),
			WorkerMessageType::DoneRequest => {
				self.client.send(&Message::new(&WorkerMessageType::DoneResponse)?)?;
				self.state = WorkerState::Finished;
				tracing::info!(id = %self.options.id, completed = self.completed, "released by broker");
				Ok(())
			}
			other => {
				tracing::warn!(?other, "unexpected message for a worker");
				Ok(())
			}
		}
	}

	fn perform(&mut self, message: &Message) -> Result<()> {
		let decoded = message.raw_payload(0).map(<[u8]>::to_vec).and_then(|raw| {
			let header: SubTaskHeader = crate::protocol::decode(&raw)?;
			let body: SplitTaskBody = message.payload(1)?;
			Ok((raw, header, body))
		});
		let (raw_header, header, body) = match decoded {
			Ok(parts) => parts,
			Err(err) => {
				tracing::warn!(%err, "dropping malformed task request");
				return Ok(());
			}
		};

		let _span = tracing::info_span!("encode", sub_task = %header.sub_task_id).entered();
		let mut sink = BrokerProgress {
			client: &self.client,
			sub_task_id: &header.sub_task_id,
		};
		// A failed encode leaves the sub-task unanswered; the broker sees the
		// worker disconnect.
		let result = self.encoder.encode(&header, &body, &mut sink)?;

		let response = Message::new(&WorkerMessageType::TaskResponse)?
			.with_raw(raw_header)
			.with(&SubTaskResponse {
				sub_task_id: header.sub_task_id.clone(),
				result,
			})?;
		self.client.send(&response)?;
		self.completed += 1;
		tracing::debug!(sub_task = %header.sub_task_id, "sub-task complete");
		Ok(())
	}
}

#[cfg(test)]
#[path = "worker_test.rs"]
mod worker_test;
