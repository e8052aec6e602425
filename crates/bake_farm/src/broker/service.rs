//! Communication thread: both router channels, the dispatcher and the pool.

use bake_net::discovery::{Beacon, BeaconEvent, BeaconRole};
use bake_net::StopHandle;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::protocol::{
	CoreResponse, Envelope, HostMessageType, ImageRequest, ImageResponse, Message, ModelRequest, ModelResponse,
	ProgressReport, TaskNotice, PROTOCOL_VERSION,
};
use crate::router::{RouterEvent, RouterServer};
use crate::task::{Task, TaskOutput, TaskSpec};

use super::dispatch::{Dispatcher, Outbox};
use super::pool::WorkerPool;
use super::queues::{Completion, TaskQueues};

/// Sends to engines over the front router and to workers over the back one.
struct Links<'a> {
	front: &'a RouterServer,
	back: &'a RouterServer,
}

impl Outbox for Links<'_> {
	fn to_worker(&mut self, worker: &str, message: &Message) -> Result<()> {
		self.back.send(worker, message)
	}

	fn to_host(&mut self, host: &str, message: &Message) -> Result<()> {
		self.front.send(host, message)
	}
}

pub(crate) struct Service {
	pub front: RouterServer,
	pub back: RouterServer,
	pub queues: Arc<TaskQueues>,
	pub pool: WorkerPool,
	pub dispatcher: Dispatcher,
	pub beacon: Option<Beacon>,
	pub stop: StopHandle,
	pub idle_sleep: Duration,
	consumer_seen: bool,
}

impl Service {
	pub fn new(
		front: RouterServer,
		back: RouterServer,
		queues: Arc<TaskQueues>,
		pool: WorkerPool,
		beacon: Option<Beacon>,
		stop: StopHandle,
		idle_sleep: Duration,
	) -> Self {
		Self {
			front,
			back,
			queues,
			pool,
			dispatcher: Dispatcher::new(),
			beacon,
			stop,
			idle_sleep,
			consumer_seen: false,
		}
	}

	pub fn start(&mut self) -> Result<()> {
		self.front.start()?;
		self.back.start()?;
		if let Some(beacon) = &mut self.beacon {
			beacon.start()?;
		}
		Ok(())
	}

	pub fn run(mut self) {
		let _span = tracing::info_span!("broker", identity = %self.front.identity()).entered();
		tracing::info!(
			front = %self.front.local_addr(),
			back = %self.back.local_addr(),
			capacity = self.pool.capacity(),
			"broker running"
		);

		while !self.stop.is_stopped() {
			if !self.tick() {
				std::thread::sleep(self.idle_sleep);
			}
		}
		self.shutdown();
	}

	/// One pass over every event source. Returns `true` if anything happened.
	pub fn tick(&mut self) -> bool {
		let mut active = false;

		while let Some(event) = self.front.try_recv() {
			active = true;
			match event {
				RouterEvent::Message(envelope) => self.on_host_message(envelope),
				RouterEvent::Disconnected(host) => tracing::info!(%host, "engine disconnected"),
			}
		}

		while let Some(event) = self.back.try_recv() {
			active = true;
			match event {
				RouterEvent::Message(envelope) => {
					self.dispatcher.on_worker_message(&mut self.pool, &envelope);
				}
				RouterEvent::Disconnected(worker) => self.dispatcher.on_worker_lost(&mut self.pool, &worker),
			}
		}

		while let Some(bundle) = self.queues.for_processing.pop() {
			self.dispatcher.admit(bundle);
			active = true;
		}

		let mut links = Links {
			front: &self.front,
			back: &self.back,
		};
		active |= self.dispatcher.assign(&mut self.pool, &mut links);
		for bundle in self.dispatcher.drain_complete(&mut self.pool, &mut links) {
			self.queues.for_joining.push(bundle);
			active = true;
		}
		for completion in self.dispatcher.take_failed() {
			self.queues.done.push(completion);
		}
		self.dispatcher.report_progress(&mut links);

		while let Some(completion) = self.queues.done.pop() {
			deliver(&mut links, completion);
			active = true;
		}

		self.dispatcher.reap(&mut self.pool);
		self.watch_beacon();
		active
	}

	fn on_host_message(&mut self, envelope: Envelope) {
		let host = envelope.address;
		let message = envelope.message;
		let kind = match message.kind::<HostMessageType>() {
			Ok(kind) => kind,
			Err(err) => {
				tracing::warn!(%host, %err, "dropping malformed engine message");
				return;
			}
		};

		let handled = match kind {
			HostMessageType::CoreRequest => {
				let cores = CoreResponse {
					cores: u32::try_from(self.pool.capacity()).unwrap_or(u32::MAX),
					protocol_version: PROTOCOL_VERSION,
				};
				Message::new(&HostMessageType::CoreResponse)
					.and_then(|m| m.with(&cores))
					.and_then(|m| self.front.send(&host, &m))
			}
			HostMessageType::TaskImageRequest => message.payload::<ImageRequest>(0).and_then(|request| {
				self.submit(&host, request.host_task_id, TaskSpec::Image(request.image), request.data)
			}),
			HostMessageType::TaskModelRequest => message.payload::<ModelRequest>(0).and_then(|request| {
				self.submit(&host, request.host_task_id, TaskSpec::Model(request.model), request.data)
			}),
			HostMessageType::ShutdownProcessor => {
				tracing::info!(%host, "shutdown requested");
				self.stop.stop();
				Ok(())
			}
			other => {
				tracing::warn!(%host, ?other, "unexpected message from engine");
				Ok(())
			}
		};

		if let Err(err) = handled {
			tracing::warn!(%host, ?kind, %err, "failed to handle engine message");
		}
	}

	fn submit(&mut self, host: &str, host_task_id: String, spec: TaskSpec, data: Vec<u8>) -> Result<()> {
		let task = Task {
			host_id: host.to_string(),
			host_task_id,
			task_id: uuid::Uuid::new_v4().to_string(),
			spec,
			data,
		};
		tracing::info!(
			%host,
			task = %task.task_id,
			host_task = %task.host_task_id,
			kind = ?task.kind(),
			bytes = task.data.len(),
			"task accepted"
		);

		let started = Message::new(&HostMessageType::TaskStarted)?.with(&TaskNotice {
			host_task_id: task.host_task_id.clone(),
		})?;
		self.queues.for_splitting.push(task);
		self.front.send(host, &started)
	}

	fn watch_beacon(&mut self) {
		let Some(beacon) = &self.beacon else {
			return;
		};
		while let Ok(event) = beacon.events().try_recv() {
			match event {
				BeaconEvent::Discovered(peer) if peer.role == BeaconRole::Consumer => {
					tracing::info!(peer = %peer.id, ip = %peer.ip, "engine discovered");
					self.consumer_seen = true;
				}
				BeaconEvent::Lost(peer) if peer.role == BeaconRole::Consumer && self.consumer_seen => {
					tracing::info!(peer = %peer.id, "engine lost, stopping");
					self.stop.stop();
				}
				other => tracing::debug!(?other, "beacon event"),
			}
		}
	}

	fn shutdown(&mut self) {
		if let Some(beacon) = &mut self.beacon {
			beacon.stop();
		}
		self.front.stop();
		self.back.stop();
		self.pool.shutdown();
		tracing::info!(active = self.dispatcher.active().len(), queued = self.queues.queued(), "broker stopped");
	}
}

/// Final progress, the response, then `TaskFinished`. The engine hears
/// `TaskFinished` even when the response cannot be sent.
pub(crate) fn deliver(out: &mut dyn Outbox, completion: Completion) {
	let (host, host_task_id, response) = match completion {
		Completion::Joined(result) => {
			tracing::info!(task = %result.task_id, bytes = result.byte_size(), "task complete");
			let response = match result.output {
				TaskOutput::Image(image) => Message::new(&HostMessageType::TaskImageResponse).and_then(|m| {
					m.with(&ImageResponse {
						host_task_id: result.host_task_id.clone(),
						result: image,
					})
				}),
				TaskOutput::Model(model) => Message::new(&HostMessageType::TaskModelResponse).and_then(|m| {
					m.with(&ModelResponse {
						host_task_id: result.host_task_id.clone(),
						result: model,
					})
				}),
			};
			(result.host_id, result.host_task_id, Some(response))
		}
		Completion::Failed {
			host_id,
			host_task_id,
			reason,
		} => {
			tracing::warn!(host = %host_id, host_task = %host_task_id, %reason, "task failed");
			(host_id, host_task_id, None)
		}
	};

	if let Some(response) = response {
		if let Err(err) = send_result(out, &host, &host_task_id, response) {
			tracing::warn!(%host, host_task = %host_task_id, %err, "failed to deliver result");
		}
	}
	let finished = Message::new(&HostMessageType::TaskFinished)
		.and_then(|m| {
			m.with(&TaskNotice {
				host_task_id: host_task_id.clone(),
			})
		})
		.and_then(|m| out.to_host(&host, &m));
	if let Err(err) = finished {
		tracing::warn!(%host, host_task = %host_task_id, %err, "failed to send task finished");
	}
}

fn send_result(out: &mut dyn Outbox, host: &str, host_task_id: &str, response: Result<Message>) -> Result<()> {
	let progress = Message::new(&HostMessageType::TaskProgress)?.with(&ProgressReport {
		id: host_task_id.to_string(),
		progress: 1.0,
	})?;
	out.to_host(host, &progress)?;
	out.to_host(host, &response?)
}
