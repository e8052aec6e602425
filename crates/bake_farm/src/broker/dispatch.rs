//! Sub-task dispatch: binds sub-tasks to workers and tracks their progress.
//!
//! The dispatcher owns the active processing set and is only touched by the
//! communication thread.

use bake_net::NetError;

use crate::error::{FarmError, Result};
use crate::protocol::{
	Envelope, HostMessageType, Message, ProgressMessageReport, ProgressReport, SubTaskHeader, SubTaskResponse,
	WorkerMessageType,
};
use crate::task::{SplitPhase, TaskBundle};

use super::pool::WorkerPool;
use super::queues::Completion;

/// Outgoing side of both router channels.
pub trait Outbox {
	fn to_worker(&mut self, worker: &str, message: &Message) -> Result<()>;

	fn to_host(&mut self, host: &str, message: &Message) -> Result<()>;
}

#[derive(Default)]
pub struct Dispatcher {
	active: Vec<TaskBundle>,
	/// Tasks that can never be dispatched, awaiting delivery.
	failed: Vec<Completion>,
	/// Last spawn failure, reported once until a spawn succeeds again.
	spawn_error: Option<String>,
}

impl Dispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn admit(&mut self, bundle: TaskBundle) {
		tracing::debug!(
			task = %bundle.task.task_id,
			splits = bundle.splits.len(),
			bytes = bundle.total_bytes,
			"task ready for dispatch"
		);
		self.active.push(bundle);
	}

	pub fn active(&self) -> &[TaskBundle] {
		&self.active
	}

	pub fn is_idle(&self) -> bool {
		self.active.is_empty()
	}

	/// Grow the pool for unassigned sub-tasks, bind ready workers and release
	/// workers whose sub-task finished. Returns `true` if anything changed.
	///
	/// A sub-task too large for one frame fails its whole task; no worker
	/// could ever receive it.
	pub fn assign(&mut self, pool: &mut WorkerPool, out: &mut dyn Outbox) -> bool {
		let mut changed = false;
		let mut oversized: Vec<(usize, String)> = Vec::new();

		'bundles: for (index, bundle) in self.active.iter_mut().enumerate() {
			for split in &mut bundle.splits {
				match &split.phase {
					SplitPhase::Pending => {
						if !pool.can_grow() {
							continue;
						}
						match pool.spawn() {
							Ok(_) => {
								if self.spawn_error.take().is_some() {
									tracing::info!("worker spawning recovered");
								}
								split.phase = SplitPhase::AwaitingWorker;
								changed = true;
							}
							Err(err) => {
								let reason = err.to_string();
								if self.spawn_error.as_deref() != Some(reason.as_str()) {
									tracing::error!(%err, sub_task = %split.header.sub_task_id, "failed to start worker");
								} else {
									tracing::trace!(%err, "worker spawn still failing");
								}
								self.spawn_error = Some(reason);
								break 'bundles;
							}
						}
					}
					SplitPhase::AwaitingWorker => {
						let Some(worker) = pool.take_ready() else {
							continue;
						};
						match task_request(&split.header, &split.body).and_then(|m| out.to_worker(&worker, &m)) {
							Ok(()) => {
								tracing::debug!(%worker, sub_task = %split.header.sub_task_id, "sub-task dispatched");
								split.phase = SplitPhase::Processing { worker };
							}
							Err(err) if is_oversized(&err) => {
								tracing::error!(
									%worker,
									task = %split.header.task_id,
									sub_task = %split.header.sub_task_id,
									%err,
									"sub-task exceeds the frame limit"
								);
								release(pool, out, &worker);
								oversized.push((index, err.to_string()));
								changed = true;
								continue 'bundles;
							}
							Err(err) => {
								tracing::warn!(%worker, %err, "failed to dispatch sub-task, replacing worker");
								pool.forget(&worker);
								split.phase = SplitPhase::Pending;
							}
						}
						changed = true;
					}
					SplitPhase::Done { worker } => {
						release(pool, out, worker);
						split.phase = SplitPhase::Returned;
						changed = true;
					}
					SplitPhase::Processing { .. } | SplitPhase::Returned => {}
				}
			}
		}

		for (index, reason) in oversized.into_iter().rev() {
			let bundle = self.active.remove(index);
			self.fail(pool, out, bundle, reason);
		}
		changed |= self.release_surplus(pool, out);
		changed
	}

	/// Drop a task that cannot finish, releasing every worker attached to it.
	fn fail(&mut self, pool: &mut WorkerPool, out: &mut dyn Outbox, bundle: TaskBundle, reason: String) {
		for split in &bundle.splits {
			if let SplitPhase::Processing { worker } | SplitPhase::Done { worker } = &split.phase {
				release(pool, out, worker);
			}
		}
		tracing::warn!(task = %bundle.task.task_id, host_task = %bundle.task.host_task_id, %reason, "task failed");
		self.failed.push(Completion::failed(&bundle.task, reason));
	}

	/// Release ready workers that no waiting sub-task will claim, such as
	/// those spawned for a task that has since failed.
	fn release_surplus(&mut self, pool: &mut WorkerPool, out: &mut dyn Outbox) -> bool {
		let waiting = self
			.active
			.iter()
			.flat_map(|b| &b.splits)
			.filter(|s| s.phase == SplitPhase::AwaitingWorker)
			.count();
		let mut released = false;
		while pool.unbound_count() > waiting {
			let Some(worker) = pool.take_ready() else {
				break;
			};
			release(pool, out, &worker);
			released = true;
		}
		released
	}

	/// Tasks failed since the last call.
	pub fn take_failed(&mut self) -> Vec<Completion> {
		std::mem::take(&mut self.failed)
	}

	/// Most recent worker spawn failure, cleared by the next successful spawn.
	pub fn spawn_error(&self) -> Option<&str> {
		self.spawn_error.as_deref()
	}

	/// Collect exited workers. One that exited before it was bound is handled
	/// like a connection lost before binding.
	pub fn reap(&mut self, pool: &mut WorkerPool) {
		for worker in pool.reap() {
			tracing::warn!(%worker, "worker exited before it was bound");
			self.requeue_waiting();
		}
	}

	/// Handle one message from a worker. Returns `true` if it was understood.
	pub fn on_worker_message(&mut self, pool: &mut WorkerPool, envelope: &Envelope) -> bool {
		let worker = envelope.address.as_str();
		let message = &envelope.message;
		let kind = match message.kind::<WorkerMessageType>() {
			Ok(kind) => kind,
			Err(err) => {
				tracing::warn!(%worker, %err, "dropping malformed worker message");
				return false;
			}
		};

		match kind {
			WorkerMessageType::Helo => {
				if !pool.mark_ready(worker) {
					tracing::warn!(%worker, "helo from unknown worker");
					return false;
				}
				true
			}
			WorkerMessageType::TaskProgress => match message.payload::<ProgressReport>(0) {
				Ok(report) => self.set_progress(&report.id, report.progress, None),
				Err(err) => {
					tracing::warn!(%worker, %err, "dropping malformed progress");
					false
				}
			},
			WorkerMessageType::TaskProgressMessage => match message.payload::<ProgressMessageReport>(0) {
				Ok(report) => self.set_progress(&report.id, report.progress, Some(&report.message)),
				Err(err) => {
					tracing::warn!(%worker, %err, "dropping malformed progress message");
					false
				}
			},
			WorkerMessageType::TaskResponse => self.on_task_response(worker, message),
			WorkerMessageType::DoneResponse => {
				tracing::debug!(%worker, "worker acknowledged release");
				true
			}
			other => {
				tracing::warn!(%worker, ?other, "unexpected message from worker");
				false
			}
		}
	}

	fn on_task_response(&mut self, worker: &str, message: &Message) -> bool {
		let decoded = message.payload::<SubTaskHeader>(0).and_then(|header| {
			let response: SubTaskResponse = message.payload(1)?;
			Ok((header, response))
		});
		let (header, response) = match decoded {
			Ok(parts) => parts,
			Err(err) => {
				tracing::warn!(%worker, %err, "dropping malformed task response");
				return false;
			}
		};

		let Some(split) = self
			.active
			.iter_mut()
			.filter(|b| b.task.task_id == header.task_id)
			.find_map(|b| b.split_mut(&header.sub_task_id))
		else {
			tracing::warn!(%worker, sub_task = %header.sub_task_id, "response for unknown sub-task");
			return false;
		};

		if !split.is_processing() || split.worker() != Some(worker) {
			tracing::warn!(%worker, sub_task = %header.sub_task_id, phase = ?split.phase, "ignoring unexpected response");
			return false;
		}

		if response.sub_task_id != header.sub_task_id {
			tracing::warn!(%worker, header = %header.sub_task_id, body = %response.sub_task_id, "response ids disagree");
		}

		split.progress = 1.0;
		split.result = Some(response.result);
		split.phase = SplitPhase::Done {
			worker: worker.to_string(),
		};
		tracing::debug!(%worker, sub_task = %header.sub_task_id, "sub-task done");
		true
	}

	fn set_progress(&mut self, sub_task_id: &str, progress: f32, message: Option<&str>) -> bool {
		for bundle in &mut self.active {
			if bundle.set_progress(sub_task_id, progress, message) {
				return true;
			}
		}
		tracing::debug!(sub_task = %sub_task_id, "progress for unknown sub-task");
		false
	}

	/// A worker connection went away.
	pub fn on_worker_lost(&mut self, pool: &mut WorkerPool, worker: &str) {
		match pool.forget(worker) {
			None => tracing::trace!(%worker, "released worker disconnected"),
			Some(true) => {
				// No recovery: the sub-task is not handed to another worker.
				let stalled = self
					.active
					.iter()
					.flat_map(|b| &b.splits)
					.find(|s| s.is_processing() && s.worker() == Some(worker));
				match stalled {
					Some(split) => tracing::warn!(
						%worker,
						task = %split.header.task_id,
						sub_task = %split.header.sub_task_id,
						"worker lost mid-task, sub-task stalled"
					),
					None => tracing::warn!(%worker, "bound worker lost"),
				}
			}
			Some(false) => {
				tracing::warn!(%worker, "worker lost before it was bound");
				self.requeue_waiting();
			}
		}
	}

	/// Hand one waiting sub-task back to `Pending`; its worker never started
	/// anything.
	fn requeue_waiting(&mut self) {
		let waiting = self
			.active
			.iter_mut()
			.flat_map(|b| b.splits.iter_mut())
			.find(|s| s.phase == SplitPhase::AwaitingWorker);
		if let Some(split) = waiting {
			split.phase = SplitPhase::Pending;
		}
	}

	/// Remove bundles whose sub-tasks are all done, releasing any worker still
	/// attached.
	pub fn drain_complete(&mut self, pool: &mut WorkerPool, out: &mut dyn Outbox) -> Vec<TaskBundle> {
		let mut complete = Vec::new();
		let mut index = 0;
		while index < self.active.len() {
			if !self.active[index].is_complete() {
				index += 1;
				continue;
			}
			let mut bundle = self.active.remove(index);
			for split in &mut bundle.splits {
				if let SplitPhase::Done { worker } = &split.phase {
					release(pool, out, worker);
					split.phase = SplitPhase::Returned;
				}
			}
			tracing::debug!(task = %bundle.task.task_id, "all sub-tasks done");
			complete.push(bundle);
		}
		complete
	}

	/// Forward changed aggregate progress of unfinished tasks to their hosts.
	pub fn report_progress(&mut self, out: &mut dyn Outbox) {
		for bundle in &mut self.active {
			if bundle.is_complete() {
				continue;
			}
			let Some(update) = bundle.take_progress_update() else {
				continue;
			};
			let host_task_id = bundle.task.host_task_id.clone();
			let message = match update.message {
				Some(text) => Message::new(&HostMessageType::TaskProgressMessage).and_then(|m| {
					m.with(&ProgressMessageReport {
						id: host_task_id,
						progress: update.progress,
						message: text,
					})
				}),
				None => Message::new(&HostMessageType::TaskProgress).and_then(|m| {
					m.with(&ProgressReport {
						id: host_task_id,
						progress: update.progress,
					})
				}),
			};
			if let Err(err) = message.and_then(|m| out.to_host(&bundle.task.host_id, &m)) {
				tracing::warn!(host = %bundle.task.host_id, %err, "failed to report progress");
			}
		}
	}
}

fn is_oversized(err: &FarmError) -> bool {
	matches!(err, FarmError::Net(NetError::FrameTooLarge { .. }))
}

fn task_request(header: &SubTaskHeader, body: &crate::task::SplitTaskBody) -> Result<Message> {
	Message::new(&WorkerMessageType::TaskRequest)?.with(header)?.with(body)
}

fn release(pool: &mut WorkerPool, out: &mut dyn Outbox, worker: &str) {
	let sent = Message::new(&WorkerMessageType::DoneRequest).and_then(|m| out.to_worker(worker, &m));
	if let Err(err) = sent {
		tracing::warn!(%worker, %err, "failed to release worker");
	}
	pool.dispose(worker);
	tracing::debug!(%worker, "worker released");
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod dispatch_test;
