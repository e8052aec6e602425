//! Task-processing thread: splits new tasks and joins finished ones.

use bake_net::StopHandle;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::splitter::{TaskJoiner, TaskSplitter};
use crate::task::{TaskBundle, TaskResult};

use super::queues::{Completion, TaskQueues};

pub(crate) struct Processor {
	pub queues: Arc<TaskQueues>,
	pub splitter: Arc<dyn TaskSplitter>,
	pub joiner: Arc<dyn TaskJoiner>,
}

impl Processor {
	pub fn spawn(self, stop: StopHandle, idle_sleep: Duration) -> std::io::Result<JoinHandle<()>> {
		std::thread::Builder::new()
			.name("bake-broker-tasks".to_string())
			.spawn(move || {
				while !stop.is_stopped() {
					if !self.step() {
						std::thread::sleep(idle_sleep);
					}
				}
				tracing::debug!("task processor stopped");
			})
	}

	/// Split at most one task and join at most one bundle. Returns `true` if
	/// either happened.
	pub fn step(&self) -> bool {
		let mut worked = false;
		if let Some(task) = self.queues.for_splitting.pop() {
			self.split(task);
			worked = true;
		}
		if let Some(bundle) = self.queues.for_joining.pop() {
			self.join(bundle);
			worked = true;
		}
		worked
	}

	fn split(&self, task: crate::task::Task) {
		let _span = tracing::info_span!("split", task = %task.task_id, kind = ?task.kind()).entered();
		match self.splitter.split(&task) {
			Ok(splits) if splits.is_empty() => {
				tracing::warn!("splitter produced no sub-tasks");
				self.queues.done.push(Completion::failed(&task, "no sub-tasks"));
			}
			Ok(splits) => {
				tracing::debug!(count = splits.len(), "task split");
				self.queues.for_processing.push(TaskBundle::new(task, splits));
			}
			Err(err) => {
				tracing::warn!(%err, "failed to split task");
				self.queues.done.push(Completion::failed(&task, err.to_string()));
			}
		}
	}

	fn join(&self, mut bundle: TaskBundle) {
		let _span = tracing::info_span!("join", task = %bundle.task.task_id).entered();
		let Some(results) = bundle.take_results() else {
			tracing::warn!("bundle joined with missing results");
			self.queues.done.push(Completion::failed(&bundle.task, "missing sub-task results"));
			return;
		};

		match self.joiner.join(&bundle.task, results) {
			Ok(output) => {
				let task = bundle.task;
				self.queues.done.push(Completion::Joined(TaskResult {
					host_id: task.host_id,
					host_task_id: task.host_task_id,
					task_id: task.task_id,
					output,
				}));
			}
			Err(err) => {
				tracing::warn!(%err, "failed to join task");
				self.queues.done.push(Completion::failed(&bundle.task, err.to_string()));
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::{FarmError, Result};
	use crate::protocol::SubTaskHeader;
	use crate::splitter::DefaultSplitter;
	use crate::task::{
		SplitModelResult, SplitTask, SplitTaskResult, Task, TaskKind, TaskModel, TaskOutput, TaskSpec,
	};

	struct Refusing;

	impl TaskSplitter for Refusing {
		fn split(&self, task: &Task) -> Result<Vec<SplitTask>> {
			Err(FarmError::Split {
				task: task.task_id.clone(),
				reason: "unsupported".to_string(),
			})
		}
	}

	fn model_task() -> Task {
		Task {
			host_id: "engine".to_string(),
			host_task_id: "h1".to_string(),
			task_id: "t1".to_string(),
			spec: TaskSpec::Model(TaskModel::default()),
			data: vec![1, 2, 3],
		}
	}

	fn processor(splitter: Arc<dyn TaskSplitter>) -> Processor {
		Processor {
			queues: Arc::new(TaskQueues::default()),
			splitter,
			joiner: Arc::new(DefaultSplitter::default()),
		}
	}

	#[test]
	fn test_split_then_join() {
		let processor = processor(Arc::new(DefaultSplitter::default()));
		assert!(!processor.step());

		processor.queues.for_splitting.push(model_task());
		assert!(processor.step());
		let mut bundle = processor.queues.for_processing.pop().unwrap();
		assert_eq!(bundle.splits.len(), 1);
		assert_eq!(bundle.total_bytes, 3);
		assert_eq!(bundle.splits[0].header.kind, TaskKind::Model);

		bundle.splits[0].result = Some(SplitTaskResult::Model(SplitModelResult {
			model_data: vec![9; 5],
			prefab_data: vec![7],
		}));
		processor.queues.for_joining.push(bundle);
		assert!(processor.step());

		match processor.queues.done.pop() {
			Some(Completion::Joined(result)) => {
				assert_eq!(result.host_task_id, "h1");
				assert_eq!(result.byte_size(), 6);
				assert!(matches!(result.output, TaskOutput::Model(_)));
			}
			other => panic!("expected joined result, got {:?}", other),
		}
	}

	#[test]
	fn test_split_failure_completes_task() {
		let processor = processor(Arc::new(Refusing));
		processor.queues.for_splitting.push(model_task());
		processor.step();

		assert!(processor.queues.for_processing.is_empty());
		match processor.queues.done.pop() {
			Some(Completion::Failed { host_task_id, .. }) => assert_eq!(host_task_id, "h1"),
			other => panic!("expected failure, got {:?}", other),
		}
	}

	#[test]
	fn test_missing_results_fail_join() {
		let processor = processor(Arc::new(DefaultSplitter::default()));
		let header = SubTaskHeader {
			kind: TaskKind::Model,
			task_id: "t1".to_string(),
			sub_task_id: "s1".to_string(),
		};
		let split = SplitTask::new(
			header,
			crate::task::SplitWork::Model(crate::task::SplitModelTask {
				target_path: String::new(),
				asset_name: String::new(),
				scale: glam::Vec3::ONE,
				rotation: glam::Quat::IDENTITY,
			}),
			Vec::new(),
			0,
		);
		processor.queues.for_joining.push(TaskBundle::new(model_task(), vec![split]));
		processor.step();

		assert!(matches!(processor.queues.done.pop(), Some(Completion::Failed { .. })));
	}
}
