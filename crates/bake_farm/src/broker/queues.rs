//! Hand-off queues between the communication and task-processing threads.
//!
//! Each queue has its own mutex, held only for a single push or pop. A task
//! lives in exactly one place at a time:
//!
//! ```text
//! for_splitting -> for_processing -> (dispatcher) -> for_joining -> done
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::task::{Task, TaskBundle, TaskResult};

/// Mutex-guarded FIFO.
pub struct WorkQueue<T> {
	items: Mutex<VecDeque<T>>,
}

impl<T> Default for WorkQueue<T> {
	fn default() -> Self {
		Self {
			items: Mutex::new(VecDeque::new()),
		}
	}
}

impl<T> WorkQueue<T> {
	fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
		self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub fn push(&self, item: T) {
		self.lock().push_back(item);
	}

	pub fn pop(&self) -> Option<T> {
		self.lock().pop_front()
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}
}

/// Outcome of a task leaving the pipeline.
#[derive(Debug)]
pub enum Completion {
	Joined(TaskResult),
	/// Splitting or joining failed; the engine only receives `TaskFinished`.
	Failed {
		host_id: String,
		host_task_id: String,
		reason: String,
	},
}

impl Completion {
	pub fn failed(task: &Task, reason: impl Into<String>) -> Self {
		Self::Failed {
			host_id: task.host_id.clone(),
			host_task_id: task.host_task_id.clone(),
			reason: reason.into(),
		}
	}
}

#[derive(Default)]
pub struct TaskQueues {
	pub for_splitting: WorkQueue<Task>,
	pub for_processing: WorkQueue<TaskBundle>,
	pub for_joining: WorkQueue<TaskBundle>,
	pub done: WorkQueue<Completion>,
}

impl TaskQueues {
	/// Tasks anywhere in the pipeline except the dispatcher's active set.
	pub fn queued(&self) -> usize {
		self.for_splitting.len() + self.for_processing.len() + self.for_joining.len() + self.done.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fifo_order() {
		let queue = WorkQueue::default();
		queue.push(1);
		queue.push(2);
		queue.push(3);
		assert_eq!(queue.len(), 3);
		assert_eq!(queue.pop(), Some(1));
		assert_eq!(queue.pop(), Some(2));
		assert_eq!(queue.pop(), Some(3));
		assert!(queue.is_empty());
		assert_eq!(queue.pop(), None);
	}
}
