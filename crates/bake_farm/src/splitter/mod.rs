//! Task decomposition and reassembly.
//!
//! The broker only knows two collaborators: a [`TaskSplitter`] turns a
//! [`Task`] into sub-tasks and a [`TaskJoiner`] assembles their results.
//! [`DefaultSplitter`] dispatches on the task kind to the image and model
//! implementations.

mod texture;
mod model;

pub use self::texture::{mip_chain, pot_dimension, ImageSplitter, BLOCK_SIZE, FORMAT_RGBA8_UNORM, MAX_IMAGE_SIZE};
pub use self::model::ModelSplitter;

use crate::error::Result;
use crate::task::{SplitTask, SplitTaskResult, Task, TaskOutput, TaskSpec};

pub trait TaskSplitter: Send + Sync {
	fn split(&self, task: &Task) -> Result<Vec<SplitTask>>;
}

pub trait TaskJoiner: Send + Sync {
	/// `results` arrive in split order.
	fn join(&self, task: &Task, results: Vec<SplitTaskResult>) -> Result<TaskOutput>;
}

/// Routes image tasks to [`ImageSplitter`] and model tasks to
/// [`ModelSplitter`].
#[derive(Default)]
pub struct DefaultSplitter {
	image: ImageSplitter,
	model: ModelSplitter,
}

impl TaskSplitter for DefaultSplitter {
	fn split(&self, task: &Task) -> Result<Vec<SplitTask>> {
		match task.spec {
			TaskSpec::Image(_) => self.image.split(task),
			TaskSpec::Model(_) => self.model.split(task),
		}
	}
}

impl TaskJoiner for DefaultSplitter {
	fn join(&self, task: &Task, results: Vec<SplitTaskResult>) -> Result<TaskOutput> {
		match task.spec {
			TaskSpec::Image(_) => self.image.join(task, results),
			TaskSpec::Model(_) => self.model.join(task, results),
		}
	}
}

fn new_sub_task_id() -> String {
	uuid::Uuid::new_v4().to_string()
}
