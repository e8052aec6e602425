use super::{new_sub_task_id, TaskJoiner, TaskSplitter};
use crate::error::{FarmError, Result};
use crate::protocol::SubTaskHeader;
use crate::task::{SplitModelTask, SplitTask, SplitTaskResult, SplitWork, Task, TaskKind, TaskModelResult, TaskOutput, TaskSpec};

/// Models are encoded whole: one task, one sub-task.
#[derive(Default)]
pub struct ModelSplitter;

impl TaskSplitter for ModelSplitter {
	fn split(&self, task: &Task) -> Result<Vec<SplitTask>> {
		let TaskSpec::Model(model) = &task.spec else {
			return Err(FarmError::Split {
				task: task.task_id.clone(),
				reason: "not a model task".to_string(),
			});
		};

		let header = SubTaskHeader {
			kind: TaskKind::Model,
			task_id: task.task_id.clone(),
			sub_task_id: new_sub_task_id(),
		};
		let work = SplitWork::Model(SplitModelTask {
			target_path: model.target_path.clone(),
			asset_name: model.asset_name.clone(),
			scale: model.scale,
			rotation: model.rotation,
		});
		let bytes = task.data.len() as u64;
		Ok(vec![SplitTask::new(header, work, task.data.clone(), bytes)])
	}
}

impl TaskJoiner for ModelSplitter {
	fn join(&self, task: &Task, results: Vec<SplitTaskResult>) -> Result<TaskOutput> {
		let mut results = results.into_iter();
		match (results.next(), results.next()) {
			(Some(SplitTaskResult::Model(model)), None) => Ok(TaskOutput::Model(TaskModelResult {
				model_data: model.model_data,
				prefab_data: model.prefab_data,
			})),
			_ => Err(FarmError::Join {
				task: task.task_id.clone(),
				reason: "expected exactly one model result".to_string(),
			}),
		}
	}
}
