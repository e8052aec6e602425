//! Image tasks split into one sub-task per mip level.
//!
//! The source is decoded, scaled to power-of-two dimensions (at most
//! [`MAX_IMAGE_SIZE`], at least one [`BLOCK_SIZE`] block) and every mip level
//! down to a single block becomes its own sub-task carrying RGBA8 pixels.

use ::image::imageops::{self, FilterType};
use ::image::{DynamicImage, ImageFormat};
use rayon::prelude::*;

use super::{new_sub_task_id, TaskJoiner, TaskSplitter};
use crate::error::{FarmError, Result};
use crate::protocol::SubTaskHeader;
use crate::task::{SplitImageTask, SplitTask, SplitTaskResult, SplitWork, Task, TaskImageResult, TaskKind, TaskOutput, TaskSpec};

/// Largest accepted edge length.
pub const MAX_IMAGE_SIZE: u32 = 8192;

/// Edge length of a block-compression block; the smallest mip produced.
pub const BLOCK_SIZE: u32 = 4;

/// Pixel layout of split payloads (DXGI numbering).
pub const FORMAT_RGBA8_UNORM: i32 = 28;

const BYTES_PER_PIXEL: u32 = 4;

/// Round an edge up to a power of two within `[BLOCK_SIZE, MAX_IMAGE_SIZE]`.
pub fn pot_dimension(size: u32) -> u32 {
	size.clamp(1, MAX_IMAGE_SIZE)
		.next_power_of_two()
		.clamp(BLOCK_SIZE, MAX_IMAGE_SIZE)
}

/// Level dimensions from `(width, height)` down to one block.
pub fn mip_chain(width: u32, height: u32, generate_mips: bool) -> Vec<(u32, u32)> {
	let mut levels = vec![(width, height)];
	if !generate_mips {
		return levels;
	}
	let (mut w, mut h) = (width / 2, height / 2);
	while w >= BLOCK_SIZE && h >= BLOCK_SIZE {
		levels.push((w, h));
		w /= 2;
		h /= 2;
	}
	levels
}

#[derive(Default)]
pub struct ImageSplitter;

impl ImageSplitter {
	fn decode(task: &Task, extension: &str) -> Result<DynamicImage> {
		let format = ::image::guess_format(&task.data)
			.ok()
			.or_else(|| ImageFormat::from_extension(extension))
			.ok_or_else(|| FarmError::Split {
				task: task.task_id.clone(),
				reason: format!("unrecognised image format '{extension}'"),
			})?;
		Ok(::image::load_from_memory_with_format(&task.data, format)?)
	}
}

impl TaskSplitter for ImageSplitter {
	fn split(&self, task: &Task) -> Result<Vec<SplitTask>> {
		let TaskSpec::Image(settings) = &task.spec else {
			return Err(FarmError::Split {
				task: task.task_id.clone(),
				reason: "not an image task".to_string(),
			});
		};
		let _span = tracing::info_span!("split_image", task = %task.task_id).entered();

		let source = Self::decode(task, &settings.extension)?.into_rgba8();
		let width = pot_dimension(source.width());
		let height = pot_dimension(source.height());
		let levels = mip_chain(width, height, settings.generate_mips);
		let mip_count = levels.len() as u32;

		tracing::debug!(
			task = %task.task_id,
			source_width = source.width(),
			source_height = source.height(),
			width,
			height,
			mip_count,
			"splitting image"
		);

		let pixels: Vec<Vec<u8>> = levels
			.par_iter()
			.map(|&(w, h)| {
				if (w, h) == source.dimensions() {
					source.as_raw().clone()
				} else {
					imageops::resize(&source, w, h, FilterType::Lanczos3).into_raw()
				}
			})
			.collect();

		let splits = levels
			.into_iter()
			.zip(pixels)
			.enumerate()
			.map(|(mip, ((w, h), data))| {
				let stride = w * BYTES_PER_PIXEL;
				let header = SubTaskHeader {
					kind: TaskKind::Image,
					task_id: task.task_id.clone(),
					sub_task_id: new_sub_task_id(),
				};
				let work = SplitWork::Image(SplitImageTask {
					width: w,
					height: h,
					stride,
					source_format: FORMAT_RGBA8_UNORM,
					target_format: settings.format,
					original_format: settings.format,
					mip_count,
					mip: mip as u32,
					part_id: 0,
					part_width: 0,
					part_height: 0,
					flip_normal: settings.flip_normal,
					alpha_clipped: settings.alpha_clipped,
				});
				SplitTask::new(header, work, data, u64::from(h) * u64::from(stride))
			})
			.collect();

		Ok(splits)
	}
}

impl TaskJoiner for ImageSplitter {
	fn join(&self, task: &Task, results: Vec<SplitTaskResult>) -> Result<TaskOutput> {
		let join_error = |reason: &str| FarmError::Join {
			task: task.task_id.clone(),
			reason: reason.to_string(),
		};

		let mut levels = results
			.into_iter()
			.map(|result| match result {
				SplitTaskResult::Image(image) => Ok(image),
				SplitTaskResult::Model(_) => Err(join_error("model result in image task")),
			})
			.collect::<Result<Vec<_>>>()?;
		if levels.is_empty() {
			return Err(join_error("no mip levels"));
		}

		// Largest level first, regardless of completion order.
		levels.sort_by(|a, b| b.width.cmp(&a.width));

		let top = &levels[0];
		let (width, height, format) = (top.width, top.height, top.format);
		let mips = levels.len() as u32;
		let mut data = Vec::with_capacity(levels.iter().map(|l| l.data.len()).sum());
		for level in &levels {
			data.extend_from_slice(&level.data);
		}

		Ok(TaskOutput::Image(TaskImageResult {
			data,
			width,
			height,
			mips,
			format,
		}))
	}
}

#[cfg(test)]
#[path = "texture_test.rs"]
mod texture_test;
