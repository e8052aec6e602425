use super::*;

fn split(id: &str, bytes: u64) -> SplitTask {
	SplitTask::new(
		SubTaskHeader {
			kind: TaskKind::Image,
			task_id: "task".to_string(),
			sub_task_id: id.to_string(),
		},
		SplitWork::Image(SplitImageTask::default()),
		vec![0; bytes as usize],
		bytes,
	)
}

fn bundle(sizes: &[u64]) -> TaskBundle {
	let task = Task {
		host_id: "engine".to_string(),
		host_task_id: "h1".to_string(),
		task_id: "task".to_string(),
		spec: TaskSpec::Image(TaskImage::default()),
		data: Vec::new(),
	};
	let splits = sizes
		.iter()
		.enumerate()
		.map(|(i, &bytes)| split(&format!("s{i}"), bytes))
		.collect();
	TaskBundle::new(task, splits)
}

fn finish(bundle: &mut TaskBundle, id: &str) {
	let split = bundle.split_mut(id).unwrap();
	split.phase = SplitPhase::Done {
		worker: "w".to_string(),
	};
	split.result = Some(SplitTaskResult::Model(SplitModelResult::default()));
}

#[test]
fn test_total_bytes_is_sum_of_splits() {
	let bundle = bundle(&[4096, 1024, 256, 64]);
	assert_eq!(bundle.total_bytes, 5440);
}

#[test]
fn test_weighted_by_bytes() {
	let value = weighted_progress([(1.0, 300, false), (0.0, 100, false)]);
	assert!((value - 0.75).abs() < 1e-6);
}

#[test]
fn test_exactly_one_only_when_all_done() {
	assert_eq!(weighted_progress([(1.0, 10, false), (1.0, 10, false)]), MAX_PARTIAL_PROGRESS);
	assert_eq!(weighted_progress([(1.0, 10, true), (0.2, 10, true)]), 1.0);
}

#[test]
fn test_zero_weight_uses_done_fraction() {
	let value = weighted_progress([(0.9, 0, true), (0.9, 0, false)]);
	assert_eq!(value, 0.5);
}

#[test]
fn test_progress_is_monotonic() {
	let mut bundle = bundle(&[4096, 1024, 256, 64]);
	let ids: Vec<String> = bundle.splits.iter().map(|s| s.sub_task_id().to_string()).collect();

	let mut last = bundle.progress();
	for step in 1..=10 {
		for id in &ids {
			bundle.set_progress(id, step as f32 / 10.0, None);
			let now = bundle.progress();
			assert!(now >= last, "{now} < {last}");
			last = now;
		}
	}
	assert!(last < 1.0);

	for id in &ids {
		finish(&mut bundle, id);
	}
	assert_eq!(bundle.progress(), 1.0);
	assert!(bundle.is_complete());
}

#[test]
fn test_updates_only_on_change() {
	let mut bundle = bundle(&[100, 100]);
	assert_eq!(
		bundle.take_progress_update(),
		Some(ProgressUpdate {
			progress: 0.0,
			message: None
		})
	);
	assert_eq!(bundle.take_progress_update(), None);

	bundle.set_progress("s0", 0.5, None);
	let update = bundle.take_progress_update().unwrap();
	assert!((update.progress - 0.25).abs() < 1e-6);
	assert_eq!(update.message, None);

	bundle.set_progress("s0", 0.5, Some("compressing"));
	let update = bundle.take_progress_update().unwrap();
	assert_eq!(update.message.as_deref(), Some("compressing"));
	assert_eq!(bundle.take_progress_update(), None);
}

#[test]
fn test_phase_flags() {
	let mut s = split("x", 1);
	assert!(!s.requested_worker());

	s.phase = SplitPhase::AwaitingWorker;
	assert!(s.requested_worker() && !s.is_processing());

	s.phase = SplitPhase::Processing {
		worker: "w1".to_string(),
	};
	assert!(s.is_processing() && !s.is_done());
	assert_eq!(s.worker(), Some("w1"));

	s.phase = SplitPhase::Returned;
	assert!(s.is_done() && s.returned_worker());
	assert_eq!(s.worker(), None);
}

#[test]
fn test_results_wait_for_every_split() {
	let mut bundle = bundle(&[1, 1]);
	finish(&mut bundle, "s0");
	assert!(bundle.take_results().is_none());
	finish(&mut bundle, "s1");
	assert_eq!(bundle.take_results().unwrap().len(), 2);
}
