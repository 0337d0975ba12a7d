#![allow(dead_code)]

use sd_job_system::{AsyncFuture, JobError, JobManager, JobManagerConfig};

use std::{
	sync::atomic::{AtomicUsize, Ordering},
	time::Duration,
};

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

pub fn test_config(name: &str) -> JobManagerConfig {
	JobManagerConfig {
		name: name.to_string(),
		worker_threads: 2,
		max_concurrent_jobs: 4,
		queue_capacity: 64,
	}
}

pub fn test_manager(name: &str) -> JobManager {
	JobManager::new(test_config(name)).unwrap()
}

/// A manager that executes a single job at a time, everything else waits in its queue.
pub fn single_slot_manager(name: &str) -> JobManager {
	JobManager::new(JobManagerConfig {
		max_concurrent_jobs: 1,
		..test_config(name)
	})
	.unwrap()
}

/// For test binaries that don't use `#[traced_test]`.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

/// Polls `condition` until it holds or two seconds passed.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + Duration::from_secs(2);

	while Instant::now() < deadline {
		if condition() {
			return true;
		}
		sleep(Duration::from_millis(10)).await;
	}

	condition()
}

#[derive(Debug, Default)]
pub struct RecordingCallback<T> {
	pub successes: Mutex<Vec<T>>,
	pub errors: Mutex<Vec<JobError>>,
	pub done: AtomicUsize,
}

impl<T> RecordingCallback<T> {
	pub fn calls(&self) -> usize {
		self.successes.lock().len() + self.errors.lock().len() + self.done.load(Ordering::SeqCst)
	}
}

impl<T: Clone + Send + Sync> AsyncFuture<T> for RecordingCallback<T> {
	fn on_success(&self, result: &T) {
		self.successes.lock().push(result.clone());
	}

	fn on_error(&self, error: &JobError) {
		self.errors.lock().push(error.clone());
	}

	fn on_done(&self, result: Option<&T>, error: Option<&JobError>) {
		assert!(
			result.is_some() != error.is_some(),
			"exactly one of result or error must be given"
		);
		self.done.fetch_add(1, Ordering::SeqCst);
	}
}
