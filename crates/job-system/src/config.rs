use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::error::StartupError;

/// Sizing of a [`JobManager`](crate::JobManager) worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobManagerConfig {
	/// Name of the manager, also the prefix of its worker thread names
	pub name: String,

	/// How many runtime threads back the pool
	pub worker_threads: usize,

	/// How many jobs may execute at the same time, the rest waits in the queue
	pub max_concurrent_jobs: usize,

	/// How many futures may be tracked at once (queued, delayed, running or periodic), further
	/// submissions are rejected
	pub queue_capacity: usize,
}

impl Default for JobManagerConfig {
	fn default() -> Self {
		let worker_threads = std::thread::available_parallelism().map_or_else(
			|e| {
				error!("Failed to get available parallelism in the job system: {e:#?}");
				1
			},
			|non_zero| non_zero.get(),
		);

		Self {
			name: "sd-job-worker".to_string(),
			worker_threads,
			max_concurrent_jobs: worker_threads * 4,
			queue_capacity: 10_000,
		}
	}
}

impl JobManagerConfig {
	/// Loads a JSON configuration file, keys missing from the file keep their default values.
	pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();

		info!("Loading job manager config from {path:?}");

		let json = fs::read_to_string(path)
			.with_context(|| format!("failed to read job manager config at {path:?}"))?;

		let config = serde_json::from_str::<Self>(&json)
			.with_context(|| format!("failed to parse job manager config at {path:?}"))?;

		config.validate()?;

		Ok(config)
	}

	pub fn validate(&self) -> Result<(), StartupError> {
		if self.name.trim().is_empty() {
			return Err(StartupError::InvalidConfig(
				"name must not be empty".to_string(),
			));
		}

		if self.worker_threads == 0 {
			return Err(StartupError::InvalidConfig(
				"worker_threads must be at least 1".to_string(),
			));
		}

		if self.max_concurrent_jobs == 0 {
			return Err(StartupError::InvalidConfig(
				"max_concurrent_jobs must be at least 1".to_string(),
			));
		}

		if self.queue_capacity == 0 {
			return Err(StartupError::InvalidConfig(
				"queue_capacity must be at least 1".to_string(),
			));
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_valid() {
		let config = JobManagerConfig::default();

		assert!(config.worker_threads >= 1);
		assert_eq!(config.max_concurrent_jobs, config.worker_threads * 4);
		config.validate().unwrap();
	}

	#[test]
	fn missing_keys_fall_back_to_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("jobs.json");

		fs::write(&path, r#"{ "name": "loader", "worker_threads": 2 }"#).unwrap();

		let config = JobManagerConfig::load_from(&path).unwrap();

		assert_eq!(config.name, "loader");
		assert_eq!(config.worker_threads, 2);
		assert_eq!(
			config.queue_capacity,
			JobManagerConfig::default().queue_capacity
		);
	}

	#[test]
	fn invalid_values_are_refused() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("jobs.json");

		fs::write(&path, r#"{ "max_concurrent_jobs": 0 }"#).unwrap();

		let error = JobManagerConfig::load_from(&path).unwrap_err();

		assert!(matches!(
			error.downcast_ref::<StartupError>(),
			Some(StartupError::InvalidConfig(_))
		));
	}
}
