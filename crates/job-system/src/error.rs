use std::{io, sync::Arc, time::Duration};

use thiserror::Error;

/// The single error kind that every failure of a unit of work is translated into before it reaches
/// a [`JobFuture`](crate::JobFuture), an [`AsyncFuture`](crate::AsyncFuture) or a `run_now` caller.
#[derive(Debug, Clone, Error)]
pub enum JobError {
	#[error("job <name='{job}'> failed: {cause:#}")]
	Failed {
		job: String,
		cause: Arc<anyhow::Error>,
	},
	#[error("job <name='{job}'> panicked: {message}")]
	Panicked { job: String, message: String },
	#[error("job <name='{job}'> was interrupted")]
	Interrupted { job: String },
	#[error("job <name='{job}'> was cancelled")]
	Cancelled { job: String },
	#[error("gave up waiting for job <name='{job}'> after {timeout:?}")]
	TimedOut { job: String, timeout: Duration },
	#[error("job <name='{waiting}'> can't wait for job <name='{job}'> while holding a permit of the execution semaphore both are assigned to")]
	WouldDeadlock { job: String, waiting: String },

	#[error(transparent)]
	Rejected(#[from] SubmitError),
}

impl JobError {
	/// Translates an error raised by a job body. An error that already is a [`JobError`] passes
	/// through untouched.
	#[must_use]
	pub fn translate(job: &str, error: anyhow::Error) -> Self {
		error.downcast::<Self>().unwrap_or_else(|error| Self::Failed {
			job: job.to_owned(),
			cause: Arc::new(error),
		})
	}

	#[must_use]
	pub const fn is_interruption(&self) -> bool {
		matches!(self, Self::Interrupted { .. })
	}

	#[must_use]
	pub const fn is_cancellation(&self) -> bool {
		matches!(self, Self::Cancelled { .. })
	}

	#[must_use]
	pub const fn is_rejection(&self) -> bool {
		matches!(self, Self::Rejected(_))
	}

	/// The underlying error of a [`JobError::Failed`], for downcasting to the body's own error type.
	#[must_use]
	pub fn cause(&self) -> Option<&anyhow::Error> {
		match self {
			Self::Failed { cause, .. } => Some(&**cause),
			_ => None,
		}
	}
}

/// Reasons for a submission to never run, reported synchronously to the submitter.
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
	#[error("job manager <name='{manager}'> is shut down, rejected job <name='{job}'>")]
	ShutDown { manager: String, job: String },
	#[error("job manager <name='{manager}'> reached its capacity of {capacity} jobs, rejected job <name='{job}'>")]
	Saturated {
		manager: String,
		job: String,
		capacity: usize,
	},
	#[error("job <name='{0}'> is already running")]
	AlreadyRunning(String),
	#[error("job name must not be empty")]
	EmptyName,
	#[error("periodic job <name='{0}'> needs a period greater than zero")]
	ZeroPeriod(String),
}

#[derive(Debug, Error)]
pub enum StartupError {
	#[error("invalid job manager configuration: {0}")]
	InvalidConfig(String),
	#[error("failed to start worker pool <name='{name}'>: {source}")]
	WorkerPool {
		name: String,
		#[source]
		source: io::Error,
	},
}
