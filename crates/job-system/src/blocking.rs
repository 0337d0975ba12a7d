use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, time::timeout};
use tracing::trace;

use super::{error::JobError, future::FutureHandle, manager::worker::unless_cancelled};

/// A condition jobs wait on until it is unblocked.
///
/// A job waiting from within its execution gives back its [`ExecutionSemaphore`] permit for the
/// duration of the wait, so other jobs of the same semaphore can run and unblock it. The permit is
/// acquired again before the waiting job resumes.
///
/// [`ExecutionSemaphore`]: crate::ExecutionSemaphore
#[derive(Debug, Clone)]
pub struct BlockingCondition {
	blocking: Arc<watch::Sender<bool>>,
}

impl BlockingCondition {
	#[must_use]
	pub fn new(blocking: bool) -> Self {
		let (blocking, _) = watch::channel(blocking);

		Self {
			blocking: Arc::new(blocking),
		}
	}

	#[must_use]
	pub fn is_blocking(&self) -> bool {
		*self.blocking.borrow()
	}

	/// Setting it to `false` releases every waiter.
	pub fn set_blocking(&self, blocking: bool) {
		self.blocking.send_replace(blocking);
	}

	/// Waits until the condition is unblocked, fails with [`JobError::Cancelled`] if the job
	/// calling it gets cancelled first.
	pub async fn wait_for(&self) -> Result<(), JobError> {
		self.wait(None).await
	}

	/// Like [`BlockingCondition::wait_for`], failing with [`JobError::TimedOut`] once `duration`
	/// elapsed. The condition itself stays blocking.
	pub async fn wait_for_timeout(&self, duration: Duration) -> Result<(), JobError> {
		self.wait(Some(duration)).await
	}

	async fn wait(&self, duration: Option<Duration>) -> Result<(), JobError> {
		if !self.is_blocking() {
			return Ok(());
		}

		let current = FutureHandle::current();
		let job = current
			.as_ref()
			.map_or_else(|| "<none>".to_string(), |future| future.name().to_string());

		let released = current
			.as_ref()
			.is_some_and(FutureHandle::release_execution_permit);

		if released {
			trace!(%job, "Released execution permit to wait for blocking condition");
		}

		let unblocked = async {
			match &current {
				Some(future) => unless_cancelled(future, self.unblocked())
					.await
					.ok_or_else(|| JobError::Cancelled { job: job.clone() }),
				None => {
					self.unblocked().await;
					Ok(())
				}
			}
		};

		let outcome = match duration {
			Some(duration) => timeout(duration, unblocked)
				.await
				.unwrap_or_else(|_| {
					Err(JobError::TimedOut {
						job: job.clone(),
						timeout: duration,
					})
				}),
			None => unblocked.await,
		};

		// Resumes under the permit in every case, the job keeps running after a failed wait
		if let (true, Some(future)) = (released, &current) {
			future.reacquire_execution_permit().await;
			trace!(%job, "Reacquired execution permit after blocking condition");
		}

		outcome
	}

	async fn unblocked(&self) {
		let mut blocking = self.blocking.subscribe();

		// The sender lives as long as `self`, so the wait can't fail
		let _ = blocking.wait_for(|blocking| !*blocking).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn unblocked_condition_does_not_wait() {
		let condition = BlockingCondition::new(false);

		condition.wait_for().await.unwrap();
	}

	#[tokio::test]
	async fn waiters_are_released_when_unblocked() {
		let condition = BlockingCondition::new(true);

		let waiter = tokio::spawn({
			let condition = condition.clone();
			async move { condition.wait_for().await }
		});

		tokio::task::yield_now().await;
		assert!(!waiter.is_finished());

		condition.set_blocking(false);
		waiter.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn waits_can_time_out() {
		let condition = BlockingCondition::new(true);

		assert!(matches!(
			condition.wait_for_timeout(Duration::from_millis(10)).await,
			Err(JobError::TimedOut { .. })
		));
		assert!(condition.is_blocking());
	}
}
