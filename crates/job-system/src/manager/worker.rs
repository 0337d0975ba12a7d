use std::{
	future::Future,
	panic::AssertUnwindSafe,
	sync::{Arc, OnceLock},
	time::Duration,
};

use futures::FutureExt;
use futures_concurrency::future::Race;
use tokio::{sync::OwnedSemaphorePermit, time::sleep};
use tracing::{debug, trace};

use super::Shared;
use crate::{
	chain::run_chained,
	error::JobError,
	future::{AsyncFuture, FutureHandle},
	thread::panic_message,
};

enum RaceOutput<T> {
	Ready(T),
	Cancelled,
}

/// Awaits `fut` unless the future gets cancelled first.
pub(crate) async fn unless_cancelled<T>(
	future: &FutureHandle,
	fut: impl Future<Output = T>,
) -> Option<T> {
	let output = (async { RaceOutput::Ready(fut.await) }, async {
		future.monitor().cancelled().await;
		RaceOutput::Cancelled
	})
		.race()
		.await;

	match output {
		RaceOutput::Ready(value) => Some(value),
		RaceOutput::Cancelled => None,
	}
}

/// Waits for a free execution slot, `None` once the future was cancelled or the manager was
/// shut down. In both cases the future ends up cancelled.
pub(crate) async fn acquire_permit(
	shared: &Shared,
	future: &FutureHandle,
) -> Option<OwnedSemaphorePermit> {
	let permit = unless_cancelled(future, Arc::clone(&shared.permits).acquire_owned())
		.await
		.and_then(Result::ok);

	if permit.is_none() {
		future.cancel(false);
	}

	permit
}

/// Holds the future's execution semaphore permit for as long as it lives.
pub(crate) struct ExecutionPermit<'a>(&'a FutureHandle);

impl<'a> ExecutionPermit<'a> {
	/// `None` once the future was cancelled while waiting, the future ends up cancelled.
	pub(crate) async fn acquire(future: &'a FutureHandle) -> Option<Self> {
		if future.acquire_execution_permit().await {
			Some(Self(future))
		} else {
			future.cancel(false);
			None
		}
	}
}

impl Drop for ExecutionPermit<'_> {
	fn drop(&mut self) {
		self.0.release_execution_permit();
	}
}

/// Entry point of every one-shot job on the worker pool.
pub(crate) async fn execute<T, F>(
	shared: Arc<Shared>,
	future: FutureHandle,
	delay: Option<Duration>,
	body: F,
	callback: Option<Arc<dyn AsyncFuture<T>>>,
	value: Arc<OnceLock<T>>,
) where
	T: Send + Sync + 'static,
	F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
	if let Some(delay) = delay {
		if unless_cancelled(&future, sleep(delay)).await.is_none() {
			trace!(future = %future.id(), "Delayed job cancelled before it was due");
			return;
		}
	}

	let Some(_execution_permit) = ExecutionPermit::acquire(&future).await else {
		return;
	};

	let Some(_permit) = acquire_permit(&shared, &future).await else {
		return;
	};

	if future.is_expired() {
		debug!(future = %future.id(), name = %future.name(), "Job expired before it could start");
		future.cancel(false);
		return;
	}

	if !future.try_start() {
		return;
	}

	match AssertUnwindSafe(run_chained(
		&shared.chain,
		&future,
		callback.as_deref(),
		body,
	))
	.catch_unwind()
	.await
	{
		Ok(Ok(result)) => {
			// Set before completing, so whoever wakes up on completion finds it
			if value.set(result).is_err() {
				debug!(future = %future.id(), "Job value was already set");
			}
			future.complete(None);
		}

		Ok(Err(e)) => {
			future.complete(Some(e));
		}

		Err(payload) => {
			future.report_panic(payload.as_ref());
			future.complete(Some(JobError::Panicked {
				job: future.name().to_string(),
				message: panic_message(payload.as_ref()),
			}));
		}
	}
}
