use std::{
	future::Future,
	panic::AssertUnwindSafe,
	sync::{Arc, OnceLock},
	time::Duration,
};

use futures::FutureExt;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{
	chain::run_chained,
	error::{JobError, SubmitError},
	future::{ExecutionMode, FutureHandle, JobFuture, JobState},
	input::JobInput,
	manager::{
		worker::{acquire_permit, unless_cancelled, ExecutionPermit},
		JobManager, Shared,
	},
	thread::panic_message,
};

/// How the executions of a periodic job follow each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repetition {
	/// Executions start every `period`. One that overruns its period delays the next start until
	/// it finished, missed starts are not caught up.
	FixedRate { period: Duration },
	/// Every execution starts `delay` after the previous one finished.
	FixedDelay { delay: Duration },
}

impl Repetition {
	const fn interval(self) -> Duration {
		match self {
			Self::FixedRate { period } => period,
			Self::FixedDelay { delay } => delay,
		}
	}
}

impl JobManager {
	/// Runs `work` at `initial_delay`, `initial_delay + period`, `initial_delay + 2 * period`...
	/// until the returned future is cancelled, an execution fails or the manager shuts down.
	pub fn schedule_at_fixed_rate<W, F>(
		&self,
		work: W,
		initial_delay: Duration,
		period: Duration,
		input: Option<JobInput>,
	) -> Result<JobFuture<()>, SubmitError>
	where
		W: Fn() -> F + Send + Sync + 'static,
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		self.schedule_periodic(work, initial_delay, Repetition::FixedRate { period }, input)
	}

	/// Runs `work` at `initial_delay`, then `delay` after each execution finished, until the returned
	/// future is cancelled, an execution fails or the manager shuts down.
	pub fn schedule_with_fixed_delay<W, F>(
		&self,
		work: W,
		initial_delay: Duration,
		delay: Duration,
		input: Option<JobInput>,
	) -> Result<JobFuture<()>, SubmitError>
	where
		W: Fn() -> F + Send + Sync + 'static,
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		self.schedule_periodic(work, initial_delay, Repetition::FixedDelay { delay }, input)
	}

	/// Executions of one series never overlap. A failing execution stops the series, leaving its
	/// future [`Failed`](crate::JobState::Failed) with the error.
	pub fn schedule_periodic<W, F>(
		&self,
		work: W,
		initial_delay: Duration,
		repetition: Repetition,
		input: Option<JobInput>,
	) -> Result<JobFuture<()>, SubmitError>
	where
		W: Fn() -> F + Send + Sync + 'static,
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		let input = input.unwrap_or_else(JobInput::defaults);

		if repetition.interval().is_zero() {
			return Err(SubmitError::ZeroPeriod(input.identifier(self.name())));
		}

		let shared = self.shared();
		let future = shared.accept(input, ExecutionMode::Periodic)?;

		debug!(future = %future.id(), name = %future.name(), ?repetition, "Scheduled periodic job");

		shared.runtime.spawn(repeat(
			Arc::clone(shared),
			future.clone(),
			initial_delay,
			repetition,
			work,
		));

		Ok(JobFuture::new(future, Arc::new(OnceLock::new())))
	}
}

async fn repeat<W, F>(
	shared: Arc<Shared>,
	future: FutureHandle,
	initial_delay: Duration,
	repetition: Repetition,
	work: W,
) where
	W: Fn() -> F + Send + Sync + 'static,
	F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
	let first_start = Instant::now() + initial_delay;

	match repetition {
		Repetition::FixedRate { period } => {
			let mut ticks = interval_at(first_start, period);
			ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

			while unless_cancelled(&future, ticks.tick()).await.is_some() {
				if !run_once(&shared, &future, &work).await {
					break;
				}
			}
		}

		Repetition::FixedDelay { delay } => {
			let mut next_start = first_start;

			while unless_cancelled(&future, sleep_until(next_start))
				.await
				.is_some()
			{
				if !run_once(&shared, &future, &work).await {
					break;
				}

				next_start = Instant::now() + delay;
			}
		}
	}

	debug!(future = %future.id(), state = ?future.state(), "Periodic job series ended");
}

/// One execution of a series, `false` once the series must stop.
async fn run_once<W, F>(shared: &Shared, future: &FutureHandle, work: &W) -> bool
where
	W: Fn() -> F + Send + Sync + 'static,
	F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
	let Some(_execution_permit) = ExecutionPermit::acquire(future).await else {
		return false;
	};

	let Some(_permit) = acquire_permit(shared, future).await else {
		return false;
	};

	if future.state() == JobState::Pending && future.is_expired() {
		debug!(future = %future.id(), name = %future.name(), "Periodic job expired before it could start");
		future.cancel(false);
		return false;
	}

	if !future.try_start() {
		return false;
	}

	let outcome = AssertUnwindSafe(run_chained(&shared.chain, future, None, work()))
		.catch_unwind()
		.await;

	let failure = match outcome {
		Ok(Ok(())) => return !future.is_done(),
		Ok(Err(e)) => e,
		Err(payload) => {
			future.report_panic(payload.as_ref());
			JobError::Panicked {
				job: future.name().to_string(),
				message: panic_message(payload.as_ref()),
			}
		}
	};

	if future.complete(Some(failure)) {
		warn!(
			future = %future.id(),
			name = %future.name(),
			"Periodic job stopped by failure: {}",
			future.failure().map(|e| e.to_string()).unwrap_or_default()
		);
	}

	false
}
