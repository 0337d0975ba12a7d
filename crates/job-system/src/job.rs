use std::{
	fmt,
	future::Future,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{
	context::JobContext,
	error::{JobError, SubmitError},
	filter::FutureFilter,
	future::{AsyncFuture, FutureHandle, JobFuture},
	input::JobInput,
	manager::JobManager,
};

/// The work a [`Job`] performs on every run.
///
/// Implemented for every `Fn() -> impl Future<Output = anyhow::Result<T>>` closure.
#[async_trait]
pub trait Callable: Send + Sync + 'static {
	type Output: Send + Sync + 'static;

	async fn call(&self) -> anyhow::Result<Self::Output>;
}

#[async_trait]
impl<F, Fut, T> Callable for F
where
	F: Fn() -> Fut + Send + Sync + 'static,
	Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
	T: Send + Sync + 'static,
{
	type Output = T;

	async fn call(&self) -> anyhow::Result<T> {
		(self)().await
	}
}

struct JobInner<C> {
	name: String,
	manager: JobManager,
	context: JobContext,
	callable: C,
	running: AtomicBool,
	runs: AtomicU64,
	current: Mutex<Option<(u64, FutureHandle)>>,
}

impl<C> JobInner<C> {
	/// Remembers the future of run `run`, unless a later run was already tracked.
	fn track(&self, run: u64, future: FutureHandle) {
		let mut current = self.current.lock();

		if current.as_ref().map_or(true, |(tracked, _)| *tracked <= run) {
			*current = Some((run, future));
		}
	}
}

/// Releases the job for its next run when dropped, either once the body finished or when a
/// submission that never started is discarded.
struct RunGuard<C> {
	inner: Arc<JobInner<C>>,
	run: u64,
}

impl<C> Drop for RunGuard<C> {
	fn drop(&mut self) {
		self.inner.running.store(false, Ordering::Release);
	}
}

/// A named, reusable unit of work bound to a [`JobManager`].
///
/// A job runs at most once at a time, trying to run or schedule it again before its current run
/// finished fails with [`SubmitError::AlreadyRunning`]. Every run sees the [`JobContext`] of the
/// execution that created the job, as it was at creation time.
pub struct Job<C: Callable> {
	inner: Arc<JobInner<C>>,
}

impl<C: Callable> Clone for Job<C> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<C: Callable> fmt::Debug for Job<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Job")
			.field("name", &self.inner.name)
			.field("manager", &self.inner.manager.name())
			.field("running", &self.is_running())
			.finish_non_exhaustive()
	}
}

impl<C: Callable> Job<C> {
	pub fn new(
		manager: &JobManager,
		name: impl Into<String>,
		callable: C,
	) -> Result<Self, SubmitError> {
		let name = name.into();

		if name.trim().is_empty() {
			return Err(SubmitError::EmptyName);
		}

		Ok(Self {
			inner: Arc::new(JobInner {
				name,
				manager: manager.clone(),
				context: JobContext::current(),
				callable,
				running: AtomicBool::new(false),
				runs: AtomicU64::new(0),
				current: Mutex::new(None),
			}),
		})
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.inner.name
	}

	#[must_use]
	pub fn manager(&self) -> &JobManager {
		&self.inner.manager
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.inner.running.load(Ordering::Acquire)
	}

	/// Runs the job on the calling task and waits for its result.
	pub async fn run_now(&self) -> Result<C::Output, JobError> {
		let guard = self.try_acquire()?;

		self.inner
			.manager
			.run_now(
				async move {
					if let Some(future) = FutureHandle::current() {
						guard.inner.track(guard.run, future);
					}
					guard.inner.callable.call().await
				},
				Some(self.input()),
			)
			.await
	}

	pub fn schedule(&self) -> Result<JobFuture<C::Output>, SubmitError> {
		self.submit(None, None)
	}

	pub fn schedule_with_callback(
		&self,
		callback: Arc<dyn AsyncFuture<C::Output>>,
	) -> Result<JobFuture<C::Output>, SubmitError> {
		self.submit(None, Some(callback))
	}

	pub fn schedule_delayed(
		&self,
		delay: Duration,
		callback: Option<Arc<dyn AsyncFuture<C::Output>>>,
	) -> Result<JobFuture<C::Output>, SubmitError> {
		self.submit(Some(delay), callback)
	}

	/// Cancels the current run of this job, `false` if it isn't running or already finished.
	pub fn cancel(&self, interrupt_if_running: bool) -> bool {
		let Some((_, current)) = self.inner.current.lock().clone() else {
			return false;
		};

		self.inner.manager.cancel(
			FutureFilter::new().with_ids([current.id()]).build(),
			interrupt_if_running,
		)
	}

	fn submit(
		&self,
		delay: Option<Duration>,
		callback: Option<Arc<dyn AsyncFuture<C::Output>>>,
	) -> Result<JobFuture<C::Output>, SubmitError> {
		let guard = self.try_acquire()?;
		let run = guard.run;

		let future = self.inner.manager.submit(
			async move { guard.inner.callable.call().await },
			Some(self.input()),
			delay,
			callback,
		)?;

		self.inner.track(run, future.handle().clone());

		Ok(future)
	}

	fn try_acquire(&self) -> Result<RunGuard<C>, SubmitError> {
		self.inner
			.running
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.map(|_| RunGuard {
				inner: Arc::clone(&self.inner),
				run: self.inner.runs.fetch_add(1, Ordering::AcqRel) + 1,
			})
			.map_err(|_| SubmitError::AlreadyRunning(self.inner.name.clone()))
	}

	fn input(&self) -> JobInput {
		JobInput::defaults()
			.with_name(self.inner.name.clone())
			.with_context(self.inner.context.clone())
	}
}

impl<C: Callable<Output = ()>> Job<C> {
	pub fn schedule_at_fixed_rate(
		&self,
		initial_delay: Duration,
		period: Duration,
	) -> Result<JobFuture<()>, SubmitError> {
		let (run, work) = self.periodic_work()?;
		let future = self.inner.manager.schedule_at_fixed_rate(
			work,
			initial_delay,
			period,
			Some(self.input()),
		)?;

		self.inner.track(run, future.handle().clone());

		Ok(future)
	}

	pub fn schedule_with_fixed_delay(
		&self,
		initial_delay: Duration,
		delay: Duration,
	) -> Result<JobFuture<()>, SubmitError> {
		let (run, work) = self.periodic_work()?;
		let future = self.inner.manager.schedule_with_fixed_delay(
			work,
			initial_delay,
			delay,
			Some(self.input()),
		)?;

		self.inner.track(run, future.handle().clone());

		Ok(future)
	}

	/// The job counts as running for as long as its series goes on.
	fn periodic_work(
		&self,
	) -> Result<
		(
			u64,
			impl Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
		),
		SubmitError,
	> {
		let guard = Arc::new(self.try_acquire()?);

		Ok((guard.run, move || -> BoxFuture<'static, anyhow::Result<()>> {
			let guard = Arc::clone(&guard);
			Box::pin(async move { guard.inner.callable.call().await })
		}))
	}
}

#[cfg(test)]
mod tests {
	use crate::{JobManager, JobManagerConfig};

	use super::*;

	#[tokio::test]
	async fn later_runs_are_never_replaced_by_earlier_ones() {
		let manager = JobManager::new(JobManagerConfig {
			name: "job-tracking".to_string(),
			worker_threads: 1,
			..Default::default()
		})
		.unwrap();

		let job = Job::new(&manager, "tracked", || async { Ok(()) }).unwrap();

		let earlier = manager.schedule(async { Ok(()) }, None).unwrap();
		let later = manager.schedule(async { Ok(()) }, None).unwrap();

		// A fast first run got rescheduled before its submitter recorded the first future
		job.inner.track(2, later.handle().clone());
		job.inner.track(1, earlier.handle().clone());

		assert_eq!(
			job.inner.current.lock().as_ref().map(|(_, future)| future.id()),
			Some(later.id())
		);

		manager.shutdown();
	}

	#[tokio::test]
	async fn every_submission_gets_its_own_run() {
		let manager = JobManager::new(JobManagerConfig {
			name: "job-runs".to_string(),
			worker_threads: 1,
			..Default::default()
		})
		.unwrap();

		let job = Job::new(&manager, "counted", || async { Ok(()) }).unwrap();

		job.schedule().unwrap().get().await.unwrap();
		assert!(job.run_now().await.is_ok());

		assert_eq!(job.inner.runs.load(Ordering::Acquire), 2);
		assert_eq!(
			job.inner.current.lock().as_ref().map(|(run, _)| *run),
			Some(2)
		);

		manager.shutdown();
	}
}
