use std::{
	any::Any,
	collections::HashSet,
	fmt,
	future::{Future, IntoFuture},
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{Arc, OnceLock},
	time::{Duration, Instant},
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{
	sync::{watch, OwnedSemaphorePermit},
	time::timeout,
};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
	error::JobError,
	input::JobInput,
	listener::{JobChangeEvent, JobChangeEventType, JobChangeListeners},
	manager::{worker::unless_cancelled, Shared},
	monitor::ProgressMonitor,
};

pub type FutureId = Uuid;

tokio::task_local! {
	static CURRENT_FUTURE: FutureHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
	/// Accepted, waiting for its delay or a free worker
	Pending,
	Running,
	Done,
	Cancelled,
	/// Completed with an error, or a periodic series stopped by a failing execution
	Failed,
}

impl JobState {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Done | Self::Cancelled | Self::Failed)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
	/// Executed inline by `run_now`
	Sync,
	Async,
	Delayed,
	Periodic,
}

struct FutureCore {
	id: FutureId,
	name: String,
	input: JobInput,
	mode: ExecutionMode,
	submitted_at: Instant,
	monitor: ProgressMonitor,
	state: watch::Sender<JobState>,
	failure: Mutex<Option<JobError>>,
	execution_hints: Mutex<HashSet<String>>,
	execution_permit: Mutex<Option<OwnedSemaphorePermit>>,
	listeners: JobChangeListeners,
	shared: Arc<Shared>,
}

/// Type erased view of a submitted unit of work, shared by the manager, filters, visitors and
/// change events.
#[derive(Clone)]
pub struct FutureHandle(Arc<FutureCore>);

impl fmt::Debug for FutureHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FutureHandle")
			.field("id", &self.0.id)
			.field("name", &self.0.name)
			.field("mode", &self.0.mode)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

impl PartialEq for FutureHandle {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}
}

impl Eq for FutureHandle {}

impl FutureHandle {
	pub(crate) fn new(
		shared: Arc<Shared>,
		input: JobInput,
		mode: ExecutionMode,
		monitor: ProgressMonitor,
	) -> Self {
		let (state, _) = watch::channel(JobState::Pending);

		Self(Arc::new(FutureCore {
			id: FutureId::new_v4(),
			name: input.identifier(&shared.name),
			execution_hints: Mutex::new(input.execution_hints().clone()),
			execution_permit: Mutex::new(None),
			listeners: JobChangeListeners::new(),
			input,
			mode,
			submitted_at: Instant::now(),
			monitor,
			state,
			failure: Mutex::new(None),
			shared,
		}))
	}

	/// The future of the job executing on this task.
	#[must_use]
	pub fn current() -> Option<Self> {
		CURRENT_FUTURE.try_with(Clone::clone).ok()
	}

	#[must_use]
	pub fn id(&self) -> FutureId {
		self.0.id
	}

	/// Display name used in logs and errors.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.0.name
	}

	#[must_use]
	pub fn input(&self) -> &JobInput {
		&self.0.input
	}

	#[must_use]
	pub fn mode(&self) -> ExecutionMode {
		self.0.mode
	}

	/// Id of the manager that accepted this future.
	#[must_use]
	pub fn manager_id(&self) -> Uuid {
		self.0.shared.id
	}

	#[must_use]
	pub fn monitor(&self) -> &ProgressMonitor {
		&self.0.monitor
	}

	#[must_use]
	pub fn state(&self) -> JobState {
		*self.0.state.borrow()
	}

	#[must_use]
	pub fn is_done(&self) -> bool {
		self.state().is_terminal()
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.state() == JobState::Cancelled
	}

	#[must_use]
	pub fn is_failed(&self) -> bool {
		self.state() == JobState::Failed
	}

	/// Tags the future with `hint`, `false` if it already carried it.
	pub fn add_execution_hint(&self, hint: impl Into<String>) -> bool {
		let hint = hint.into();
		let added = self.0.execution_hints.lock().insert(hint.clone());

		if added {
			self.fire_event(&JobChangeEvent::for_execution_hint(
				JobChangeEventType::ExecutionHintAdded,
				self,
				&hint,
			));
		}

		added
	}

	/// `false` if the future didn't carry `hint`.
	pub fn remove_execution_hint(&self, hint: &str) -> bool {
		let removed = self.0.execution_hints.lock().remove(hint);

		if removed {
			self.fire_event(&JobChangeEvent::for_execution_hint(
				JobChangeEventType::ExecutionHintRemoved,
				self,
				hint,
			));
		}

		removed
	}

	#[must_use]
	pub fn contains_execution_hint(&self, hint: &str) -> bool {
		self.0.execution_hints.lock().contains(hint)
	}

	#[must_use]
	pub fn execution_hints(&self) -> HashSet<String> {
		self.0.execution_hints.lock().clone()
	}

	/// Listeners notified of this future's events only, after the manager's listeners.
	///
	/// Subscriptions are dropped once the future reached its terminal state.
	#[must_use]
	pub fn listeners(&self) -> &JobChangeListeners {
		&self.0.listeners
	}

	/// The error a failed future completed with.
	#[must_use]
	pub fn failure(&self) -> Option<JobError> {
		self.0.failure.lock().clone()
	}

	/// Moves a pending or running future into [`JobState::Cancelled`] and signals its monitor.
	///
	/// Returns `false` if the future already reached a terminal state.
	pub fn cancel(&self, interrupt_if_running: bool) -> bool {
		let cancelled = self.0.state.send_if_modified(|state| {
			if state.is_terminal() {
				false
			} else {
				*state = JobState::Cancelled;
				true
			}
		});

		if cancelled {
			debug!(future = %self.id(), name = %self.name(), interrupt_if_running, "Cancelled job");
			self.0.monitor.cancel(interrupt_if_running);
			self.finish(JobChangeEventType::Cancelled);
		}

		cancelled
	}

	/// Fails with [`JobError::WouldDeadlock`] when the calling job holds a permit of the execution
	/// semaphore this pending future needs to run.
	pub fn ensure_awaitable(&self) -> Result<(), JobError> {
		let Some(current) = Self::current() else {
			return Ok(());
		};

		let Some(semaphore) = current.input().execution_semaphore() else {
			return Ok(());
		};

		if self.is_done()
			|| *self == current
			|| self.input().execution_semaphore() != Some(semaphore)
			|| !semaphore.is_permit_owner(&current)
		{
			return Ok(());
		}

		Err(JobError::WouldDeadlock {
			job: self.name().to_string(),
			waiting: current.name().to_string(),
		})
	}

	/// Waits for the future to reach a terminal state, without retrieving its result.
	pub async fn await_done(&self) {
		let mut state = self.0.state.subscribe();

		// The sender lives as long as `self`, so the wait can't fail
		let _ = state.wait_for(|state| state.is_terminal()).await;
	}

	pub async fn await_done_timeout(&self, duration: Duration) -> Result<(), JobError> {
		self.ensure_awaitable()?;

		timeout(duration, self.await_done())
			.await
			.map_err(|_| JobError::TimedOut {
				job: self.name().to_string(),
				timeout: duration,
			})
	}

	/// Runs `callback` on the manager's pool once the future is done, cancelled ones included.
	pub fn when_done(&self, callback: impl FnOnce(&Self) + Send + 'static) {
		let future = self.clone();

		self.0.shared.runtime.spawn(async move {
			future.await_done().await;

			if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&future))) {
				future.report_panic(payload.as_ref());
			}
		});
	}

	pub(crate) fn is_expired(&self) -> bool {
		self.0
			.input
			.expiration_time()
			.is_some_and(|expiration| self.0.submitted_at.elapsed() >= expiration)
	}

	/// Marks the beginning of an execution, `false` if the future was cancelled in the meantime.
	///
	/// Periodic futures stay [`JobState::Running`] between executions, every execution fires its
	/// own started event.
	pub(crate) fn try_start(&self) -> bool {
		let mut running = false;

		self.0.state.send_if_modified(|state| match *state {
			JobState::Pending => {
				*state = JobState::Running;
				running = true;
				true
			}
			JobState::Running => {
				running = true;
				false
			}
			_ => false,
		});

		if running {
			trace!(future = %self.id(), name = %self.name(), "Starting job");
			self.fire(JobChangeEventType::Started);
		}

		running
	}

	/// Moves a running future into [`JobState::Done`], or [`JobState::Failed`] when given an error.
	/// A future cancelled while it was running stays cancelled.
	pub(crate) fn complete(&self, failure: Option<JobError>) -> bool {
		let completed = self.0.state.send_if_modified(|state| {
			if state.is_terminal() {
				return false;
			}

			*state = if let Some(failure) = failure {
				*self.0.failure.lock() = Some(failure);
				JobState::Failed
			} else {
				JobState::Done
			};

			true
		});

		if completed {
			trace!(future = %self.id(), name = %self.name(), state = ?self.state(), "Job completed");
			self.finish(JobChangeEventType::Completed);
		}

		completed
	}

	pub(crate) fn fire(&self, kind: JobChangeEventType) {
		self.fire_event(&JobChangeEvent::for_future(kind, self));
	}

	fn fire_event(&self, event: &JobChangeEvent) {
		self.0.shared.listeners.fire_event(event);
		self.0.listeners.fire_event(event);
	}

	/// Hands a panic that escaped user code outside of the job body to the manager's handler.
	pub(crate) fn report_panic(&self, payload: &(dyn Any + Send)) {
		self.0.shared.factory.report_panic(self.name(), payload);
	}

	pub(crate) fn holds_execution_permit(&self) -> bool {
		self.0.execution_permit.lock().is_some()
	}

	/// Waits for a permit of the input's execution semaphore, if any, and keeps it until
	/// [`FutureHandle::release_execution_permit`]. `false` once the future got cancelled.
	pub(crate) async fn acquire_execution_permit(&self) -> bool {
		let Some(semaphore) = self.0.input.execution_semaphore() else {
			return true;
		};

		match unless_cancelled(self, semaphore.acquire()).await {
			Some(Ok(permit)) => {
				*self.0.execution_permit.lock() = Some(permit);
				true
			}
			_ => false,
		}
	}

	/// Takes the permit back after a wait, even for a cancelled future that keeps running.
	pub(crate) async fn reacquire_execution_permit(&self) {
		if let Some(semaphore) = self.0.input.execution_semaphore() {
			if let Ok(permit) = semaphore.acquire().await {
				*self.0.execution_permit.lock() = Some(permit);
			}
		}
	}

	/// `true` if a permit was held.
	pub(crate) fn release_execution_permit(&self) -> bool {
		self.0.execution_permit.lock().take().is_some()
	}

	pub(crate) async fn scope<F: Future>(self, fut: F) -> F::Output {
		CURRENT_FUTURE.scope(self, fut).await
	}

	fn finish(&self, kind: JobChangeEventType) {
		self.0.shared.registry.remove(self.id());
		self.fire(kind);
		self.0.listeners.clear();
	}
}

/// Typed completion token of a submitted unit of work.
pub struct JobFuture<T> {
	handle: FutureHandle,
	value: Arc<OnceLock<T>>,
}

impl<T> Clone for JobFuture<T> {
	fn clone(&self) -> Self {
		Self {
			handle: self.handle.clone(),
			value: Arc::clone(&self.value),
		}
	}
}

impl<T> fmt::Debug for JobFuture<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("JobFuture").field(&self.handle).finish()
	}
}

impl<T> JobFuture<T> {
	pub(crate) const fn new(handle: FutureHandle, value: Arc<OnceLock<T>>) -> Self {
		Self { handle, value }
	}

	#[must_use]
	pub const fn handle(&self) -> &FutureHandle {
		&self.handle
	}

	#[must_use]
	pub fn id(&self) -> FutureId {
		self.handle.id()
	}

	#[must_use]
	pub fn state(&self) -> JobState {
		self.handle.state()
	}

	#[must_use]
	pub fn is_done(&self) -> bool {
		self.handle.is_done()
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.handle.is_cancelled()
	}

	pub fn cancel(&self, interrupt_if_running: bool) -> bool {
		self.handle.cancel(interrupt_if_running)
	}
}

impl<T: Clone> JobFuture<T> {
	/// Waits for the job and returns its value, or the error it failed with.
	pub async fn get(&self) -> Result<T, JobError> {
		self.handle.ensure_awaitable()?;
		self.handle.await_done().await;
		self.outcome()
	}

	/// Like [`JobFuture::get`], but gives up after `duration`. The job itself keeps running.
	pub async fn get_timeout(&self, duration: Duration) -> Result<T, JobError> {
		self.handle.await_done_timeout(duration).await?;
		self.outcome()
	}

	fn outcome(&self) -> Result<T, JobError> {
		let cancelled = || JobError::Cancelled {
			job: self.handle.name().to_string(),
		};

		match self.handle.state() {
			JobState::Done => self.value.get().cloned().ok_or_else(cancelled),
			JobState::Failed => Err(self.handle.failure().unwrap_or_else(cancelled)),
			_ => Err(cancelled()),
		}
	}
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for JobFuture<T> {
	type Output = Result<T, JobError>;
	type IntoFuture = BoxFuture<'static, Self::Output>;

	fn into_future(self) -> Self::IntoFuture {
		Box::pin(async move { self.get().await })
	}
}

/// Completion callbacks of one scheduled invocation, called on the worker that executed it.
///
/// Exactly one of `on_success` or `on_error` is called, followed by `on_done`. Nothing is called
/// for work that never started.
pub trait AsyncFuture<T>: Send + Sync {
	fn on_success(&self, _result: &T) {}

	fn on_error(&self, _error: &JobError) {}

	fn on_done(&self, _result: Option<&T>, _error: Option<&JobError>) {}
}
