use std::{
	fmt,
	future::Future,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, OnceLock,
	},
	time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::{
	runtime::{Handle, Runtime},
	sync::Semaphore,
	time::timeout,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
	chain::{
		run_chained, CallableChain, CallableInterceptor, ContextInstaller, CurrentJobInstaller,
		NameDecorator,
	},
	config::JobManagerConfig,
	error::{JobError, StartupError, SubmitError},
	future::{AsyncFuture, ExecutionMode, FutureHandle, JobFuture},
	input::JobInput,
	listener::{JobChangeEvent, JobChangeEventType, JobChangeListeners},
	monitor::ProgressMonitor,
	thread::{NamedThreadFactory, UncaughtPanicHandler},
};

mod registry;
pub(crate) mod worker;

pub(crate) use registry::Registry;
use worker::ExecutionPermit;

/// Where an interceptor registered on the builder sits relative to the built-in ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorPosition {
	/// Wraps the whole chain, it runs before any built-in interceptor
	Outer,
	/// Sits right around the job body, after every built-in interceptor
	Inner,
}

/// State shared by the manager and every future it accepted.
pub(crate) struct Shared {
	pub(crate) id: Uuid,
	pub(crate) name: String,
	pub(crate) config: JobManagerConfig,
	pub(crate) registry: Registry,
	pub(crate) listeners: Arc<JobChangeListeners>,
	pub(crate) chain: CallableChain,
	pub(crate) factory: NamedThreadFactory,
	pub(crate) runtime: Handle,
	pub(crate) permits: Arc<Semaphore>,
	shut_down: AtomicBool,
	gate: RwLock<()>,
}

impl Shared {
	pub(crate) fn is_shut_down(&self) -> bool {
		self.shut_down.load(Ordering::Acquire)
	}

	pub(crate) fn shut_down_error(&self, job: &str) -> SubmitError {
		SubmitError::ShutDown {
			manager: self.name.clone(),
			job: job.to_string(),
		}
	}

	/// Starts tracking `future`, refusing it once the manager is shut down or, given a `capacity`,
	/// saturated. A future tracked here is always seen by a concurrent shutdown.
	pub(crate) fn track(
		&self,
		future: &FutureHandle,
		capacity: Option<usize>,
	) -> Result<(), SubmitError> {
		let _gate = self.gate.read_recursive();

		if self.is_shut_down() {
			return Err(self.shut_down_error(future.name()));
		}

		match capacity {
			Some(capacity) => self
				.registry
				.try_insert(future.clone(), capacity)
				.map_err(|capacity| SubmitError::Saturated {
					manager: self.name.clone(),
					job: future.name().to_string(),
					capacity,
				}),
			None => {
				self.registry.insert(future.clone());
				Ok(())
			}
		}
	}

	/// Tracks a new future and announces it, refusing it once the manager is shut down or
	/// saturated. Refused futures fire no event.
	pub(crate) fn accept(
		self: &Arc<Self>,
		input: JobInput,
		mode: ExecutionMode,
	) -> Result<FutureHandle, SubmitError> {
		let future = FutureHandle::new(Arc::clone(self), input, mode, ProgressMonitor::new());

		self.track(&future, Some(self.config.queue_capacity))?;

		future.fire(JobChangeEventType::Scheduled);

		Ok(future)
	}
}

struct Inner {
	shared: Arc<Shared>,
	runtime: Mutex<Option<Runtime>>,
}

impl Inner {
	fn shutdown(&self) {
		{
			let _gate = self.shared.gate.write();

			if self.shared.shut_down.swap(true, Ordering::AcqRel) {
				warn!(manager = %self.shared.name, "Trying to shutdown a job manager that was already shutdown");
				return;
			}
		}

		info!(manager = %self.shared.name, "Shutting down job manager");

		for future in self.shared.registry.snapshot(|_| true) {
			future.cancel(true);
		}

		self.shared.permits.close();

		self.shared
			.listeners
			.fire_event(&JobChangeEvent::shutdown(self.shared.id));

		if let Some(runtime) = self.runtime.lock().take() {
			runtime.shutdown_background();
		}
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		if !self.shared.is_shut_down() {
			self.shutdown();
		}
	}
}

/// Runs jobs on a pool of named worker threads and keeps track of their futures.
///
/// Cloning is cheap, all clones drive the same pool. The pool shuts down when [`JobManager::shutdown`]
/// is called or the last clone is dropped.
#[derive(Clone)]
pub struct JobManager {
	inner: Arc<Inner>,
}

impl fmt::Debug for JobManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("JobManager")
			.field("id", &self.inner.shared.id)
			.field("name", &self.inner.shared.name)
			.field("tracked", &self.inner.shared.registry.len())
			.field("shut_down", &self.inner.shared.is_shut_down())
			.finish()
	}
}

impl JobManager {
	pub fn new(config: JobManagerConfig) -> Result<Self, StartupError> {
		Self::builder(config).build()
	}

	#[must_use]
	pub fn builder(config: JobManagerConfig) -> JobManagerBuilder {
		JobManagerBuilder {
			config,
			listeners: None,
			panic_handler: None,
			outer: Vec::new(),
			inner: Vec::new(),
		}
	}

	#[must_use]
	pub fn id(&self) -> Uuid {
		self.inner.shared.id
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.inner.shared.name
	}

	#[must_use]
	pub fn config(&self) -> &JobManagerConfig {
		&self.inner.shared.config
	}

	#[must_use]
	pub fn listeners(&self) -> &Arc<JobChangeListeners> {
		&self.inner.shared.listeners
	}

	#[must_use]
	pub fn is_shut_down(&self) -> bool {
		self.inner.shared.is_shut_down()
	}

	/// How many futures are currently tracked, running ones included.
	#[must_use]
	pub fn tracked_futures(&self) -> usize {
		self.inner.shared.registry.len()
	}

	pub(crate) fn shared(&self) -> &Arc<Shared> {
		&self.inner.shared
	}

	/// Runs `work` on the calling task, through the same interceptors as scheduled jobs.
	///
	/// Called from within a running job, the new execution gets a child of the caller's progress
	/// monitor, so cancelling the caller cancels it too.
	#[instrument(skip_all, fields(manager = %self.inner.shared.name))]
	pub async fn run_now<T, F>(&self, work: F, input: Option<JobInput>) -> Result<T, JobError>
	where
		T: Send + Sync,
		F: Future<Output = anyhow::Result<T>> + Send,
	{
		let shared = &self.inner.shared;
		let monitor = ProgressMonitor::current()
			.map_or_else(ProgressMonitor::new, |parent| parent.child());
		let future = FutureHandle::new(
			Arc::clone(shared),
			input.unwrap_or_else(JobInput::defaults),
			ExecutionMode::Sync,
			monitor,
		);

		shared.track(&future, None)?;
		let _guard = CancelOnDrop(&future);

		future.fire(JobChangeEventType::Scheduled);

		let cancelled = || JobError::Cancelled {
			job: future.name().to_string(),
		};

		// Nested in a job that holds the same semaphore, the caller's permit covers this run
		let covered_by_caller = future
			.input()
			.execution_semaphore()
			.is_some_and(|semaphore| {
				FutureHandle::current().is_some_and(|caller| semaphore.is_permit_owner(&caller))
			});

		let _execution_permit = if covered_by_caller {
			None
		} else {
			Some(
				ExecutionPermit::acquire(&future)
					.await
					.ok_or_else(cancelled)?,
			)
		};

		if !future.try_start() {
			return Err(cancelled());
		}

		let result = run_chained(&shared.chain, &future, None, work).await;

		if future.monitor().is_cancelled() {
			future.cancel(false);
		}

		match result {
			Err(e) => {
				future.complete(Some(e.clone()));
				Err(e)
			}

			Ok(_) if future.is_cancelled() => Err(cancelled()),

			Ok(value) => {
				future.complete(None);
				Ok(value)
			}
		}
	}

	/// Submits `work` to the worker pool, returns without waiting for it.
	pub fn schedule<T, F>(&self, work: F, input: Option<JobInput>) -> Result<JobFuture<T>, SubmitError>
	where
		T: Send + Sync + 'static,
		F: Future<Output = anyhow::Result<T>> + Send + 'static,
	{
		self.submit(work, input, None, None)
	}

	/// Like [`JobManager::schedule`], with `callback` notified on the worker once the job is over.
	pub fn schedule_with_callback<T, F>(
		&self,
		work: F,
		input: Option<JobInput>,
		callback: Arc<dyn AsyncFuture<T>>,
	) -> Result<JobFuture<T>, SubmitError>
	where
		T: Send + Sync + 'static,
		F: Future<Output = anyhow::Result<T>> + Send + 'static,
	{
		self.submit(work, input, None, Some(callback))
	}

	/// Like [`JobManager::schedule`], but the job only becomes eligible to run after `delay`.
	pub fn schedule_delayed<T, F>(
		&self,
		work: F,
		delay: Duration,
		input: Option<JobInput>,
	) -> Result<JobFuture<T>, SubmitError>
	where
		T: Send + Sync + 'static,
		F: Future<Output = anyhow::Result<T>> + Send + 'static,
	{
		self.submit(work, input, Some(delay), None)
	}

	pub(crate) fn submit<T, F>(
		&self,
		work: F,
		input: Option<JobInput>,
		delay: Option<Duration>,
		callback: Option<Arc<dyn AsyncFuture<T>>>,
	) -> Result<JobFuture<T>, SubmitError>
	where
		T: Send + Sync + 'static,
		F: Future<Output = anyhow::Result<T>> + Send + 'static,
	{
		let shared = &self.inner.shared;
		let mode = if delay.is_some() {
			ExecutionMode::Delayed
		} else {
			ExecutionMode::Async
		};

		let future = shared.accept(input.unwrap_or_else(JobInput::defaults), mode)?;
		let value = Arc::new(OnceLock::new());

		debug!(future = %future.id(), name = %future.name(), ?mode, "Scheduled job");

		shared.runtime.spawn(worker::execute(
			Arc::clone(shared),
			future.clone(),
			delay,
			work,
			callback,
			Arc::clone(&value),
		));

		Ok(JobFuture::new(future, value))
	}

	/// Whether every tracked future matching `filter` reached a terminal state.
	pub fn is_done(&self, filter: impl Fn(&FutureHandle) -> bool) -> bool {
		self.inner.shared.registry.snapshot(filter).is_empty()
	}

	/// Waits until every future matching `filter` is done, `false` if `duration` elapsed first.
	pub async fn wait_until_done(
		&self,
		filter: impl Fn(&FutureHandle) -> bool,
		duration: Duration,
	) -> bool {
		timeout(duration, self.inner.shared.registry.wait_until_done(filter))
			.await
			.is_ok()
	}

	/// Calls `visitor` for every matching future not done yet, until it returns `false`.
	pub fn visit(
		&self,
		filter: impl Fn(&FutureHandle) -> bool,
		mut visitor: impl FnMut(&FutureHandle) -> bool,
	) {
		for future in self.inner.shared.registry.snapshot(filter) {
			if !visitor(&future) {
				break;
			}
		}
	}

	/// Cancels every future matching `filter`.
	///
	/// Returns `true` if at least one future matched and all of them were cancelled.
	#[instrument(skip(self, filter), fields(manager = %self.inner.shared.name))]
	pub fn cancel(&self, filter: impl Fn(&FutureHandle) -> bool, interrupt_if_running: bool) -> bool {
		let futures = self.inner.shared.registry.snapshot(filter);

		if futures.is_empty() {
			return false;
		}

		let mut all_cancelled = true;
		for future in &futures {
			all_cancelled &= future.cancel(interrupt_if_running);
		}

		all_cancelled
	}

	/// Cancels every job, interrupting running ones, and refuses any further submission.
	pub fn shutdown(&self) {
		self.inner.shutdown();
	}
}

/// Cancels a `run_now` future whose caller stopped polling it, or that panicked.
struct CancelOnDrop<'a>(&'a FutureHandle);

impl Drop for CancelOnDrop<'_> {
	fn drop(&mut self) {
		if !self.0.is_done() {
			self.0.cancel(false);
		}
	}
}

pub struct JobManagerBuilder {
	config: JobManagerConfig,
	listeners: Option<Arc<JobChangeListeners>>,
	panic_handler: Option<Arc<dyn UncaughtPanicHandler>>,
	outer: Vec<Arc<dyn CallableInterceptor>>,
	inner: Vec<Arc<dyn CallableInterceptor>>,
}

impl fmt::Debug for JobManagerBuilder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("JobManagerBuilder")
			.field("config", &self.config)
			.field("outer", &self.outer.len())
			.field("inner", &self.inner.len())
			.finish_non_exhaustive()
	}
}

impl JobManagerBuilder {
	/// Events go to `listeners` instead of a bus owned by the manager.
	#[must_use]
	pub fn with_listeners(mut self, listeners: Arc<JobChangeListeners>) -> Self {
		self.listeners = Some(listeners);
		self
	}

	#[must_use]
	pub fn with_panic_handler(mut self, panic_handler: Arc<dyn UncaughtPanicHandler>) -> Self {
		self.panic_handler = Some(panic_handler);
		self
	}

	/// Interceptors of the same position run in registration order.
	#[must_use]
	pub fn with_interceptor(
		mut self,
		position: InterceptorPosition,
		interceptor: Arc<dyn CallableInterceptor>,
	) -> Self {
		match position {
			InterceptorPosition::Outer => self.outer.push(interceptor),
			InterceptorPosition::Inner => self.inner.push(interceptor),
		}
		self
	}

	pub fn build(self) -> Result<JobManager, StartupError> {
		let Self {
			config,
			listeners,
			panic_handler,
			outer,
			inner,
		} = self;

		config.validate()?;

		let mut factory = NamedThreadFactory::new(config.name.clone());
		if let Some(panic_handler) = panic_handler {
			factory = factory.with_panic_handler(panic_handler);
		}

		let runtime =
			factory
				.build_runtime(config.worker_threads)
				.map_err(|source| StartupError::WorkerPool {
					name: config.name.clone(),
					source,
				})?;

		let mut chain = CallableChain::new();
		chain.add_last(Arc::new(CurrentJobInstaller));
		chain.add_last(Arc::new(NameDecorator));
		chain.add_last(Arc::new(ContextInstaller));
		for interceptor in outer.into_iter().rev() {
			chain.add_first(interceptor);
		}
		for interceptor in inner {
			chain.add_last(interceptor);
		}

		let shared = Arc::new(Shared {
			id: Uuid::new_v4(),
			name: config.name.clone(),
			registry: Registry::default(),
			listeners: listeners.unwrap_or_default(),
			chain,
			factory,
			runtime: runtime.handle().clone(),
			permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
			shut_down: AtomicBool::new(false),
			gate: RwLock::new(()),
			config,
		});

		info!(
			manager = %shared.name,
			worker_threads = shared.config.worker_threads,
			max_concurrent_jobs = shared.config.max_concurrent_jobs,
			"Started job manager"
		);

		Ok(JobManager {
			inner: Arc::new(Inner {
				shared,
				runtime: Mutex::new(Some(runtime)),
			}),
		})
	}
}
