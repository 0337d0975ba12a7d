//! Decorators wrapped around every execution of a job body.
//!
//! A chain is folded into a single future per execution: the first interceptor of the chain is
//! the outermost one, the job body itself sits below the last one. Every interceptor receives the
//! rest of the chain as `next` and decides what to do around awaiting it.

use std::{
	collections::VecDeque,
	fmt,
	future::Future,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use futures_concurrency::future::Race;
use tracing::{info_span, Instrument};

use super::{
	error::JobError,
	future::{AsyncFuture, FutureHandle},
	thread::panic_message,
};

/// The remainder of a chain, resolving to the translated outcome of the execution.
pub type Next<'a> = BoxFuture<'a, Result<(), JobError>>;

pub trait CallableInterceptor: Send + Sync + 'static {
	fn intercept<'a>(&'a self, future: &'a FutureHandle, next: Next<'a>) -> Next<'a>;
}

#[derive(Clone, Default)]
pub struct CallableChain {
	interceptors: VecDeque<Arc<dyn CallableInterceptor>>,
}

impl fmt::Debug for CallableChain {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CallableChain")
			.field("interceptors", &self.interceptors.len())
			.finish()
	}
}

impl CallableChain {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds an interceptor that wraps all the others.
	pub fn add_first(&mut self, interceptor: Arc<dyn CallableInterceptor>) {
		self.interceptors.push_front(interceptor);
	}

	/// Adds an interceptor right around the job body.
	pub fn add_last(&mut self, interceptor: Arc<dyn CallableInterceptor>) {
		self.interceptors.push_back(interceptor);
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.interceptors.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.interceptors.is_empty()
	}

	pub(crate) fn wrap<'a>(&'a self, future: &'a FutureHandle, core: Next<'a>) -> Next<'a> {
		self.interceptors
			.iter()
			.rev()
			.fold(core, |next, interceptor| interceptor.intercept(future, next))
	}
}

/// Installs the future and its progress monitor as current for the execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentJobInstaller;

impl CallableInterceptor for CurrentJobInstaller {
	fn intercept<'a>(&'a self, future: &'a FutureHandle, next: Next<'a>) -> Next<'a> {
		Box::pin(
			future
				.clone()
				.scope(future.monitor().clone().scope(next)),
		)
	}
}

/// Runs the execution inside a `job` span named after the future, so every event logged by the
/// job carries its name next to the worker thread's name.
#[derive(Debug, Default, Clone, Copy)]
pub struct NameDecorator;

impl CallableInterceptor for NameDecorator {
	fn intercept<'a>(&'a self, future: &'a FutureHandle, next: Next<'a>) -> Next<'a> {
		Box::pin(next.instrument(info_span!("job", name = %future.name(), id = %future.id())))
	}
}

/// Installs a copy of the input's context together with its subject and locale.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextInstaller;

impl CallableInterceptor for ContextInstaller {
	fn intercept<'a>(&'a self, future: &'a FutureHandle, next: Next<'a>) -> Next<'a> {
		let input = future.input();

		Box::pin(input.scope(input.context().clone().scope(next)))
	}
}

/// Runs `body` through `chain` and hands its outcome to the optional callback before it leaves
/// the innermost interceptor.
pub(crate) async fn run_chained<T, F>(
	chain: &CallableChain,
	future: &FutureHandle,
	callback: Option<&dyn AsyncFuture<T>>,
	body: F,
) -> Result<T, JobError>
where
	T: Send,
	F: Future<Output = anyhow::Result<T>> + Send,
{
	let mut slot = None;

	let outcome = chain
		.wrap(
			future,
			Box::pin(async {
				let result = invoke(future, body).await;
				notify(future, callback, &result);

				result.map(|value| slot = Some(value))
			}),
		)
		.await;

	outcome.and_then(|()| {
		slot.ok_or_else(|| JobError::Cancelled {
			job: future.name().to_string(),
		})
	})
}

enum InvokeOutput<T> {
	Finished(Result<T, JobError>),
	Interrupted,
}

async fn invoke<T>(
	future: &FutureHandle,
	body: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, JobError> {
	let job = future.name();

	let output = (
		async {
			InvokeOutput::Finished(match AssertUnwindSafe(body).catch_unwind().await {
				Ok(Ok(value)) => Ok(value),
				Ok(Err(e)) => Err(JobError::translate(job, e)),
				Err(payload) => Err(JobError::Panicked {
					job: job.to_string(),
					message: panic_message(payload.as_ref()),
				}),
			})
		},
		async {
			future.monitor().interrupted().await;
			InvokeOutput::Interrupted
		},
	)
		.race()
		.await;

	match output {
		InvokeOutput::Finished(result) => result,
		InvokeOutput::Interrupted => Err(JobError::Interrupted {
			job: job.to_string(),
		}),
	}
}

fn notify<T>(
	future: &FutureHandle,
	callback: Option<&dyn AsyncFuture<T>>,
	result: &Result<T, JobError>,
) {
	let Some(callback) = callback else {
		return;
	};

	// A panicking callback neither skips `on_done` nor changes the outcome of the job
	let guarded = |call: &dyn Fn()| {
		if let Err(payload) = catch_unwind(AssertUnwindSafe(call)) {
			future.report_panic(payload.as_ref());
		}
	};

	match result {
		Ok(value) => {
			guarded(&|| callback.on_success(value));
			guarded(&|| callback.on_done(Some(value), None));
		}
		Err(e) => {
			guarded(&|| callback.on_error(e));
			guarded(&|| callback.on_done(None, Some(e)));
		}
	}
}
