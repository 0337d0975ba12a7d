use sd_job_system::{
	AsyncFuture, CallableInterceptor, FutureHandle, InterceptorPosition, JobContext, JobError,
	JobInput, JobManager, Next,
};

use std::sync::Arc;

use parking_lot::Mutex;
use tracing_test::traced_test;

mod common;

use common::{test_config, RecordingCallback};

type Trace = Arc<Mutex<Vec<String>>>;

/// Records what an interceptor sees of the ambient state before and after the rest of the chain.
struct Witness {
	label: &'static str,
	trace: Trace,
}

impl Witness {
	fn new(label: &'static str, trace: &Trace) -> Arc<dyn CallableInterceptor> {
		Arc::new(Self {
			label,
			trace: Arc::clone(trace),
		})
	}
}

impl CallableInterceptor for Witness {
	fn intercept<'a>(&'a self, _future: &'a FutureHandle, next: Next<'a>) -> Next<'a> {
		Box::pin(async move {
			let installed = FutureHandle::current().is_some();
			let tenant = JobContext::current().get_as::<&str>("tenant").copied();

			self.trace
				.lock()
				.push(format!("{} enter current={installed} tenant={tenant:?}", self.label));

			let outcome = next.await;

			self.trace.lock().push(format!(
				"{} exit ok={}",
				self.label,
				outcome.is_ok()
			));

			outcome
		})
	}
}

struct TracingCallback(Trace);

impl AsyncFuture<u32> for TracingCallback {
	fn on_success(&self, result: &u32) {
		self.0.lock().push(format!("on_success {result}"));
	}

	fn on_done(&self, _result: Option<&u32>, _error: Option<&JobError>) {
		self.0.lock().push("on_done".to_string());
	}
}

fn witnessed_manager(name: &str, trace: &Trace) -> JobManager {
	JobManager::builder(test_config(name))
		.with_interceptor(InterceptorPosition::Outer, Witness::new("outer-a", trace))
		.with_interceptor(InterceptorPosition::Outer, Witness::new("outer-b", trace))
		.with_interceptor(InterceptorPosition::Inner, Witness::new("inner", trace))
		.build()
		.unwrap()
}

fn tenant_input() -> JobInput {
	let mut context = JobContext::new();
	context.insert("tenant", "acme");

	JobInput::empty().with_name("witnessed").with_context(context)
}

#[tokio::test]
#[traced_test]
async fn extension_interceptors_wrap_around_built_ins() {
	let trace = Trace::default();
	let manager = witnessed_manager("chain-order", &trace);

	let value = manager
		.schedule_with_callback(
			{
				let trace = Arc::clone(&trace);
				async move {
					trace.lock().push("body".to_string());
					Ok(7_u32)
				}
			},
			Some(tenant_input()),
			Arc::new(TracingCallback(Arc::clone(&trace))),
		)
		.unwrap()
		.get()
		.await
		.unwrap();

	assert_eq!(value, 7);
	assert_eq!(
		trace.lock().as_slice(),
		[
			"outer-a enter current=false tenant=None",
			"outer-b enter current=false tenant=None",
			"inner enter current=true tenant=Some(\"acme\")",
			"body",
			"on_success 7",
			"on_done",
			"inner exit ok=true",
			"outer-b exit ok=true",
			"outer-a exit ok=true",
		]
	);

	manager.shutdown();
}

#[tokio::test]
#[traced_test]
async fn inline_runs_go_through_the_same_chain() {
	let trace = Trace::default();
	let manager = witnessed_manager("chain-inline", &trace);

	let error = manager
		.run_now(
			async { Err::<(), _>(anyhow::anyhow!("nope")) },
			Some(tenant_input()),
		)
		.await
		.unwrap_err();

	assert!(matches!(error, JobError::Failed { ref job, .. } if job == "witnessed"));
	assert_eq!(
		trace.lock().as_slice(),
		[
			"outer-a enter current=false tenant=None",
			"outer-b enter current=false tenant=None",
			"inner enter current=true tenant=Some(\"acme\")",
			"inner exit ok=false",
			"outer-b exit ok=false",
			"outer-a exit ok=false",
		]
	);

	// Nothing installed by the chain leaks out to the caller
	assert!(FutureHandle::current().is_none());
	assert!(JobContext::current().is_empty());

	manager.shutdown();
}

#[tokio::test]
#[traced_test]
async fn callbacks_observe_translated_failures() {
	let manager = JobManager::new(test_config("chain-failure")).unwrap();
	let callback = Arc::new(RecordingCallback::<u32>::default());

	let outcome = manager
		.schedule_with_callback(
			async {
				Err::<u32, _>(anyhow::Error::new(JobError::Interrupted {
					job: "already-translated".to_string(),
				}))
			},
			None,
			Arc::clone(&callback) as _,
		)
		.unwrap()
		.get()
		.await;

	assert!(matches!(
		outcome,
		Err(JobError::Interrupted { ref job }) if job == "already-translated"
	));
	assert!(callback.successes.lock().is_empty());
	assert!(matches!(
		callback.errors.lock().as_slice(),
		[JobError::Interrupted { .. }]
	));
	assert_eq!(callback.done.load(std::sync::atomic::Ordering::SeqCst), 1);

	manager.shutdown();
}
