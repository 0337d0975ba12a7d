use std::{
	any::Any,
	fmt, io,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
};

use tokio::runtime::{Builder, Runtime};
use tracing::error;

/// Receives panics that escaped a job's decorator chain on a worker thread, like panicking
/// [`AsyncFuture`](crate::AsyncFuture) callbacks.
pub trait UncaughtPanicHandler: Send + Sync + 'static {
	fn handle_panic(&self, thread_name: &str, job: &str, message: &str);
}

/// Default handler, just logs the panic with the name of the thread it happened on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPanicHandler;

impl UncaughtPanicHandler for LogPanicHandler {
	fn handle_panic(&self, thread_name: &str, job: &str, message: &str) {
		error!(%thread_name, %job, "Uncaught panic on job worker thread: {message}");
	}
}

/// Names worker threads as `<name>-<sequence>`, the sequence starting at 1 and shared by every
/// clone of the factory.
#[derive(Clone)]
pub struct NamedThreadFactory {
	name: Arc<str>,
	sequence: Arc<AtomicUsize>,
	panic_handler: Arc<dyn UncaughtPanicHandler>,
}

impl fmt::Debug for NamedThreadFactory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("NamedThreadFactory")
			.field("name", &self.name)
			.field("sequence", &self.sequence.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

impl NamedThreadFactory {
	#[must_use]
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into().into(),
			sequence: Arc::new(AtomicUsize::new(0)),
			panic_handler: Arc::new(LogPanicHandler),
		}
	}

	#[must_use]
	pub fn with_panic_handler(mut self, panic_handler: Arc<dyn UncaughtPanicHandler>) -> Self {
		self.panic_handler = panic_handler;
		self
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn next_thread_name(&self) -> String {
		format!(
			"{}-{}",
			self.name,
			self.sequence.fetch_add(1, Ordering::Relaxed) + 1
		)
	}

	/// Builds a multi-threaded runtime whose threads are all named by this factory.
	pub fn build_runtime(&self, worker_threads: usize) -> io::Result<Runtime> {
		let factory = self.clone();

		Builder::new_multi_thread()
			.worker_threads(worker_threads)
			.thread_name_fn(move || factory.next_thread_name())
			.enable_all()
			.build()
	}

	pub(crate) fn report_panic(&self, job: &str, payload: &(dyn Any + Send)) {
		let thread = std::thread::current();

		self.panic_handler.handle_panic(
			thread.name().unwrap_or("<unnamed>"),
			job,
			&panic_message(payload),
		);
	}
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
	payload
		.downcast_ref::<&str>()
		.map(|message| (*message).to_string())
		.or_else(|| payload.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "<non-string panic payload>".to_string())
}

#[cfg(test)]
mod tests {
	use parking_lot::Mutex;

	use super::*;

	#[derive(Default)]
	struct RecordingHandler(Mutex<Vec<(String, String, String)>>);

	impl UncaughtPanicHandler for RecordingHandler {
		fn handle_panic(&self, thread_name: &str, job: &str, message: &str) {
			self.0.lock().push((
				thread_name.to_string(),
				job.to_string(),
				message.to_string(),
			));
		}
	}

	#[test]
	fn names_are_sequenced_across_clones() {
		let factory = NamedThreadFactory::new("loader");
		let clone = factory.clone();

		assert_eq!(factory.next_thread_name(), "loader-1");
		assert_eq!(clone.next_thread_name(), "loader-2");
		assert_eq!(factory.next_thread_name(), "loader-3");
	}

	#[test]
	fn runtime_threads_carry_factory_names() {
		let runtime = NamedThreadFactory::new("pool").build_runtime(2).unwrap();

		let name = runtime
			.block_on(async {
				tokio::spawn(async { std::thread::current().name().map(ToString::to_string) })
					.await
			})
			.unwrap()
			.unwrap();

		assert!(name.starts_with("pool-"), "unexpected thread name {name}");
	}

	#[test]
	fn panics_are_routed_to_handler() {
		let handler = Arc::new(RecordingHandler::default());
		let factory = NamedThreadFactory::new("pool")
			.with_panic_handler(Arc::clone(&handler) as Arc<dyn UncaughtPanicHandler>);

		let payload: Box<dyn Any + Send> = Box::new(String::from("boom"));

		factory.report_panic("sample", payload.as_ref());

		let recorded = handler.0.lock();
		assert_eq!(recorded.len(), 1);
		assert_eq!(recorded[0].1, "sample");
		assert_eq!(recorded[0].2, "boom");
	}

	#[test]
	fn panic_messages_from_str_and_string() {
		let from_str: Box<dyn Any + Send> = Box::new("static");
		let from_string: Box<dyn Any + Send> = Box::new(String::from("owned"));
		let other: Box<dyn Any + Send> = Box::new(42_u8);

		assert_eq!(panic_message(from_str.as_ref()), "static");
		assert_eq!(panic_message(from_string.as_ref()), "owned");
		assert_eq!(panic_message(other.as_ref()), "<non-string panic payload>");
	}
}
