use std::{
	fmt,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::Arc,
};

use parking_lot::RwLock;
use tracing::error;
use uuid::Uuid;

use super::{
	future::{ExecutionMode, FutureHandle},
	thread::panic_message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobChangeEventType {
	Scheduled,
	Started,
	/// The job finished, successfully or not
	Completed,
	Cancelled,
	ExecutionHintAdded,
	ExecutionHintRemoved,
	/// The manager was shut down, such events carry no future
	Shutdown,
}

#[derive(Debug, Clone)]
pub struct JobChangeEvent {
	kind: JobChangeEventType,
	mode: Option<ExecutionMode>,
	future: Option<FutureHandle>,
	execution_hint: Option<String>,
	source: Uuid,
}

impl JobChangeEvent {
	pub(crate) fn for_future(kind: JobChangeEventType, future: &FutureHandle) -> Self {
		Self {
			kind,
			mode: Some(future.mode()),
			future: Some(future.clone()),
			execution_hint: None,
			source: future.manager_id(),
		}
	}

	pub(crate) fn for_execution_hint(
		kind: JobChangeEventType,
		future: &FutureHandle,
		hint: &str,
	) -> Self {
		Self {
			execution_hint: Some(hint.to_string()),
			..Self::for_future(kind, future)
		}
	}

	pub(crate) const fn shutdown(source: Uuid) -> Self {
		Self {
			kind: JobChangeEventType::Shutdown,
			mode: None,
			future: None,
			execution_hint: None,
			source,
		}
	}

	#[must_use]
	pub const fn kind(&self) -> JobChangeEventType {
		self.kind
	}

	#[must_use]
	pub const fn mode(&self) -> Option<ExecutionMode> {
		self.mode
	}

	#[must_use]
	pub const fn future(&self) -> Option<&FutureHandle> {
		self.future.as_ref()
	}

	/// The hint that was added or removed, for execution hint events.
	#[must_use]
	pub fn execution_hint(&self) -> Option<&str> {
		self.execution_hint.as_deref()
	}

	/// Id of the manager that fired the event.
	#[must_use]
	pub const fn source(&self) -> Uuid {
		self.source
	}
}

pub trait JobChangeListener: Send + Sync + 'static {
	fn job_changed(&self, event: &JobChangeEvent);
}

impl<F: Fn(&JobChangeEvent) + Send + Sync + 'static> JobChangeListener for F {
	fn job_changed(&self, event: &JobChangeEvent) {
		self(event);
	}
}

/// Decides which events reach a listener.
pub type EventFilter = Arc<dyn Fn(&JobChangeEvent) -> bool + Send + Sync>;

#[derive(Clone)]
struct Subscription {
	listener: Arc<dyn JobChangeListener>,
	filter: Option<EventFilter>,
}

impl Subscription {
	fn accepts(&self, event: &JobChangeEvent) -> bool {
		self.filter.as_ref().map_or(true, |filter| filter(event))
	}

	fn is(&self, listener: &Arc<dyn JobChangeListener>, filter: Option<&EventFilter>) -> bool {
		same_allocation(&self.listener, listener)
			&& match (&self.filter, filter) {
				(None, None) => true,
				(Some(ours), Some(theirs)) => same_allocation(ours, theirs),
				_ => false,
			}
	}
}

// Compares data pointers only, vtable pointers of the same type may differ between codegen units
fn same_allocation<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
	Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// Event bus for job lifecycle changes.
///
/// Every [`JobChangeListeners::add`] call creates an independent subscription, even for a listener
/// that is already subscribed. Events are delivered synchronously on the firing thread, in
/// registration order.
#[derive(Default)]
pub struct JobChangeListeners {
	subscriptions: RwLock<Vec<Subscription>>,
}

impl fmt::Debug for JobChangeListeners {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("JobChangeListeners")
			.field("subscriptions", &self.len())
			.finish()
	}
}

impl JobChangeListeners {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, listener: Arc<dyn JobChangeListener>, filter: Option<EventFilter>) {
		self.subscriptions
			.write()
			.push(Subscription { listener, filter });
	}

	/// Removes one subscription made with this very listener and filter, compared by identity.
	pub fn remove(
		&self,
		listener: &Arc<dyn JobChangeListener>,
		filter: Option<&EventFilter>,
	) -> bool {
		let mut subscriptions = self.subscriptions.write();

		let Some(index) = subscriptions
			.iter()
			.position(|subscription| subscription.is(listener, filter))
		else {
			return false;
		};

		subscriptions.remove(index);

		true
	}

	pub fn clear(&self) {
		self.subscriptions.write().clear();
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.subscriptions.read().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn fire_event(&self, event: &JobChangeEvent) {
		// Listeners may subscribe or unsubscribe while being notified
		let subscriptions = self.subscriptions.read().clone();

		for subscription in subscriptions
			.iter()
			.filter(|subscription| subscription.accepts(event))
		{
			if let Err(payload) =
				catch_unwind(AssertUnwindSafe(|| subscription.listener.job_changed(event)))
			{
				error!(
					kind = ?event.kind(),
					"Job change listener panicked: {}",
					panic_message(payload.as_ref())
				);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	fn shutdown_event() -> JobChangeEvent {
		JobChangeEvent::shutdown(Uuid::new_v4())
	}

	fn counter() -> (Arc<AtomicUsize>, Arc<dyn JobChangeListener>) {
		let count = Arc::new(AtomicUsize::new(0));
		let listener = {
			let count = Arc::clone(&count);
			Arc::new(move |_: &JobChangeEvent| {
				count.fetch_add(1, Ordering::Relaxed);
			}) as Arc<dyn JobChangeListener>
		};

		(count, listener)
	}

	#[test]
	fn same_listener_subscribes_independently() {
		let listeners = JobChangeListeners::new();
		let (count, listener) = counter();
		let filter: EventFilter =
			Arc::new(|event: &JobChangeEvent| event.kind() == JobChangeEventType::Shutdown);

		listeners.add(Arc::clone(&listener), None);
		listeners.add(Arc::clone(&listener), Some(Arc::clone(&filter)));

		listeners.fire_event(&shutdown_event());
		assert_eq!(count.load(Ordering::Relaxed), 2);

		assert!(listeners.remove(&listener, Some(&filter)));
		assert!(!listeners.remove(&listener, Some(&filter)));
		assert_eq!(listeners.len(), 1);

		listeners.fire_event(&shutdown_event());
		assert_eq!(count.load(Ordering::Relaxed), 3);

		assert!(listeners.remove(&listener, None));
		assert!(listeners.is_empty());
	}

	#[test]
	fn filtered_out_events_are_not_delivered() {
		let listeners = JobChangeListeners::new();
		let (count, listener) = counter();

		listeners.add(
			listener,
			Some(Arc::new(|event: &JobChangeEvent| {
				event.kind() == JobChangeEventType::Started
			})),
		);

		listeners.fire_event(&shutdown_event());
		assert_eq!(count.load(Ordering::Relaxed), 0);
	}

	#[test]
	#[tracing_test::traced_test]
	fn panicking_listener_does_not_stop_fan_out() {
		let listeners = JobChangeListeners::new();
		let (count, listener) = counter();

		listeners.add(
			Arc::new(|_: &JobChangeEvent| panic!("listener exploded")),
			None,
		);
		listeners.add(listener, None);

		listeners.fire_event(&shutdown_event());

		assert_eq!(count.load(Ordering::Relaxed), 1);
		assert!(logs_contain("listener exploded"));
	}
}
