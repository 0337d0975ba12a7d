use std::{any::Any, cell::RefCell, collections::HashMap, fmt, future::Future, sync::Arc};

/// An opaque value stored in a [`JobContext`].
pub type ContextValue = Arc<dyn Any + Send + Sync>;

tokio::task_local! {
	static CURRENT: RefCell<JobContext>;
}

/// Property bag propagated from a running job to the jobs it creates.
///
/// A context is never shared between executions: children receive a flat copy taken when they
/// are created, so later changes on the parent side are invisible to them (and the other way
/// around). Values themselves are reference counted, copying a context doesn't copy them.
///
/// It isn't meant for concurrent mutation, only the execution it is installed for changes it.
#[derive(Clone, Default)]
pub struct JobContext {
	props: Option<HashMap<String, ContextValue>>,
}

impl fmt::Debug for JobContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_set().entries(self.iter().map(|(key, _)| key)).finish()
	}
}

impl JobContext {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn get(&self, key: &str) -> Option<&ContextValue> {
		self.props.as_ref().and_then(|props| props.get(key))
	}

	#[must_use]
	pub fn get_as<V: Any + Send + Sync>(&self, key: &str) -> Option<&V> {
		self.get(key).and_then(|value| value.downcast_ref())
	}

	/// Sets or, when `value` is `None`, removes a property.
	pub fn set(&mut self, key: impl Into<String>, value: Option<ContextValue>) {
		let key = key.into();

		match value {
			Some(value) => {
				self.props.get_or_insert_with(HashMap::new).insert(key, value);
			}
			None => {
				self.remove(&key);
			}
		}
	}

	pub fn insert<V: Any + Send + Sync>(&mut self, key: impl Into<String>, value: V) {
		self.set(key, Some(Arc::new(value)));
	}

	pub fn remove(&mut self, key: &str) -> Option<ContextValue> {
		let props = self.props.as_mut()?;
		let removed = props.remove(key);

		if props.is_empty() {
			self.props = None;
		}

		removed
	}

	pub fn clear(&mut self) {
		self.props = None;
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.props.as_ref().map_or(0, HashMap::len)
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &ContextValue)> {
		self.props
			.iter()
			.flat_map(|props| props.iter().map(|(key, value)| (key.as_str(), value)))
	}

	/// A flat copy of the context installed for the current job, or an empty one outside of jobs.
	#[must_use]
	pub fn current() -> Self {
		CURRENT
			.try_with(|current| current.borrow().clone())
			.unwrap_or_default()
	}

	/// Gives mutable access to the context installed for the current job, returns `None` when
	/// called outside of a job.
	///
	/// # Panics
	///
	/// Will panic if called again from within `f`.
	pub fn with_current<R>(f: impl FnOnce(&mut Self) -> R) -> Option<R> {
		CURRENT
			.try_with(|current| f(&mut current.borrow_mut()))
			.ok()
	}

	pub(crate) async fn scope<F: Future>(self, fut: F) -> F::Output {
		CURRENT.scope(RefCell::new(self), fut).await
	}
}
