use std::{collections::HashSet, sync::Arc};

use uuid::Uuid;

use super::{
	future::{ExecutionMode, FutureHandle, FutureId},
	listener::{EventFilter, JobChangeEvent, JobChangeEventType},
	semaphore::ExecutionSemaphore,
};

/// Builds predicates over futures for [`JobManager`](crate::JobManager) queries.
///
/// Every criterion that was set must match, an empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct FutureFilter {
	ids: Option<HashSet<FutureId>>,
	names: Option<HashSet<String>>,
	modes: Option<HashSet<ExecutionMode>>,
	manager: Option<Uuid>,
	execution_hints: Option<HashSet<String>>,
	execution_semaphore: Option<ExecutionSemaphore>,
	excluded: Option<FutureId>,
}

impl FutureFilter {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_ids(mut self, ids: impl IntoIterator<Item = FutureId>) -> Self {
		self.ids.get_or_insert_with(HashSet::new).extend(ids);
		self
	}

	#[must_use]
	pub fn with_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
		self.names
			.get_or_insert_with(HashSet::new)
			.extend(names.into_iter().map(Into::into));
		self
	}

	#[must_use]
	pub fn with_modes(mut self, modes: impl IntoIterator<Item = ExecutionMode>) -> Self {
		self.modes.get_or_insert_with(HashSet::new).extend(modes);
		self
	}

	#[must_use]
	pub const fn with_manager(mut self, manager: Uuid) -> Self {
		self.manager = Some(manager);
		self
	}

	/// Matches futures carrying every given hint at the time the filter is applied.
	#[must_use]
	pub fn with_execution_hint(mut self, hint: impl Into<String>) -> Self {
		self.execution_hints
			.get_or_insert_with(HashSet::new)
			.insert(hint.into());
		self
	}

	#[must_use]
	pub fn with_execution_semaphore(mut self, semaphore: ExecutionSemaphore) -> Self {
		self.execution_semaphore = Some(semaphore);
		self
	}

	/// Leaves out the future of the job calling this, if any.
	#[must_use]
	pub fn exclude_current_future(mut self) -> Self {
		self.excluded = FutureHandle::current().map(|future| future.id());
		self
	}

	#[must_use]
	pub fn matches(&self, future: &FutureHandle) -> bool {
		self.ids.as_ref().map_or(true, |ids| ids.contains(&future.id()))
			&& self
				.names
				.as_ref()
				.map_or(true, |names| names.contains(future.name()))
			&& self
				.modes
				.as_ref()
				.map_or(true, |modes| modes.contains(&future.mode()))
			&& self
				.manager
				.map_or(true, |manager| manager == future.manager_id())
			&& self.execution_hints.as_ref().map_or(true, |hints| {
				hints
					.iter()
					.all(|hint| future.contains_execution_hint(hint))
			}) && self.execution_semaphore.as_ref().map_or(true, |semaphore| {
				future.input().execution_semaphore() == Some(semaphore)
			}) && self.excluded != Some(future.id())
	}

	pub fn build(self) -> impl Fn(&FutureHandle) -> bool + Send + Sync + 'static {
		move |future: &FutureHandle| self.matches(future)
	}
}

/// Accepts events of the given future only.
#[must_use]
pub fn event_for_future(id: FutureId) -> EventFilter {
	Arc::new(move |event: &JobChangeEvent| event.future().is_some_and(|future| future.id() == id))
}

#[must_use]
pub fn event_types(types: impl IntoIterator<Item = JobChangeEventType>) -> EventFilter {
	let types = types.into_iter().collect::<HashSet<_>>();

	Arc::new(move |event: &JobChangeEvent| types.contains(&event.kind()))
}
