use std::{fmt, sync::Arc};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use super::future::FutureHandle;

struct SemaphoreInner {
	id: Uuid,
	permits: usize,
	semaphore: Arc<Semaphore>,
}

/// Limits how many of the jobs assigned to it execute at the same time, across managers.
///
/// With a single permit the assigned jobs run in mutual exclusion, one after the other in the
/// order they became eligible. A job holds its permit for its whole execution, except while it
/// waits on a [`BlockingCondition`](crate::BlockingCondition).
#[derive(Clone)]
pub struct ExecutionSemaphore(Arc<SemaphoreInner>);

impl fmt::Debug for ExecutionSemaphore {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ExecutionSemaphore")
			.field("id", &self.0.id)
			.field("permits", &self.0.permits)
			.field("available", &self.available_permits())
			.finish()
	}
}

impl PartialEq for ExecutionSemaphore {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}
}

impl Eq for ExecutionSemaphore {}

impl ExecutionSemaphore {
	/// A semaphore with `permits` permits, at least one.
	#[must_use]
	pub fn new(permits: usize) -> Self {
		let permits = permits.max(1);

		Self(Arc::new(SemaphoreInner {
			id: Uuid::new_v4(),
			permits,
			semaphore: Arc::new(Semaphore::new(permits)),
		}))
	}

	/// A single permit semaphore, its jobs never run concurrently.
	#[must_use]
	pub fn mutex() -> Self {
		Self::new(1)
	}

	#[must_use]
	pub fn id(&self) -> Uuid {
		self.0.id
	}

	#[must_use]
	pub fn permits(&self) -> usize {
		self.0.permits
	}

	#[must_use]
	pub fn available_permits(&self) -> usize {
		self.0.semaphore.available_permits()
	}

	/// Whether `future` is assigned to this semaphore and currently holds one of its permits.
	#[must_use]
	pub fn is_permit_owner(&self, future: &FutureHandle) -> bool {
		future.input().execution_semaphore() == Some(self) && future.holds_execution_permit()
	}

	pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
		Arc::clone(&self.0.semaphore).acquire_owned().await
	}
}
