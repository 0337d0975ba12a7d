use std::{collections::HashMap, pin::pin};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::future::{FutureHandle, FutureId};

/// Futures that didn't reach a terminal state yet.
#[derive(Debug, Default)]
pub(crate) struct Registry {
	futures: Mutex<HashMap<FutureId, FutureHandle>>,
	changed: Notify,
}

impl Registry {
	pub fn insert(&self, future: FutureHandle) {
		self.futures.lock().insert(future.id(), future);
	}

	/// Same as [`Registry::insert`], unless `capacity` futures are already tracked.
	pub fn try_insert(&self, future: FutureHandle, capacity: usize) -> Result<(), usize> {
		let mut futures = self.futures.lock();

		if futures.len() >= capacity {
			return Err(futures.len());
		}

		futures.insert(future.id(), future);

		Ok(())
	}

	pub fn remove(&self, id: FutureId) {
		if self.futures.lock().remove(&id).is_some() {
			self.changed.notify_waiters();
		}
	}

	/// Tracked futures not done yet that match `filter`.
	///
	/// `filter` runs without the lock held, it may call back into the manager.
	pub fn snapshot(&self, filter: impl Fn(&FutureHandle) -> bool) -> Vec<FutureHandle> {
		let tracked = self.futures.lock().values().cloned().collect::<Vec<_>>();

		tracked
			.into_iter()
			.filter(|future| !future.is_done() && filter(future))
			.collect()
	}

	pub fn len(&self) -> usize {
		self.futures.lock().len()
	}

	/// Resolves once no tracked future matches `filter`.
	pub async fn wait_until_done(&self, filter: impl Fn(&FutureHandle) -> bool) {
		loop {
			let mut changed = pin!(self.changed.notified());
			changed.as_mut().enable();

			if self.snapshot(&filter).is_empty() {
				return;
			}

			changed.await;
		}
	}
}
