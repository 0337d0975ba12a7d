use std::future::Future;

use tokio_util::sync::CancellationToken;

tokio::task_local! {
	static CURRENT_MONITOR: ProgressMonitor;
}

/// Cooperative cancellation signals of one execution.
///
/// Cancelling only raises the flag a job polls with [`ProgressMonitor::is_cancelled`] or awaits
/// with [`ProgressMonitor::cancelled`], interrupting also aborts the job body at its next await
/// point. Both signals cascade to monitors created with [`ProgressMonitor::child`].
#[derive(Debug, Clone, Default)]
pub struct ProgressMonitor {
	cancel: CancellationToken,
	interrupt: CancellationToken,
}

impl ProgressMonitor {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// A monitor that gets cancelled along with this one, but not the other way around.
	#[must_use]
	pub fn child(&self) -> Self {
		Self {
			cancel: self.cancel.child_token(),
			interrupt: self.interrupt.child_token(),
		}
	}

	pub fn cancel(&self, interrupt: bool) {
		self.cancel.cancel();

		if interrupt {
			self.interrupt.cancel();
		}
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	#[must_use]
	pub fn is_interrupted(&self) -> bool {
		self.interrupt.is_cancelled()
	}

	pub async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}

	pub async fn interrupted(&self) {
		self.interrupt.cancelled().await;
	}

	/// The monitor of the job currently executing on this task.
	#[must_use]
	pub fn current() -> Option<Self> {
		CURRENT_MONITOR.try_with(Clone::clone).ok()
	}

	pub(crate) async fn scope<F: Future>(self, fut: F) -> F::Output {
		CURRENT_MONITOR.scope(self, fut).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cancellation_cascades_to_children_only() {
		let parent = ProgressMonitor::new();
		let child = parent.child();
		let grandchild = child.child();

		child.cancel(false);
		assert!(child.is_cancelled());
		assert!(grandchild.is_cancelled());
		assert!(!parent.is_cancelled());

		parent.cancel(true);
		assert!(parent.is_interrupted());
		assert!(grandchild.is_interrupted());
	}

	#[test]
	fn plain_cancel_does_not_interrupt() {
		let monitor = ProgressMonitor::new();

		monitor.cancel(false);

		assert!(monitor.is_cancelled());
		assert!(!monitor.is_interrupted());
	}

	#[tokio::test]
	async fn current_is_only_visible_inside_scope() {
		assert!(ProgressMonitor::current().is_none());

		let monitor = ProgressMonitor::new();
		let seen = monitor
			.clone()
			.scope(async {
				ProgressMonitor::current().map(|current| {
					monitor.cancel(false);
					current.is_cancelled()
				})
			})
			.await;

		assert_eq!(seen, Some(true));
		assert!(ProgressMonitor::current().is_none());
	}
}
