//!
//! # Job System
//!
//! Spacedrive's Job System runs units of work on a bounded pool of named worker threads and hands
//! back futures to wait for, query or cancel them.
//!
//! Every execution goes through a chain of interceptors that installs the job's ambient state for
//! the duration of the run, translates failures into a single [`JobError`] and notifies completion
//! callbacks. Aside from that, it provides:
//! - Immediate (`run_now`), deferred and delayed execution;
//! - Periodic execution at a fixed rate or with a fixed delay, executions of a series never overlap;
//! - A [`JobContext`] property bag, copied from a running job into every job it creates;
//! - Cooperative cancellation through a [`ProgressMonitor`], with optional interruption of running jobs;
//! - Reusable [`Job`]s that refuse to run twice at the same time;
//! - [`ExecutionSemaphore`]s running the jobs assigned to them in mutual exclusion (or with a bounded
//!   concurrency), and [`BlockingCondition`]s giving back a job's permit while it waits;
//! - Execution hints tagging futures, so they can be found and cancelled together;
//! - Lifecycle events for subscribed [`JobChangeListener`]s;
//!
//!
//! ## Basic example
//!
//! ```
//! use sd_job_system::{JobManager, JobManagerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = JobManager::new(JobManagerConfig::default()).unwrap();
//!
//!     let future = manager
//!         .schedule(async { Ok(21 * 2) }, None)
//!         .unwrap();
//!
//!     assert_eq!(future.await.unwrap(), 42);
//!
//!     manager.shutdown();
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod blocking;
mod chain;
mod config;
mod context;
mod error;
mod filter;
mod future;
mod input;
mod job;
mod listener;
mod manager;
mod monitor;
mod scheduler;
mod semaphore;
mod thread;

pub use blocking::BlockingCondition;
pub use chain::{
	CallableChain, CallableInterceptor, ContextInstaller, CurrentJobInstaller, NameDecorator, Next,
};
pub use config::JobManagerConfig;
pub use context::{ContextValue, JobContext};
pub use error::{JobError, StartupError, SubmitError};
pub use filter::{event_for_future, event_types, FutureFilter};
pub use future::{AsyncFuture, ExecutionMode, FutureHandle, FutureId, JobFuture, JobState};
pub use input::{JobInput, Locale, Subject};
pub use job::{Callable, Job};
pub use listener::{
	EventFilter, JobChangeEvent, JobChangeEventType, JobChangeListener, JobChangeListeners,
};
pub use manager::{InterceptorPosition, JobManager, JobManagerBuilder};
pub use monitor::ProgressMonitor;
pub use scheduler::Repetition;
pub use semaphore::ExecutionSemaphore;
pub use thread::{LogPanicHandler, NamedThreadFactory, UncaughtPanicHandler};
