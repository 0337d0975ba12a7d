use sd_job_system::{JobError, JobInput, JobState, Repetition, SubmitError};

use std::{
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

mod common;

use common::{eventually, init_tracing, test_manager};

#[derive(Debug, Default)]
struct Timeline {
	runs: Mutex<Vec<(Instant, Instant)>>,
	overlapping: AtomicBool,
	in_flight: AtomicBool,
}

impl Timeline {
	async fn record(&self, duration: Duration) {
		if self.in_flight.swap(true, Ordering::SeqCst) {
			self.overlapping.store(true, Ordering::SeqCst);
		}

		let start = Instant::now();
		sleep(duration).await;

		self.in_flight.store(false, Ordering::SeqCst);
		self.runs.lock().push((start, Instant::now()));
	}

	fn len(&self) -> usize {
		self.runs.lock().len()
	}
}

#[tokio::test]
async fn fixed_rate_never_overlaps_overrunning_executions() {
	init_tracing();

	let manager = test_manager("fixed-rate");
	let timeline = Arc::new(Timeline::default());
	let duration = Duration::from_millis(120);

	let series = manager
		.schedule_at_fixed_rate(
			{
				let timeline = Arc::clone(&timeline);
				move || {
					let timeline = Arc::clone(&timeline);
					async move {
						timeline.record(duration).await;
						Ok(())
					}
				}
			},
			Duration::ZERO,
			Duration::from_millis(50),
			None,
		)
		.unwrap();

	assert!(eventually(|| timeline.len() >= 3).await);
	assert!(series.cancel(false));

	let runs = timeline.runs.lock().clone();
	for pair in runs.windows(2) {
		assert!(
			pair[1].0 - pair[0].0 >= duration,
			"executions started {:?} apart",
			pair[1].0 - pair[0].0
		);
	}
	assert!(!timeline.overlapping.load(Ordering::SeqCst));
	assert_eq!(series.state(), JobState::Cancelled);

	manager.shutdown();
}

#[tokio::test]
async fn fixed_rate_starts_do_not_drift() {
	init_tracing();

	let manager = test_manager("fixed-rate-drift");
	let timeline = Arc::new(Timeline::default());
	let initial_delay = Duration::from_millis(30);
	let period = Duration::from_millis(60);

	let submitted_at = Instant::now();
	let series = manager
		.schedule_at_fixed_rate(
			{
				let timeline = Arc::clone(&timeline);
				move || {
					let timeline = Arc::clone(&timeline);
					async move {
						timeline.record(Duration::from_millis(20)).await;
						Ok(())
					}
				}
			},
			initial_delay,
			period,
			None,
		)
		.unwrap();

	assert!(eventually(|| timeline.len() >= 6).await);
	assert!(series.cancel(false));

	// Every execution lasts a third of the period, drifting would add up over the series
	let runs = timeline.runs.lock().clone();
	for (k, (start, _)) in runs.iter().enumerate() {
		let due = submitted_at + initial_delay + period * u32::try_from(k).unwrap();
		assert!(*start >= due, "execution {k} started before it was due");
		assert!(
			*start - due < Duration::from_millis(40),
			"execution {k} started {:?} late",
			*start - due
		);
	}

	manager.shutdown();
}

#[tokio::test]
async fn fixed_delay_waits_after_each_execution() {
	init_tracing();

	let manager = test_manager("fixed-delay");
	let timeline = Arc::new(Timeline::default());
	let delay = Duration::from_millis(60);

	let series = manager
		.schedule_with_fixed_delay(
			{
				let timeline = Arc::clone(&timeline);
				move || {
					let timeline = Arc::clone(&timeline);
					async move {
						timeline.record(Duration::from_millis(30)).await;
						Ok(())
					}
				}
			},
			Duration::from_millis(10),
			delay,
			Some(JobInput::empty().with_name("fixed-delay-series")),
		)
		.unwrap();

	assert!(eventually(|| timeline.len() >= 3).await);
	assert!(series.cancel(true));

	let runs = timeline.runs.lock().clone();
	for pair in runs.windows(2) {
		let gap = pair[1].0 - pair[0].1;
		assert!(gap >= delay, "next execution started {gap:?} after the previous ended");
		assert!(gap < delay + Duration::from_millis(500));
	}
	assert!(!timeline.overlapping.load(Ordering::SeqCst));

	manager.shutdown();
}

#[tokio::test]
async fn failing_execution_stops_the_series() {
	init_tracing();

	let manager = test_manager("failing-series");
	let runs = Arc::new(AtomicUsize::new(0));

	let series = manager
		.schedule_with_fixed_delay(
			{
				let runs = Arc::clone(&runs);
				move || {
					let runs = Arc::clone(&runs);
					async move {
						if runs.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
							anyhow::bail!("second execution failed");
						}
						Ok(())
					}
				}
			},
			Duration::ZERO,
			Duration::from_millis(10),
			Some(JobInput::empty().with_name("flaky")),
		)
		.unwrap();

	match series.get_timeout(Duration::from_secs(5)).await {
		Err(JobError::Failed { job, cause }) => {
			assert_eq!(job, "flaky");
			assert_eq!(cause.to_string(), "second execution failed");
		}
		other => panic!("unexpected outcome: {other:?}"),
	}

	assert_eq!(series.state(), JobState::Failed);
	assert!(!series.is_cancelled());
	assert!(!series.cancel(false));

	sleep(Duration::from_millis(100)).await;
	assert_eq!(runs.load(Ordering::SeqCst), 2);

	manager.shutdown();
}

#[tokio::test]
async fn panicking_execution_stops_the_series() {
	init_tracing();

	let manager = test_manager("panicking-series");

	let series = manager
		.schedule_periodic(
			|| async {
				if true {
					panic!("tick exploded");
				}
				Ok(())
			},
			Duration::ZERO,
			Repetition::FixedRate {
				period: Duration::from_millis(10),
			},
			None,
		)
		.unwrap();

	assert!(matches!(
		series.get_timeout(Duration::from_secs(5)).await,
		Err(JobError::Panicked { message, .. }) if message == "tick exploded"
	));
	assert!(series.handle().is_failed());

	manager.shutdown();
}

#[tokio::test]
async fn zero_periods_are_refused() {
	init_tracing();

	let manager = test_manager("zero-period");

	assert!(matches!(
		manager.schedule_at_fixed_rate(|| async { Ok(()) }, Duration::ZERO, Duration::ZERO, None),
		Err(SubmitError::ZeroPeriod(_))
	));
	assert_eq!(manager.tracked_futures(), 0);

	manager.shutdown();
}

#[tokio::test]
async fn shutdown_ends_a_series() {
	init_tracing();

	let manager = test_manager("shutdown-series");

	let series = manager
		.schedule_at_fixed_rate(
			|| async { Ok(()) },
			Duration::ZERO,
			Duration::from_millis(10),
			None,
		)
		.unwrap();

	sleep(Duration::from_millis(50)).await;
	manager.shutdown();

	assert!(matches!(series.get().await, Err(JobError::Cancelled { .. })));
}
