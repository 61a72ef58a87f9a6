//! Exercises `Monitor::watch()` end-to-end over real ticks, rather than
//! calling its internal `tick()` directly as the in-module unit tests do.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use gardener_core::{
    init_tracker, register_standard_actions, Monitor, NoopMetrics, QueryBackend, State,
};
use gardener_testing::{test_job, InMemoryBackend};

#[tokio::test(flavor = "multi_thread")]
async fn watch_loop_drives_a_job_through_the_standard_pipeline() {
    let tracker = init_tracker(
        None,
        Duration::ZERO,
        chrono::Duration::zero(),
        chrono::Duration::hours(1),
    )
    .await;

    let job = test_job("ndt", "A", Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap());
    tracker.add_job(job.clone()).unwrap();
    tracker
        .set_status(&job, State::ParseComplete, "-")
        .unwrap();

    let backend: Arc<dyn QueryBackend> = Arc::new(InMemoryBackend::new());
    let mut monitor = Monitor::new(tracker.clone(), Arc::new(NoopMetrics), 4);
    register_standard_actions(&mut monitor, backend, Arc::new(NoopMetrics));
    let monitor = Arc::new(monitor);

    let watcher = monitor.clone();
    let handle = tokio::spawn(async move { watcher.watch(Duration::from_millis(10)).await });

    // ParseComplete -> Deduplicating -> Copying -> Cleaning -> Complete:
    // four ticks, each submitting and completing instantly against the
    // in-memory backend's default success response.
    let mut reached_complete = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if tracker.get_status(&job).unwrap().state() == State::Complete {
            reached_complete = true;
            break;
        }
    }
    assert!(reached_complete, "job never reached Complete through the watch loop");

    monitor.cancel();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_loop_stops_arming_new_actions_once_cancelled() {
    let tracker = init_tracker(
        None,
        Duration::ZERO,
        chrono::Duration::zero(),
        chrono::Duration::hours(1),
    )
    .await;

    let job = test_job("ndt", "A", Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap());
    tracker.add_job(job.clone()).unwrap();
    tracker
        .set_status(&job, State::ParseComplete, "-")
        .unwrap();

    let backend: Arc<dyn QueryBackend> = Arc::new(InMemoryBackend::new());
    let mut monitor = Monitor::new(tracker.clone(), Arc::new(NoopMetrics), 4);
    register_standard_actions(&mut monitor, backend, Arc::new(NoopMetrics));
    let monitor = Arc::new(monitor);

    monitor.cancel();
    let watcher = monitor.clone();
    // `watch` should return almost immediately since cancellation is
    // observed before the first sleep completes.
    tokio::time::timeout(Duration::from_secs(1), watcher.watch(Duration::from_secs(60)))
        .await
        .expect("watch loop did not exit promptly after cancel");

    // Nothing should have advanced -- the loop never got to tick.
    assert_eq!(tracker.get_status(&job).unwrap().state(), State::ParseComplete);
}
