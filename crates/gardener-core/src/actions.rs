//! The canonical pipeline wiring: registers the standard
//! `ParseComplete -> Deduplicating -> Copying -> Cleaning -> Complete` chain
//! (plus the legacy `Stabilizing -> Deduplicating` no-op) onto a
//! [`Monitor`], using a [`QueryBackend`] for the three remote-operation
//! states.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};

use crate::backend::{classify_wait_error, Operation, QueryBackend, WaitError};
use crate::job::{Job, State};
use crate::metrics::Metrics;
use crate::monitor::{Cancellation, Monitor, Outcome};

fn no_op_action(
    _cancel: Cancellation,
    _job: Job,
    _entry_time: DateTime<Utc>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Outcome> + Send>> {
    Box::pin(async { Outcome::success("-") })
}

/// Registers the five standard actions onto `monitor`. Everything but the
/// query construction itself lives here; `backend` supplies that.
pub fn register_standard_actions(
    monitor: &mut Monitor,
    backend: Arc<dyn QueryBackend>,
    metrics: Arc<dyn Metrics>,
) {
    monitor.add_action(
        State::ParseComplete,
        None,
        no_op_action,
        State::Deduplicating,
        "Changing to Deduplicating",
    );

    // Legacy: jobs recovered from an older controller may still be
    // sitting in `Stabilizing`. Route them through the same no-op.
    monitor.add_action(
        State::Stabilizing,
        None,
        no_op_action,
        State::Deduplicating,
        "Changing to Deduplicating (legacy)",
    );

    {
        let backend = backend.clone();
        let metrics = metrics.clone();
        monitor.add_action(
            State::Deduplicating,
            None,
            move |cancel, job, entry_time| {
                run_remote_operation(
                    backend.clone(),
                    metrics.clone(),
                    Operation::Dedup,
                    "Dedup",
                    cancel,
                    job,
                    entry_time,
                )
            },
            State::Copying,
            "Deduplicating",
        );
    }

    {
        let backend = backend.clone();
        let metrics = metrics.clone();
        monitor.add_action(
            State::Copying,
            None,
            move |cancel, job, entry_time| {
                run_remote_operation(
                    backend.clone(),
                    metrics.clone(),
                    Operation::Copy,
                    "Copy",
                    cancel,
                    job,
                    entry_time,
                )
            },
            State::Cleaning,
            "Copying",
        );
    }

    monitor.add_action(
        State::Cleaning,
        None,
        move |cancel, job, entry_time| {
            run_remote_operation(
                backend.clone(),
                metrics.clone(),
                Operation::Clean,
                "Clean",
                cancel,
                job,
                entry_time,
            )
        },
        State::Complete,
        "Cleaning",
    );
}

/// The remote-operation action pattern shared by dedup, copy, and clean:
/// submit, wait, classify, report.
async fn run_remote_operation(
    backend: Arc<dyn QueryBackend>,
    metrics: Arc<dyn Metrics>,
    op: Operation,
    label: &'static str,
    mut cancel: Cancellation,
    job: Job,
    entry_time: DateTime<Utc>,
) -> Outcome {
    let handle = tokio::select! {
        result = backend.submit(op, &job) => match result {
            Ok(h) => h,
            Err(e) => return Outcome::retry(e, "-"),
        },
        _ = cancel.cancelled() => {
            return Outcome::retry(anyhow::anyhow!("cancelled before submission"), "-");
        }
    };

    let wait_result = tokio::select! {
        result = handle.wait() => result,
        _ = cancel.cancelled() => {
            return Outcome::retry(anyhow::anyhow!("cancelled while waiting"), "-");
        }
    };

    let delay = Utc::now().signed_duration_since(entry_time);

    match wait_result {
        Ok(stats) => {
            let msg = format!(
                "{label} took {} (after {} waiting), {:.2} Slot Minutes, {} Rows affected, {} MB Processed, {} MB Billed",
                format_duration(stats.op_duration),
                format_chrono_duration(delay),
                stats.slot_millis as f64 / 60_000.0,
                stats.rows_affected,
                stats.bytes_processed / 1_000_000,
                stats.bytes_billed / 1_000_000,
            );
            Outcome::success(msg)
        }
        Err(e) => classify_and_report(e, &job, label, &metrics),
    }
}

fn classify_and_report(err: WaitError, job: &Job, label: &str, metrics: &Arc<dyn Metrics>) -> Outcome {
    match classify_wait_error(&err) {
        Some("streaming_buffer") => {
            metrics.warning(
                &job.experiment,
                &job.datatype,
                &format!("{label}WaitingForStreamingBuffer"),
            );
            Outcome::retry(err.into(), "waiting for empty streaming buffer")
        }
        _ => {
            metrics.warning(&job.experiment, &job.datatype, &format!("{label}UnknownError"));
            Outcome::failure(err.into(), "unknown error")
        }
    }
}

fn format_duration(d: StdDuration) -> String {
    format!("{:.1}s", d.as_secs_f64())
}

fn format_chrono_duration(d: chrono::Duration) -> String {
    format!("{}m", d.num_minutes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::tracker::init_tracker;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedHandle {
        result: Result<OperationStats, WaitError>,
    }

    use crate::backend::OperationStats;

    #[async_trait]
    impl crate::backend::RemoteJobHandle for ScriptedHandle {
        async fn wait(self: Box<Self>) -> Result<OperationStats, WaitError> {
            self.result
        }
    }

    struct ScriptedBackend {
        streaming_buffer_attempts: AtomicUsize,
    }

    #[async_trait]
    impl QueryBackend for ScriptedBackend {
        async fn submit(
            &self,
            _op: Operation,
            _job: &Job,
        ) -> anyhow::Result<Box<dyn crate::backend::RemoteJobHandle>> {
            let n = self.streaming_buffer_attempts.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(Box::new(ScriptedHandle {
                    result: Err(WaitError {
                        http_status: Some(400),
                        message: "streaming buffer cannot be modified".into(),
                    }),
                }))
            } else {
                Ok(Box::new(ScriptedHandle {
                    result: Ok(OperationStats::default()),
                }))
            }
        }
    }

    fn job() -> Job {
        Job::new(
            "b",
            "exp",
            "dt",
            "f",
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn streaming_buffer_retries_then_succeeds() {
        // A streaming-buffer 400 must retry in place, not fail the job.
        let tracker = init_tracker(
            None,
            StdDuration::ZERO,
            chrono::Duration::zero(),
            chrono::Duration::hours(1),
        )
        .await;
        tracker.add_job(job()).unwrap();
        tracker
            .set_status(&job(), State::Deduplicating, "-")
            .unwrap();

        let backend: Arc<dyn QueryBackend> = Arc::new(ScriptedBackend {
            streaming_buffer_attempts: AtomicUsize::new(0),
        });
        let mut monitor = Monitor::new(tracker.clone(), Arc::new(NoopMetrics), 4);
        register_standard_actions(&mut monitor, backend, Arc::new(NoopMetrics));
        let monitor = Arc::new(monitor);

        monitor.tick().await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let status = tracker.get_status(&job()).unwrap();
        assert_eq!(status.state(), State::Deduplicating, "should remain, not fail");

        monitor.tick().await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let status = tracker.get_status(&job()).unwrap();
        assert_eq!(status.state(), State::Copying);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parse_complete_and_stabilizing_both_route_to_deduplicating() {
        let tracker = init_tracker(
            None,
            StdDuration::ZERO,
            chrono::Duration::zero(),
            chrono::Duration::hours(1),
        )
        .await;
        let backend: Arc<dyn QueryBackend> = Arc::new(ScriptedBackend {
            streaming_buffer_attempts: AtomicUsize::new(1), // always succeed
        });
        let mut monitor = Monitor::new(tracker.clone(), Arc::new(NoopMetrics), 4);
        register_standard_actions(&mut monitor, backend, Arc::new(NoopMetrics));
        let monitor = Arc::new(monitor);

        let j1 = job();
        tracker.add_job(j1.clone()).unwrap();
        tracker.set_status(&j1, State::ParseComplete, "-").unwrap();

        monitor.tick().await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(tracker.get_status(&j1).unwrap().state(), State::Deduplicating);
    }
}
