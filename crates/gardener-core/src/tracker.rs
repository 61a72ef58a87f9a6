//! The Job Tracker: the in-flight set of jobs, their state histories, and
//! periodic persistence.
//!
//! Concurrency properties:
//! 1. The job map is protected by a single mutex, held only long enough to
//!    read or write it -- never across an `.await`.
//! 2. A background task persists the map to a [`Saver`] on an interval,
//!    skipping the write entirely when nothing has changed since the last
//!    successful save.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::TrackerError;
use crate::job::{job_map_from_json, job_map_to_json, Job, JobMap, State, Status};
use crate::metrics::{Metrics, NoopMetrics};

/// The blob a [`Saver`] persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaverState {
    pub save_time: DateTime<Utc>,
    pub last_init: Job,
    pub jobs: Vec<u8>,
}

/// Abstract load/store of the tracker's opaque state. Two concrete
/// variants are provided in `gardener-persistence`: one Postgres-backed,
/// one file-backed. The tracker depends on this capability, not either
/// implementation.
#[async_trait]
pub trait Saver: Send + Sync {
    async fn save(&self, state: &SaverState) -> anyhow::Result<()>;
    async fn load(&self) -> anyhow::Result<(JobMap, Job)>;
}

struct Inner {
    jobs: JobMap,
    last_job: Job,
    last_modified: DateTime<Utc>,
}

/// Keeps track of all jobs in flight and hands out shallow copies of their
/// status on request.
pub struct Tracker {
    inner: Mutex<Inner>,
    saver: Option<Arc<dyn Saver>>,
    metrics: Arc<dyn Metrics>,
    expiration_time: Duration,
    cleanup_delay: Duration,
    save_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Some(handle) = self.save_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn empty_job() -> Job {
    Job::new("", "", "", "", Utc::now())
}

impl Tracker {
    /// Recovers tracker state from `saver` (if any), then -- if
    /// `save_interval` is non-zero -- starts the background persistence
    /// loop.
    #[instrument(skip_all)]
    pub async fn init(
        saver: Option<Arc<dyn Saver>>,
        metrics: Arc<dyn Metrics>,
        save_interval: StdDuration,
        expiration_time: Duration,
        cleanup_delay: Duration,
    ) -> Arc<Tracker> {
        let (jobs, last_job) = match &saver {
            Some(s) => match s.load().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "failed to recover tracker state, starting empty");
                    (JobMap::new(), empty_job())
                }
            },
            None => (JobMap::new(), empty_job()),
        };

        for (job, status) in jobs.iter() {
            if !status.is_done() {
                metrics.job_started(&job.experiment, &job.datatype);
                metrics.in_flight_delta(&job.experiment, &job.datatype, &status.label(), 1);
            }
        }

        let tracker = Arc::new(Tracker {
            inner: Mutex::new(Inner {
                jobs,
                last_job,
                last_modified: Utc::now(),
            }),
            saver,
            metrics,
            expiration_time,
            cleanup_delay,
            save_task: Mutex::new(None),
        });

        if tracker.saver.is_some() && !save_interval.is_zero() {
            tracker.clone().spawn_save_loop(save_interval);
        }

        tracker
    }

    fn spawn_save_loop(self: Arc<Self>, interval: StdDuration) {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last_save = DateTime::<Utc>::MIN_UTC;
            loop {
                ticker.tick().await;
                match self.sync(last_save).await {
                    Ok(t) => last_save = t,
                    Err(e) => warn!(error = %e, "tracker save failed"),
                }
            }
        });
        *self.save_task.lock().unwrap() = Some(handle);
    }

    /// Number of jobs currently tracked, including `Complete` jobs not yet
    /// evicted by `cleanup_delay`.
    pub fn num_jobs(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    /// Number of jobs in the `Failed` state, as of the last [`get_state`]
    /// snapshot.
    pub fn num_failed(&self) -> usize {
        let (jobs, _, _) = self.get_state();
        jobs.values().filter(|s| s.state() == State::Failed).count()
    }

    pub fn last_job(&self) -> Job {
        self.inner.lock().unwrap().last_job.clone()
    }

    /// Returns a shallow copy of an existing job's status.
    pub fn get_status(&self, job: &Job) -> Result<Status, TrackerError> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(job)
            .cloned()
            .ok_or(TrackerError::NotFound)
    }

    /// Adds a new job. If `job` is already present and its status is
    /// neither done nor `Failed`, fails with [`TrackerError::AlreadyExists`].
    /// If present and done or failed, the entry is replaced (restart
    /// semantics).
    #[instrument(skip(self), fields(job = %job))]
    pub fn add_job(&self, job: Job) -> Result<(), TrackerError> {
        let status = Status::new();
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.jobs.get(&job) {
            if existing.is_done() {
                debug!("restarting completed job");
            } else if existing.state() == State::Failed {
                self.metrics.in_flight_delta(
                    &job.experiment,
                    &job.datatype,
                    &existing.label(),
                    -1,
                );
                debug!("restarting failed job");
            } else {
                return Err(TrackerError::AlreadyExists);
            }
        }

        inner.last_job = job.clone();
        inner.last_modified = Utc::now();
        self.metrics.job_started(&job.experiment, &job.datatype);
        self.metrics
            .in_flight_delta(&job.experiment, &job.datatype, &status.label(), 1);
        inner.jobs.insert(job, status);
        Ok(())
    }

    /// Replaces an existing job's status wholesale. Used by `set_status`,
    /// `set_detail`, `heartbeat`, and `set_job_error`, which all read the
    /// current status via [`get_status`], mutate the shallow copy, and
    /// write it back here.
    #[instrument(skip_all, fields(job = %job))]
    pub fn update_job(&self, job: &Job, new: Status) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock().unwrap();
        let old = inner.jobs.get(job).ok_or(TrackerError::NotFound)?;

        if old.state() != new.state() {
            self.metrics
                .in_flight_delta(&job.experiment, &job.datatype, &old.label(), -1);
            self.metrics
                .in_flight_delta(&job.experiment, &job.datatype, &new.label(), 1);
        }

        inner.last_modified = Utc::now();

        if new.is_done() {
            self.metrics.job_completed(&job.experiment, &job.datatype);
            if self.cleanup_delay.is_zero() {
                inner.jobs.remove(job);
                return Ok(());
            }
        }
        inner.jobs.insert(job.clone(), new);
        Ok(())
    }

    pub fn set_detail(&self, job: &Job, detail: impl Into<String>) -> Result<(), TrackerError> {
        let mut status = self.get_status(job)?;
        status.set_detail(detail);
        status.update_count += 1;
        self.update_job(job, status)
    }

    /// Updates a job's state. If the new state differs from the current
    /// last state, a new history entry is appended; regardless, the
    /// current entry's detail is overwritten and `update_count` advances.
    pub fn set_status(
        &self,
        job: &Job,
        state: State,
        detail: impl Into<String>,
    ) -> Result<(), TrackerError> {
        let mut status = self.get_status(job).map_err(|e| {
            self.metrics
                .warning(&job.experiment, &job.datatype, "NoSuchJob");
            e
        })?;
        let last = status.state();
        status.set_detail(detail);
        if state != last {
            status.new_state(state);
        }
        status.update_count += 1;
        self.update_job(job, status)
    }

    pub fn heartbeat(&self, job: &Job) -> Result<(), TrackerError> {
        let mut status = self.get_status(job)?;
        status.heartbeat_time = Utc::now();
        self.update_job(job, status)
    }

    /// Transitions a job to `Failed`, preserving the prior state in the
    /// detail message for forensics.
    pub fn set_job_error(&self, job: &Job, err: impl AsRef<str>) -> Result<(), TrackerError> {
        let mut status = self.get_status(job)?;
        let old_state = status.state();
        status.new_state(State::Failed);
        status.set_detail(format!("{}: {}", old_state, err.as_ref()));
        self.update_job(job, status)
    }

    /// Returns a shallow copy of the current job map, the last-added job,
    /// and the last-modified time. As a side effect, evicts jobs that are
    /// either stale (untouched for longer than `expiration_time`) or done
    /// and older than `cleanup_delay`.
    #[instrument(skip(self))]
    pub fn get_state(&self) -> (JobMap, Job, DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        let mut out = JobMap::with_capacity(inner.jobs.len());
        let mut to_remove = Vec::new();

        for (job, status) in inner.jobs.iter() {
            let update_time = status.detail_time();
            let stale = self.expiration_time > Duration::zero()
                && Utc::now().signed_duration_since(update_time) > self.expiration_time;
            let stale_done = status.is_done()
                && Utc::now().signed_duration_since(update_time) > self.cleanup_delay;

            if stale || stale_done {
                if !status.is_done() {
                    self.metrics.in_flight_delta(
                        &job.experiment,
                        &job.datatype,
                        &status.label(),
                        -1,
                    );
                    warn!(job = %job, "deleting stale job");
                }
                to_remove.push(job.clone());
            } else {
                out.insert(job.clone(), status.clone());
            }
        }

        if !to_remove.is_empty() {
            inner.last_modified = Utc::now();
            for j in &to_remove {
                inner.jobs.remove(j);
            }
        }

        (out, inner.last_job.clone(), inner.last_modified)
    }

    /// Snapshots the full job state and saves it via the configured
    /// [`Saver`] iff it has changed since `last_save`. Returns the time
    /// the save was attempted regardless of success, so a failing saver
    /// does not stall future retries on one bad write.
    pub async fn sync(&self, last_save: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
        let saver = match &self.saver {
            Some(s) => s,
            None => return Ok(last_save),
        };

        let (jobs, last_init, last_modified) = self.get_state();
        if last_modified <= last_save {
            debug!(?last_modified, ?last_save, "skipping save, nothing changed");
            return Ok(last_save);
        }

        let jsonified = job_map_to_json(&jobs)?;
        let last_try = Utc::now();
        let state = SaverState {
            save_time: Utc::now(),
            last_init,
            jobs: jsonified,
        };

        let result = tokio::time::timeout(StdDuration::from_secs(10), saver.save(&state)).await;
        match result {
            Ok(Ok(())) => Ok(last_try),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow::anyhow!("tracker save timed out after 10s")),
        }
    }
}

/// Loads a [`JobMap`] and the last-init `Job` out of a serialized
/// [`SaverState`] blob (as persisted by [`Tracker::sync`]).
pub fn load_state(blob: &[u8]) -> anyhow::Result<(JobMap, Job)> {
    let state: SaverState = serde_json::from_slice(blob)?;
    let jobs = job_map_from_json(&state.jobs)?;
    Ok((jobs, state.last_init))
}

/// Serializes a [`JobMap`] and last-init `Job` into a [`SaverState`] blob.
pub fn dump_state(jobs: &JobMap, last_init: &Job) -> anyhow::Result<Vec<u8>> {
    let state = SaverState {
        save_time: Utc::now(),
        last_init: last_init.clone(),
        jobs: job_map_to_json(jobs)?,
    };
    Ok(serde_json::to_vec(&state)?)
}

/// Convenience for callers that don't need custom metrics.
pub async fn init_tracker(
    saver: Option<Arc<dyn Saver>>,
    save_interval: StdDuration,
    expiration_time: Duration,
    cleanup_delay: Duration,
) -> Arc<Tracker> {
    Tracker::init(
        saver,
        Arc::new(NoopMetrics),
        save_interval,
        expiration_time,
        cleanup_delay,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(name: &str) -> Job {
        Job::new("b", "exp", name, "f", Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap())
    }

    async fn tracker() -> Arc<Tracker> {
        init_tracker(
            None,
            StdDuration::ZERO,
            Duration::zero(),
            Duration::hours(1),
        )
        .await
    }

    #[tokio::test]
    async fn add_job_then_get_status_starts_in_init() {
        let tr = tracker().await;
        tr.add_job(job("d1")).unwrap();
        let status = tr.get_status(&job("d1")).unwrap();
        assert_eq!(status.history[0].state, State::Init);
    }

    #[tokio::test]
    async fn add_job_twice_while_in_flight_fails() {
        let tr = tracker().await;
        tr.add_job(job("d1")).unwrap();
        let err = tr.add_job(job("d1")).unwrap_err();
        assert!(matches!(err, TrackerError::AlreadyExists));
    }

    #[tokio::test]
    async fn add_job_after_done_restarts() {
        let tr = tracker().await;
        let j = job("d1");
        tr.add_job(j.clone()).unwrap();
        tr.set_status(&j, State::Failed, "boom").unwrap();
        // Should succeed: prior status was done.
        tr.add_job(j.clone()).unwrap();
        let status = tr.get_status(&j).unwrap();
        assert_eq!(status.state(), State::Init);
    }

    #[tokio::test]
    async fn set_status_appends_history_only_on_change() {
        let tr = tracker().await;
        let j = job("d1");
        tr.add_job(j.clone()).unwrap();
        tr.set_status(&j, State::Parsing, "go").unwrap();
        tr.set_status(&j, State::Parsing, "still going").unwrap();
        let status = tr.get_status(&j).unwrap();
        assert_eq!(status.history.len(), 2);
        assert_eq!(status.last_state_info().last_update, "still going");
    }

    #[tokio::test]
    async fn set_job_error_records_prior_state_in_detail() {
        // set_job_error must preserve the prior state in the detail.
        let tr = tracker().await;
        let j = job("d1");
        tr.add_job(j.clone()).unwrap();
        tr.set_status(&j, State::Parsing, "-").unwrap();
        tr.set_status(&j, State::ParseComplete, "-").unwrap();
        tr.set_job_error(&j, "boom").unwrap();

        let status = tr.get_status(&j).unwrap();
        assert_eq!(status.state(), State::Failed);
        assert_eq!(status.history.len(), 4);
        assert_eq!(status.last_state_info().last_update, "ParseComplete: boom");
    }

    #[tokio::test]
    async fn get_state_evicts_expired_non_done_jobs() {
        // Stale non-done jobs must be evicted on the next get_state call.
        let tr = Tracker::init(
            None,
            Arc::new(NoopMetrics),
            StdDuration::ZERO,
            Duration::milliseconds(1),
            Duration::hours(1),
        )
        .await;
        let j = job("d1");
        tr.add_job(j.clone()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let (jobs, _, _) = tr.get_state();
        assert!(!jobs.contains_key(&j));
        assert!(tr.get_status(&j).is_err());
    }

    #[tokio::test]
    async fn sync_is_noop_when_nothing_changed() {
        #[derive(Default)]
        struct CountingSaver(AtomicUsize);
        #[async_trait]
        impl Saver for CountingSaver {
            async fn save(&self, _state: &SaverState) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            async fn load(&self) -> anyhow::Result<(JobMap, Job)> {
                Ok((JobMap::new(), empty_job()))
            }
        }

        let saver = Arc::new(CountingSaver::default());
        let tr = Tracker::init(
            Some(saver.clone()),
            Arc::new(NoopMetrics),
            StdDuration::ZERO,
            Duration::zero(),
            Duration::hours(1),
        )
        .await;

        // Initial state (just constructed) is newer than MIN_UTC, so the
        // first sync does save.
        let t1 = tr.sync(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(saver.0.load(Ordering::SeqCst), 1);

        tr.add_job(job("d1")).unwrap();
        let t2 = tr.sync(t1).await.unwrap();
        assert_eq!(saver.0.load(Ordering::SeqCst), 2);
        assert!(t2 >= t1);

        // No changes since t2: should not save again.
        tr.sync(t2).await.unwrap();
        assert_eq!(saver.0.load(Ordering::SeqCst), 2);
    }
}
