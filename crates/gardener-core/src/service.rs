//! Cycles a date cursor across a catalog of job specs, handing out the
//! next job on demand.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

use crate::error::ServiceError;
use crate::job::{truncate_to_day, Job, JobWithTarget, SourceConfig};

/// Abstract persistence of the service's dispatch cursor. A distinct
/// capability from [`crate::tracker::Saver`]: only the field that
/// actually needs to survive a restart -- the cursor -- is persisted here,
/// rather than the whole service.
#[async_trait]
pub trait CursorSaver: Send + Sync {
    async fn save(&self, date: DateTime<Utc>) -> anyhow::Result<()>;
    async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>>;
}

struct Cursor {
    date: DateTime<Utc>,
    next_index: usize,
}

/// Iterates the catalog of job specs, dispensing the next job to process
/// and advancing the dispatch date once every spec has been emitted for
/// the current date.
pub struct JobService {
    job_specs: Vec<JobWithTarget>,
    start_date: DateTime<Utc>,
    /// If `now - date < stabilization_delay`, `advance_date` wraps back to
    /// `start_date` instead, since the source data for that recent a date
    /// has not had time to stabilize.
    stabilization_delay: Duration,
    saver: Option<Arc<dyn CursorSaver>>,
    cursor: Mutex<Cursor>,
}

impl JobService {
    /// Builds the service's fixed catalog from `sources`, resolving each
    /// entry's destination via `target_base`. Recovers the dispatch date
    /// with the saver taking precedence, falling back to `fallback_date`
    /// (typically the tracker's last-added job date), then clamped up to
    /// `start_date`.
    #[instrument(skip_all)]
    pub async fn new(
        sources: &[SourceConfig],
        start_date: DateTime<Utc>,
        stabilization_delay: Duration,
        saver: Option<Arc<dyn CursorSaver>>,
        fallback_date: DateTime<Utc>,
    ) -> Result<Self, ServiceError> {
        if start_date == DateTime::<Utc>::default() {
            return Err(ServiceError::InvalidStartDate);
        }

        let job_specs: Vec<JobWithTarget> = sources
            .iter()
            .map(|s| {
                let job = Job::new(&s.bucket, &s.experiment, &s.datatype, &s.filter, Utc::now());
                job.with_target(s.target.clone())
            })
            .collect();
        if job_specs.is_empty() {
            return Err(ServiceError::NoJobSpecs);
        }

        let recovered = Self::recover_date(saver.as_deref(), fallback_date, start_date).await;

        Ok(JobService {
            job_specs,
            start_date,
            stabilization_delay,
            saver,
            cursor: Mutex::new(Cursor {
                date: recovered,
                next_index: 0,
            }),
        })
    }

    async fn recover_date(
        saver: Option<&dyn CursorSaver>,
        fallback_date: DateTime<Utc>,
        start_date: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mut date = fallback_date;
        if let Some(saver) = saver {
            match saver.load().await {
                Ok(Some(saved)) => date = saved,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to recover dispatch date from saver"),
            }
        }
        if date < start_date {
            date = start_date;
        }
        date
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    pub fn current_date(&self) -> DateTime<Utc> {
        self.cursor.lock().unwrap().date
    }

    /// Returns the next job to dispatch, stamped with the current cursor
    /// date. When the catalog wraps, advances the date and (if a saver is
    /// configured) persists the new cursor under a 5-second deadline;
    /// errors are logged, not returned.
    #[instrument(skip(self))]
    pub async fn next_job(&self) -> JobWithTarget {
        let (job, wrapped, new_date) = {
            let mut cursor = self.cursor.lock().unwrap();
            let job = self.job_specs[cursor.next_index].with_date(cursor.date);
            cursor.next_index += 1;
            let mut wrapped = false;
            if cursor.next_index >= self.job_specs.len() {
                cursor.date = self.advance_date(cursor.date);
                cursor.next_index = 0;
                wrapped = true;
            }
            (job, wrapped, cursor.date)
        };

        if wrapped {
            if let Some(saver) = &self.saver {
                let result =
                    tokio::time::timeout(StdDuration::from_secs(5), saver.save(new_date)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "failed to persist dispatch cursor"),
                    Err(_) => warn!("persisting dispatch cursor timed out after 5s"),
                }
            }
            info!(date = %new_date, "advanced dispatch date");
        }

        job
    }

    fn advance_date(&self, current: DateTime<Utc>) -> DateTime<Utc> {
        let next = truncate_to_day(current + Duration::days(1));
        if Utc::now().signed_duration_since(next) < self.stabilization_delay {
            self.start_date
        } else {
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sources() -> Vec<SourceConfig> {
        vec![
            SourceConfig {
                bucket: "bkt".into(),
                experiment: "ndt".into(),
                datatype: "A".into(),
                filter: "*".into(),
                target: "a".into(),
            },
            SourceConfig {
                bucket: "bkt".into(),
                experiment: "ndt".into(),
                datatype: "B".into(),
                filter: "*".into(),
                target: "b".into(),
            },
        ]
    }

    #[tokio::test]
    async fn emits_one_of_each_spec_before_advancing_date() {
        // Every catalog entry must be dispensed once before the date
        // advances.
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let svc = JobService::new(&sources(), start, Duration::hours(36), None, start)
            .await
            .unwrap();

        let j1 = svc.next_job().await;
        let j2 = svc.next_job().await;
        let j3 = svc.next_job().await;

        assert_eq!(j1.job.datatype, "A");
        assert_eq!(j1.job.date, start);
        assert_eq!(j2.job.datatype, "B");
        assert_eq!(j2.job.date, start);
        assert_eq!(j3.job.datatype, "A");
        assert_eq!(j3.job.date, truncate_to_day(start + Duration::days(1)));
    }

    #[tokio::test]
    async fn wraps_to_start_date_when_within_stabilization_window() {
        // A date recently advanced to "yesterday" is still within the stabilization
        // window, so the cursor should loop back to start_date rather
        // than dispatch unstable data.
        let almost_now = truncate_to_day(Utc::now());
        let svc = JobService::new(
            &sources(),
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            Duration::hours(36),
            None,
            almost_now,
        )
        .await
        .unwrap();

        let j1 = svc.next_job().await;
        let j2 = svc.next_job().await;
        let j3 = svc.next_job().await;
        assert_eq!(j1.job.date, almost_now);
        assert_eq!(j2.job.date, almost_now);
        // Wrapped: too close to "now" to be stable, loops to start_date.
        assert_eq!(j3.job.date, Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn recovers_date_from_saver_over_fallback() {
        struct FixedSaver(DateTime<Utc>);
        #[async_trait]
        impl CursorSaver for FixedSaver {
            async fn save(&self, _date: DateTime<Utc>) -> anyhow::Result<()> {
                Ok(())
            }
            async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
                Ok(Some(self.0))
            }
        }

        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let saved_date = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        let fallback = Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap();

        let svc = JobService::new(
            &sources(),
            start,
            Duration::hours(36),
            Some(Arc::new(FixedSaver(saved_date))),
            fallback,
        )
        .await
        .unwrap();

        assert_eq!(svc.current_date(), saved_date);
    }

    #[tokio::test]
    async fn empty_catalog_is_rejected() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let err = JobService::new(&[], start, Duration::hours(36), None, start)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoJobSpecs));
    }
}
