//! File-backed implementations for local development and tests that don't
//! want to stand up Postgres. The tracker's state, the lease record, and
//! the dispatch cursor each get their own JSON file on disk, written with
//! tokio's async fs so no blocking call happens on an executor thread.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use gardener_core::{
    CursorSaver, Job, JobMap, LeaseStore, LeaseTxn, LeaseTxnOutcome, OwnerLease, Saver, SaverState,
};

/// Serializes the tracker's state to a single JSON file. A `Mutex` guards
/// the write so two concurrent `save` calls can't interleave; `InitTracker`
/// only ever has one save loop, so this is purely a safety net for tests
/// that call `save` directly from more than one task.
pub struct LocalSaver {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalSaver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LocalSaver {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Saver for LocalSaver {
    async fn save(&self, state: &SaverState) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec(state)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<(JobMap, Job)> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => gardener_core::tracker::load_state(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok((JobMap::new(), Job::new("", "", "", "", Utc::now())))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Default)]
struct LeaseFileState {
    lease: Option<OwnerLease>,
}

/// Stores the single lease record as a JSON file. `transact` serializes
/// access through an in-process lock and a whole-file read-modify-write,
/// which is sufficient when only one process touches the file (the normal
/// case for local development).
pub struct LocalLeaseStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LocalLeaseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LocalLeaseStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> anyhow::Result<LeaseFileState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LeaseFileState::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, state: &LeaseFileState) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(state)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for LocalLeaseStore {
    async fn transact(
        &self,
        f: Box<dyn FnOnce(Option<OwnerLease>) -> LeaseTxn + Send>,
    ) -> anyhow::Result<LeaseTxnOutcome> {
        let _guard = self.lock.lock().await;
        let mut state = self.read().await?;

        let outcome = match f(state.lease.take()) {
            LeaseTxn::NoOp(outcome) => outcome,
            LeaseTxn::Put(lease, outcome) => {
                state.lease = Some(lease);
                outcome
            }
            LeaseTxn::Delete(outcome) => {
                state.lease = None;
                outcome
            }
        };

        self.write(&state).await?;
        Ok(outcome)
    }
}

/// Stores the dispatch cursor's date as a single JSON file.
pub struct LocalCursorSaver {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LocalCursorSaver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LocalCursorSaver {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CursorSaver for LocalCursorSaver {
    async fn save(&self, date: DateTime<Utc>) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let bytes = serde_json::to_vec(&date)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gardener_core::job::Status;
    use gardener_core::tracker::dump_state;
    use chrono::TimeZone;

    fn job() -> Job {
        Job::new(
            "b",
            "exp",
            "dt",
            "f",
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn saver_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        let saver = LocalSaver::new(&path);

        let mut jobs = JobMap::new();
        jobs.insert(job(), Status::new());
        let bytes = dump_state(&jobs, &job()).unwrap();
        let state: SaverState = serde_json::from_slice(&bytes).unwrap();

        saver.save(&state).await.unwrap();
        let (loaded_jobs, last_init) = saver.load().await.unwrap();
        assert_eq!(loaded_jobs.len(), 1);
        assert_eq!(last_init, job());
    }

    #[tokio::test]
    async fn saver_load_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let saver = LocalSaver::new(&path);
        let (jobs, _) = saver.load().await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn lease_store_round_trips_a_put() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.json");
        let store = LocalLeaseStore::new(&path);

        let lease = OwnerLease {
            hostname: "h".into(),
            instance_id: "i".into(),
            lease_expiration: Utc::now(),
            new_instance_id: String::new(),
        };
        let lease2 = lease.clone();
        store
            .transact(Box::new(move |_| LeaseTxn::Put(lease2, LeaseTxnOutcome::Ok)))
            .await
            .unwrap();

        store
            .transact(Box::new(move |current| {
                assert_eq!(current, Some(lease));
                LeaseTxn::NoOp(LeaseTxnOutcome::Ok)
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cursor_saver_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let saver = LocalCursorSaver::new(&path);
        assert!(saver.load().await.unwrap().is_none());

        let date = Utc.with_ymd_and_hms(2021, 5, 1, 0, 0, 0).unwrap();
        saver.save(date).await.unwrap();
        assert_eq!(saver.load().await.unwrap(), Some(date));
    }
}
