//! Postgres-backed implementations, one table per persisted record, each
//! holding a single row (`id = 1`) that every operation upserts in place.
//!
//! ```sql
//! CREATE TABLE tracker_state (
//!     id SMALLINT PRIMARY KEY DEFAULT 1,
//!     save_time TIMESTAMPTZ NOT NULL,
//!     last_init JSONB NOT NULL,
//!     jobs JSONB NOT NULL
//! );
//!
//! CREATE TABLE owner_lease (
//!     id SMALLINT PRIMARY KEY DEFAULT 1,
//!     hostname TEXT NOT NULL,
//!     instance_id TEXT NOT NULL,
//!     lease_expiration TIMESTAMPTZ NOT NULL,
//!     new_instance_id TEXT NOT NULL DEFAULT ''
//! );
//!
//! CREATE TABLE dispatch_cursor (
//!     id SMALLINT PRIMARY KEY DEFAULT 1,
//!     dispatch_date TIMESTAMPTZ NOT NULL
//! );
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use gardener_core::{
    CursorSaver, Job, JobMap, LeaseStore, LeaseTxn, LeaseTxnOutcome, OwnerLease, Saver, SaverState,
};

/// Persists the tracker's job map and last-added job under a single row.
#[derive(Clone)]
pub struct PgSaver {
    pool: PgPool,
}

impl PgSaver {
    pub fn new(pool: PgPool) -> Self {
        PgSaver { pool }
    }
}

#[async_trait]
impl Saver for PgSaver {
    async fn save(&self, state: &SaverState) -> anyhow::Result<()> {
        let last_init = serde_json::to_value(&state.last_init)?;
        let jobs: serde_json::Value = serde_json::from_slice(&state.jobs)?;
        sqlx::query(
            r#"
            INSERT INTO tracker_state (id, save_time, last_init, jobs)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET save_time = EXCLUDED.save_time,
                last_init = EXCLUDED.last_init,
                jobs = EXCLUDED.jobs
            "#,
        )
        .bind(state.save_time)
        .bind(last_init)
        .bind(jobs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<(JobMap, Job)> {
        let row = sqlx::query("SELECT last_init, jobs FROM tracker_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok((JobMap::new(), Job::new("", "", "", "", Utc::now())));
        };
        let last_init: serde_json::Value = row.get("last_init");
        let jobs: serde_json::Value = row.get("jobs");
        let last_init: Job = serde_json::from_value(last_init)?;
        let jobs_bytes = serde_json::to_vec(&jobs)?;
        let jobs = gardener_core::job::job_map_from_json(&jobs_bytes)?;
        Ok((jobs, last_init))
    }
}

/// Persists the single ownership lease row, with `transact` implemented as
/// a serializable read-modify-write under `SELECT ... FOR UPDATE`.
#[derive(Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        PgLeaseStore { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn transact(
        &self,
        f: Box<dyn FnOnce(Option<OwnerLease>) -> LeaseTxn + Send>,
    ) -> anyhow::Result<LeaseTxnOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT hostname, instance_id, lease_expiration, new_instance_id \
             FROM owner_lease WHERE id = 1 FOR UPDATE",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let current = row.map(|r| OwnerLease {
            hostname: r.get("hostname"),
            instance_id: r.get("instance_id"),
            lease_expiration: r.get("lease_expiration"),
            new_instance_id: r.get("new_instance_id"),
        });

        let outcome = match f(current) {
            LeaseTxn::NoOp(outcome) => outcome,
            LeaseTxn::Put(lease, outcome) => {
                sqlx::query(
                    r#"
                    INSERT INTO owner_lease (id, hostname, instance_id, lease_expiration, new_instance_id)
                    VALUES (1, $1, $2, $3, $4)
                    ON CONFLICT (id) DO UPDATE
                    SET hostname = EXCLUDED.hostname,
                        instance_id = EXCLUDED.instance_id,
                        lease_expiration = EXCLUDED.lease_expiration,
                        new_instance_id = EXCLUDED.new_instance_id
                    "#,
                )
                .bind(&lease.hostname)
                .bind(&lease.instance_id)
                .bind(lease.lease_expiration)
                .bind(&lease.new_instance_id)
                .execute(&mut *tx)
                .await?;
                outcome
            }
            LeaseTxn::Delete(outcome) => {
                sqlx::query("DELETE FROM owner_lease WHERE id = 1")
                    .execute(&mut *tx)
                    .await?;
                outcome
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }
}

/// Persists the job service's dispatch-date cursor.
#[derive(Clone)]
pub struct PgCursorSaver {
    pool: PgPool,
}

impl PgCursorSaver {
    pub fn new(pool: PgPool) -> Self {
        PgCursorSaver { pool }
    }
}

#[async_trait]
impl CursorSaver for PgCursorSaver {
    async fn save(&self, date: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_cursor (id, dispatch_date)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET dispatch_date = EXCLUDED.dispatch_date
            "#,
        )
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT dispatch_date FROM dispatch_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("dispatch_date")))
    }
}
