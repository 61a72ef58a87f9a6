//! A [`QueryBackend`] that submits and polls jobs against BigQuery's REST
//! API directly via `reqwest`, rather than pulling in a full cloud SDK --
//! the surface this crate needs (insert a query job, poll it, read back
//! statistics) is small enough that the REST calls are simpler to reason
//! about than a generated client.
//!
//! Building the actual dedup/copy/clean SQL per experiment and datatype is
//! explicitly out of scope for this crate (it belongs to whatever catalog
//! of per-experiment query templates a deployment maintains); `QueryTemplates`
//! below is the seam where that wiring plugs in. The three queries are
//! built here only as a sensible, generic default.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use gardener_core::backend::{Operation, OperationStats, QueryBackend, RemoteJobHandle, WaitError};
use gardener_core::job::{Job, JobWithTarget};

/// Static configuration for talking to one BigQuery project.
#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub project_id: String,
    /// An OAuth2 bearer token with BigQuery scope. Refreshing this token is
    /// the caller's responsibility -- `gardener-server` is expected to wire
    /// in whatever credential provider its deployment uses.
    pub access_token: String,
    /// How often to poll a submitted job while waiting for completion.
    pub poll_interval: Duration,
}

/// The seam between this crate and a deployment's actual per-experiment
/// query catalog. A minimal, table-scan-based default is supplied so the
/// crate is usable out of the box; production deployments are expected to
/// provide their own.
pub trait QueryTemplates: Send + Sync {
    fn dedup_sql(&self, target: &JobWithTarget) -> String;
    fn copy_sql(&self, target: &JobWithTarget) -> String;
    fn clean_sql(&self, target: &JobWithTarget) -> String;
}

/// A generic, last-write-wins dedup/copy/clean template set over a
/// `{target}_raw` / `{target}` table pair, partitioned by `date`.
pub struct DefaultTemplates;

impl QueryTemplates for DefaultTemplates {
    fn dedup_sql(&self, jt: &JobWithTarget) -> String {
        format!(
            "DELETE FROM `{target}_raw` AS a WHERE a.date = '{date}' AND EXISTS ( \
             SELECT 1 FROM `{target}_raw` AS b \
             WHERE b.date = a.date AND b.id = a.id AND b._PARTITIONTIME > a._PARTITIONTIME)",
            target = jt.target,
            date = jt.job.date.format("%Y-%m-%d"),
        )
    }

    fn copy_sql(&self, jt: &JobWithTarget) -> String {
        format!(
            "INSERT INTO `{target}` SELECT * FROM `{target}_raw` WHERE date = '{date}'",
            target = jt.target,
            date = jt.job.date.format("%Y-%m-%d"),
        )
    }

    fn clean_sql(&self, jt: &JobWithTarget) -> String {
        format!(
            "DELETE FROM `{target}_raw` WHERE date = '{date}'",
            target = jt.target,
            date = jt.job.date.format("%Y-%m-%d"),
        )
    }
}

/// A [`QueryBackend`] over BigQuery's `jobs.insert` / `jobs.get` REST
/// surface. `submit` maps each [`Operation`] onto a query built from
/// `templates`; the [`Job`] passed to `submit` carries no target table, so
/// callers using the standard monitor wiring ([`gardener_core::actions`])
/// must resolve the target out of band -- see `resolve` below.
pub struct BigQueryBackend<T: QueryTemplates = DefaultTemplates> {
    client: reqwest::Client,
    config: BigQueryConfig,
    templates: T,
    /// Resolves a bare `Job` to its destination table. The standard
    /// monitor wiring only carries a `Job`, not a `JobWithTarget`, by the
    /// time an action fires; this closure is how a deployment supplies
    /// the missing target without gardener-core needing to know about it.
    resolve: Box<dyn Fn(&Job) -> String + Send + Sync>,
}

impl BigQueryBackend<DefaultTemplates> {
    pub fn new(config: BigQueryConfig, resolve: impl Fn(&Job) -> String + Send + Sync + 'static) -> Self {
        BigQueryBackend {
            client: reqwest::Client::new(),
            config,
            templates: DefaultTemplates,
            resolve: Box::new(resolve),
        }
    }
}

impl<T: QueryTemplates> BigQueryBackend<T> {
    pub fn with_templates(
        config: BigQueryConfig,
        templates: T,
        resolve: impl Fn(&Job) -> String + Send + Sync + 'static,
    ) -> Self {
        BigQueryBackend {
            client: reqwest::Client::new(),
            config,
            templates,
            resolve: Box::new(resolve),
        }
    }

    fn sql_for(&self, op: Operation, target: &JobWithTarget) -> String {
        match op {
            Operation::Dedup => self.templates.dedup_sql(target),
            Operation::Copy => self.templates.copy_sql(target),
            Operation::Clean => self.templates.clean_sql(target),
        }
    }
}

#[derive(serde::Serialize)]
struct InsertJobRequest<'a> {
    configuration: JobConfiguration<'a>,
}

#[derive(serde::Serialize)]
struct JobConfiguration<'a> {
    query: JobQueryConfiguration<'a>,
}

#[derive(serde::Serialize)]
struct JobQueryConfiguration<'a> {
    query: &'a str,
    #[serde(rename = "useLegacySql")]
    use_legacy_sql: bool,
}

#[derive(Deserialize)]
struct InsertJobResponse {
    #[serde(rename = "jobReference")]
    job_reference: JobReference,
}

#[derive(Deserialize)]
struct JobReference {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[async_trait]
impl<T: QueryTemplates> QueryBackend for BigQueryBackend<T> {
    #[instrument(skip(self, job), fields(project = %self.config.project_id))]
    async fn submit(&self, op: Operation, job: &Job) -> anyhow::Result<Box<dyn RemoteJobHandle>> {
        let target = (self.resolve)(job);
        let jt = job.with_target(target);
        let sql = self.sql_for(op, &jt);

        let url = format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/jobs",
            self.config.project_id
        );
        let body = InsertJobRequest {
            configuration: JobConfiguration {
                query: JobQueryConfiguration {
                    query: &sql,
                    use_legacy_sql: false,
                },
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("bigquery jobs.insert failed ({status}): {text}");
        }

        let parsed: InsertJobResponse = response.json().await?;
        debug!(job_id = %parsed.job_reference.job_id, "submitted bigquery job");

        Ok(Box::new(BigQueryJobHandle {
            client: self.client.clone(),
            project_id: self.config.project_id.clone(),
            job_id: parsed.job_reference.job_id,
            access_token: self.config.access_token.clone(),
            poll_interval: self.config.poll_interval,
        }))
    }
}

#[derive(Deserialize)]
struct JobStatusResponse {
    status: JobStatus,
    statistics: Option<JobStatistics>,
}

#[derive(Deserialize)]
struct JobStatus {
    state: String,
    #[serde(rename = "errorResult")]
    error_result: Option<ErrorProto>,
}

#[derive(Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize, Default)]
struct JobStatistics {
    #[serde(rename = "totalSlotMs")]
    total_slot_ms: Option<String>,
    query: Option<QueryStatistics>,
    #[serde(rename = "startTime")]
    start_time: Option<String>,
    #[serde(rename = "endTime")]
    end_time: Option<String>,
}

#[derive(Deserialize, Default)]
struct QueryStatistics {
    #[serde(rename = "numDmlAffectedRows")]
    num_dml_affected_rows: Option<String>,
    #[serde(rename = "totalBytesProcessed")]
    total_bytes_processed: Option<String>,
    #[serde(rename = "totalBytesBilled")]
    total_bytes_billed: Option<String>,
}

struct BigQueryJobHandle {
    client: reqwest::Client,
    project_id: String,
    job_id: String,
    access_token: String,
    poll_interval: Duration,
}

#[async_trait]
impl RemoteJobHandle for BigQueryJobHandle {
    async fn wait(self: Box<Self>) -> Result<OperationStats, WaitError> {
        let url = format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/jobs/{}",
            self.project_id, self.job_id
        );

        loop {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.access_token)
                .send()
                .await
                .map_err(|e| WaitError {
                    http_status: e.status().map(|s| s.as_u16()),
                    message: e.to_string(),
                })?;

            let http_status = response.status().as_u16();
            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(WaitError {
                    http_status: Some(http_status),
                    message: text,
                });
            }

            let parsed: JobStatusResponse = response.json().await.map_err(|e| WaitError {
                http_status: None,
                message: e.to_string(),
            })?;

            if parsed.status.state != "DONE" {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            if let Some(err) = parsed.status.error_result {
                let message = err.message.unwrap_or_else(|| "unknown bigquery error".into());
                let status = if err.reason.as_deref() == Some("invalid") {
                    Some(400)
                } else {
                    None
                };
                warn!(job_id = %self.job_id, %message, "bigquery job finished with error");
                return Err(WaitError {
                    http_status: status,
                    message,
                });
            }

            let stats = parsed.statistics.unwrap_or_default();
            let query_stats = stats.query.unwrap_or_default();
            return Ok(OperationStats {
                op_duration: parse_duration_ms(stats.start_time.as_deref(), stats.end_time.as_deref()),
                slot_millis: parse_i64(stats.total_slot_ms.as_deref()),
                rows_affected: parse_i64(query_stats.num_dml_affected_rows.as_deref()),
                bytes_processed: parse_i64(query_stats.total_bytes_processed.as_deref()),
                bytes_billed: parse_i64(query_stats.total_bytes_billed.as_deref()),
            });
        }
    }
}

fn parse_i64(s: Option<&str>) -> i64 {
    s.and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn parse_duration_ms(start: Option<&str>, end: Option<&str>) -> Duration {
    match (start.and_then(|s| s.parse::<i64>().ok()), end.and_then(|s| s.parse::<i64>().ok())) {
        (Some(start), Some(end)) if end >= start => Duration::from_millis((end - start) as u64),
        _ => Duration::ZERO,
    }
}
