//! `gardener-server`: process wiring for the reprocessing control plane.
//! Loads configuration, takes the ownership lease, recovers the tracker
//! and job service from Postgres, wires the standard dedup/copy/clean
//! pipeline onto a BigQuery-backed `QueryBackend`, and serves the HTTP
//! dispense endpoint.

mod config;
mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use gardener_bigquery::{BigQueryBackend, BigQueryConfig};
use gardener_core::{init_tracker, register_standard_actions, Identity, JobService, Monitor};
use gardener_persistence::{PgCursorSaver, PgLeaseStore, PgSaver};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gardener_core=debug,gardener_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(project = %config.project, instance = %config.instance_id, "starting gardener-server");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let identity = Identity::new(config.hostname.clone(), config.instance_id.clone())
        .context("invalid instance identity")?;
    let lease_store = Arc::new(PgLeaseStore::new(pool.clone()));

    tracing::info!("waiting for ownership lease");
    identity
        .take_ownership(lease_store.as_ref(), config.lease_interval, false)
        .await
        .context("failed to take ownership lease")?;
    tracing::info!("took ownership, starting controller");

    // Held for the lifetime of `main` -- dropping it would only discard our
    // ability to `cancel()` the renewal loop, not stop the loop itself, but
    // keeping it alive documents the dependency and matches
    // `RegularEvent`'s expected ownership.
    let _lease_renewal = spawn_lease_renewal(identity.clone(), lease_store.clone(), config.lease_interval);

    let saver = Arc::new(PgSaver::new(pool.clone()));
    let tracker = init_tracker(
        Some(saver),
        config.save_interval,
        config.expiration_time,
        config.cleanup_delay,
    )
    .await;

    let cursor_saver = Arc::new(PgCursorSaver::new(pool.clone()));
    let last_job_date = tracker.last_job().date;
    let service = Arc::new(
        JobService::new(
            &config.sources,
            config.start_date,
            config.stabilization_delay,
            Some(cursor_saver),
            last_job_date,
        )
        .await
        .context("failed to build job service")?,
    );

    let access_token = std::env::var("BIGQUERY_ACCESS_TOKEN").unwrap_or_default();
    let backend = Arc::new(BigQueryBackend::new(
        BigQueryConfig {
            project_id: config.project.clone(),
            access_token,
            poll_interval: Duration::from_secs(5),
        },
        {
            let sources = config.sources.clone();
            move |job| {
                sources
                    .iter()
                    .find(|s| {
                        s.bucket == job.bucket
                            && s.experiment == job.experiment
                            && s.datatype == job.datatype
                            && s.filter == job.filter
                    })
                    .map(|s| s.target.clone())
                    .unwrap_or_default()
            }
        },
    ));

    let mut monitor = Monitor::new(
        tracker.clone(),
        Arc::new(gardener_core::NoopMetrics),
        config.monitor_concurrency,
    );
    register_standard_actions(&mut monitor, backend, Arc::new(gardener_core::NoopMetrics));
    let monitor = Arc::new(monitor);
    tokio::spawn(monitor.clone().watch(config.watch_period));

    let state = http::AppState { tracker, service };
    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "listening");
    axum::serve(listener, app)
        .await
        .context("http server exited")?;

    Ok(())
}

/// Renews the ownership lease on a fixed interval. A lost lease is fatal
/// to the process: the health check has nothing left to report to, so the
/// process simply exits and lets its orchestrator restart it.
fn spawn_lease_renewal(
    identity: Identity,
    store: Arc<PgLeaseStore>,
    interval: Duration,
) -> Arc<gardener_core::RegularEvent> {
    gardener_core::RegularEvent::new(
        "lease-renewal",
        move || {
            let identity = identity.clone();
            let store = store.clone();
            async move {
                match identity.renew(store.as_ref(), interval).await {
                    Ok(()) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "lost ownership lease, exiting");
                        std::process::exit(1);
                    }
                }
            }
        },
        interval / 2,
        interval / 2,
        Duration::from_secs(1),
    )
    .expect("lease renewal schedule parameters are valid by construction")
}
