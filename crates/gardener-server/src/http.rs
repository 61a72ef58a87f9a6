//! The HTTP dispense endpoint: `POST /job` hands out the next unit of
//! work. Built on `axum`.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use gardener_core::error::TrackerError;
use gardener_core::{JobService, Tracker};

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<Tracker>,
    pub service: Arc<JobService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/job", post(dispense_job))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// `POST /job` -> 200 with the serialized `JobWithTarget`, 500 with
/// `"Job already exists. Try again."` on an `AddJob` conflict. Any other
/// failure mode from the tracker is also a 500 -- the only guidance this
/// endpoint gives its callers is in the body text.
async fn dispense_job(axum::extract::State(state): axum::extract::State<AppState>) -> Response {
    let job_with_target = state.service.next_job().await;

    match state.tracker.add_job(job_with_target.job.clone()) {
        Ok(()) => {
            info!(job = %job_with_target.job, "dispensed job");
            (StatusCode::OK, Json(job_with_target)).into_response()
        }
        Err(TrackerError::AlreadyExists) => {
            warn!(job = %job_with_target.job, "job already in flight, caller should retry");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Job already exists. Try again.",
            )
                .into_response()
        }
        Err(e) => {
            warn!(job = %job_with_target.job, error = %e, "failed to add dispensed job to tracker");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use gardener_core::job::SourceConfig;
    use std::time::Duration as StdDuration;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let tracker = gardener_core::tracker::init_tracker(
            None,
            StdDuration::ZERO,
            ChronoDuration::zero(),
            ChronoDuration::hours(1),
        )
        .await;
        let sources = vec![SourceConfig {
            bucket: "bkt".into(),
            experiment: "ndt".into(),
            datatype: "A".into(),
            filter: "*".into(),
            target: "a".into(),
        }];
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let service = JobService::new(&sources, start, ChronoDuration::hours(36), None, start)
            .await
            .unwrap();
        AppState {
            tracker,
            service: Arc::new(service),
        }
    }

    #[tokio::test]
    async fn post_job_dispenses_and_returns_200() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().method("POST").uri("/job").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_job_is_method_not_allowed() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().method("GET").uri("/job").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn duplicate_dispense_of_an_already_in_flight_job_is_500() {
        // Pre-seed the tracker with the exact job the service is about to
        // dispense (its first call always returns `start_date`), simulating
        // two replicas racing to dispense the same unit of work.
        let state = test_state().await;
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let colliding = gardener_core::job::Job::new("bkt", "ndt", "A", "*", start);
        state.tracker.add_job(colliding).unwrap();

        let app = router(state);
        let response = app
            .oneshot(Request::builder().method("POST").uri("/job").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Job already exists. Try again.");
    }
}
