//! The boundary between the Monitor and the actual batch-query backend.
//! Building dedup/copy/clean queries and executing them against a real
//! warehouse lives entirely in the backend implementation -- this module
//! only defines the capability the standard monitor wiring depends on,
//! plus a table-driven transient-error classifier so the wiring can decide
//! retry vs. failure without string-matching buried in an action body.

use std::time::Duration;

use async_trait::async_trait;

use crate::job::Job;

/// Which remote operation a standard action is submitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Dedup,
    Copy,
    Clean,
}

/// A substitutable batch-query backend. One production implementation
/// (talking to BigQuery) lives in `gardener-bigquery`; `gardener-testing`
/// provides a scripted fake for tests.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Submits `op` for `job` and returns a handle to poll for
    /// completion. Submission failure (not execution failure) should be
    /// treated as retryable by the caller.
    async fn submit(&self, op: Operation, job: &Job) -> anyhow::Result<Box<dyn RemoteJobHandle>>;
}

/// A handle to a submitted, in-progress remote operation.
#[async_trait]
pub trait RemoteJobHandle: Send {
    async fn wait(self: Box<Self>) -> Result<OperationStats, WaitError>;
}

/// Statistics recorded from a successful operation, for the detail
/// message attached to the job's history.
#[derive(Debug, Clone, Default)]
pub struct OperationStats {
    pub op_duration: Duration,
    pub slot_millis: i64,
    pub rows_affected: i64,
    pub bytes_processed: i64,
    pub bytes_billed: i64,
}

/// An error surfaced while waiting on a remote operation, or while
/// inspecting its terminal status. Carries enough of the original error
/// shape (an HTTP status, if any, and the message) for
/// [`classify_wait_error`] to work without string-matching deep inside
/// the monitor.
#[derive(Debug, Clone)]
pub struct WaitError {
    pub http_status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.http_status {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WaitError {}

/// One named, table-driven transient condition. New transient conditions
/// can be added here without touching the dedup/copy/clean action bodies.
struct TransientCondition {
    name: &'static str,
    matches: fn(&WaitError) -> bool,
}

const TRANSIENT_CONDITIONS: &[TransientCondition] = &[TransientCondition {
    name: "streaming_buffer",
    matches: |e| e.http_status == Some(400) && e.message.contains("streaming buffer"),
}];

/// Returns the name of the transient condition `err` matches, if any.
/// The streaming buffer is the only remote condition known to clear on
/// its own within a bounded wait; everything else is either a
/// programming bug or a quota hit that will not clear without operator
/// intervention.
pub fn classify_wait_error(err: &WaitError) -> Option<&'static str> {
    TRANSIENT_CONDITIONS
        .iter()
        .find(|c| (c.matches)(err))
        .map(|c| c.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_buffer_is_classified_as_transient() {
        let err = WaitError {
            http_status: Some(400),
            message: "streaming buffer cannot be modified".into(),
        };
        assert_eq!(classify_wait_error(&err), Some("streaming_buffer"));
    }

    #[test]
    fn unrelated_400_is_not_transient() {
        let err = WaitError {
            http_status: Some(400),
            message: "invalid query".into(),
        };
        assert_eq!(classify_wait_error(&err), None);
    }

    #[test]
    fn quota_error_is_not_transient() {
        let err = WaitError {
            http_status: Some(403),
            message: "quota exceeded".into(),
        };
        assert_eq!(classify_wait_error(&err), None);
    }
}
