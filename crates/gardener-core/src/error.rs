//! Each subsystem gets its own error enum rather than one crate-wide
//! error, so callers can match on exactly the conditions that subsystem
//! can produce.

use thiserror::Error;

/// Errors from [`crate::tracker::Tracker`] operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The job is absent from the tracker -- caller bug or a
    /// time-of-check/time-of-use race with eviction.
    #[error("job not found")]
    NotFound,

    /// `AddJob` was called for a job that is already present and still
    /// in flight (neither done nor failed).
    #[error("job already exists")]
    AlreadyExists,

    /// The configured [`crate::tracker::Saver`] failed during `Sync` or
    /// `InitTracker`'s initial load.
    #[error("saver error: {0}")]
    Saver(#[source] anyhow::Error),
}

/// Errors from [`crate::service::JobService`] construction and operation.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid start date")]
    InvalidStartDate,

    #[error("nil parameter not allowed")]
    NilParameter,

    #[error("no job specs configured")]
    NoJobSpecs,

    #[error("saver error: {0}")]
    Saver(#[source] anyhow::Error),
}

/// Lease protocol conditions.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// `Renew` found a different owner recorded -- the caller MUST stop
    /// all operations requiring ownership.
    #[error("lost ownership lease")]
    LostLease,

    /// `Renew` found a pending handoff request and relinquished the
    /// lease early.
    #[error("another instance has requested ownership")]
    OwnershipRequested,

    /// `DeleteLease` was called by an instance that does not hold the
    /// lease.
    #[error("owner does not match instance")]
    NotOwner,

    /// `TakeOwnershipIfAvailable` found an unexpired lease held by
    /// someone else.
    #[error("lease not available")]
    NotAvailable,

    /// The lease record is missing required fields.
    #[error("invalid owner lease state")]
    InvalidState,

    /// The underlying transactional store failed.
    #[error("lease store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from [`crate::schedule::RegularEvent`] construction.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("bad parameter: {0}")]
    BadParameter(&'static str),
}
