//! # gardener-core
//!
//! The reprocessing control plane: tracks every in-flight job through a
//! fixed state machine, hands out the next job to dispatch, drives jobs
//! forward by invoking registered actions against a batch-query backend,
//! and arbitrates which replica instance owns the right to do any of that.
//!
//! ## Core Concepts
//!
//! Four subsystems, each usable independently, composed by `gardener-server`:
//!
//! - [`tracker::Tracker`] -- the authoritative map from [`job::Job`] to
//!   [`job::Status`], periodically persisted through a [`tracker::Saver`].
//! - [`service::JobService`] -- cycles a date cursor across a fixed catalog
//!   of job specs, dispensing the next job on demand.
//! - [`monitor::Monitor`] -- watches a `Tracker` and fires whatever action
//!   is registered for each job's current state ([`actions`] wires up the
//!   standard dedup/copy/clean pipeline against a [`backend::QueryBackend`]).
//! - [`lease::Identity`] -- the ownership handoff protocol that lets
//!   exactly one replica run the above at a time, built over a
//!   [`lease::LeaseStore`].
//!
//! [`schedule::RegularEvent`] is the jittered periodic-callback primitive
//! the server uses to drive the tracker's save loop and the monitor's
//! watch loop.
//!
//! ## Key Invariants
//!
//! 1. A job's current state is always the last entry of its `Status`
//!    history; history only grows, never rewrites.
//! 2. At most one action is ever in flight for a given job at a time.
//! 3. An action's own panic becomes a `Failed` transition, never a crashed
//!    process.
//! 4. Tracker and lease mutations never hold a lock across an `.await`.
//!
//! ## What This Is Not
//!
//! gardener-core is **not**:
//! - A generic workflow or saga engine
//! - A query builder for the backends it drives
//! - A scheduler with cron-like expressiveness (see [`schedule`] for the
//!   one primitive it does offer)

pub mod actions;
pub mod backend;
pub mod clock;
pub mod error;
pub mod job;
pub mod lease;
pub mod metrics;
pub mod monitor;
pub mod schedule;
pub mod service;
pub mod tracker;

// Re-export job/state types (the vocabulary every other module speaks).
pub use job::{Job, JobMap, JobWithTarget, SourceConfig, State, Status};

// Re-export error types.
pub use error::{LeaseError, ScheduleError, ServiceError, TrackerError};

// Re-export the time-source abstraction lease expiry is driven by.
pub use clock::{Clock, SystemClock};

// Re-export metrics.
pub use metrics::{Metrics, NoopMetrics};

// Re-export tracker types.
pub use tracker::{dump_state, init_tracker, load_state, Saver, SaverState, Tracker};

// Re-export the job service.
pub use service::{CursorSaver, JobService};

// Re-export the monitor and its outcome/cancellation vocabulary.
pub use monitor::{Cancellation, Monitor, Outcome};

// Re-export the standard action wiring.
pub use actions::register_standard_actions;

// Re-export the query backend boundary.
pub use backend::{
    classify_wait_error, Operation, OperationStats, QueryBackend, RemoteJobHandle, WaitError,
};

// Re-export the ownership lease protocol.
pub use lease::{Identity, LeaseStore, LeaseTxn, LeaseTxnOutcome, OwnerLease};

// Re-export the periodic scheduling primitive.
pub use schedule::RegularEvent;

// Re-export commonly used external types for convenience.
pub use async_trait::async_trait;
