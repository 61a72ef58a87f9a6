//! Concrete [`gardener_core::Saver`], [`gardener_core::LeaseStore`], and
//! [`gardener_core::CursorSaver`] implementations.
//!
//! Two backings are provided:
//! - [`pg`] -- Postgres, for production, using `SELECT ... FOR UPDATE`
//!   inside a transaction for the single-row read-modify-write, in the
//!   same style as the rest of the corpus's Postgres integrations.
//! - [`local`] -- a single JSON file on disk, for local development and
//!   integration tests that don't want a database.

pub mod local;
pub mod pg;

pub use local::{LocalCursorSaver, LocalLeaseStore, LocalSaver};
pub use pg::{PgCursorSaver, PgLeaseStore, PgSaver};
