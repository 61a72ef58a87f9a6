//! In-memory fakes for gardener-core's substitutable capabilities, shared
//! by gardener-core's own dev-dependency tests, gardener-persistence, and
//! gardener-server's integration tests. Kept in one crate so every
//! consumer scripts the same `InMemoryBackend` behavior rather than each
//! rolling its own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use gardener_core::backend::{Operation, OperationStats, QueryBackend, RemoteJobHandle, WaitError};
use gardener_core::clock::{Clock, SystemClock};
use gardener_core::job::{Job, JobMap};
use gardener_core::lease::{LeaseStore, LeaseTxn, LeaseTxnOutcome, OwnerLease};
use gardener_core::service::CursorSaver;
use gardener_core::tracker::{Saver, SaverState};

/// An in-memory [`Saver`]. Round-trips through the same JSON encode/decode
/// path a real backend would use, so tests exercise the wire format too.
#[derive(Default)]
pub struct InMemorySaver {
    state: Mutex<Option<SaverState>>,
}

#[async_trait]
impl Saver for InMemorySaver {
    async fn save(&self, state: &SaverState) -> anyhow::Result<()> {
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<(JobMap, Job)> {
        match self.state.lock().unwrap().clone() {
            Some(state) => {
                let jobs = gardener_core::job::job_map_from_json(&state.jobs)?;
                Ok((jobs, state.last_init))
            }
            None => Ok((JobMap::new(), Job::new("", "", "", "", Utc::now()))),
        }
    }
}

/// A manually advanceable [`Clock`], so lease-expiry tests can assert on
/// "the lease is now expired" without an equivalent real sleep. Backed by
/// microseconds-since-epoch so it's cheap to share across threads via a
/// plain atomic rather than a mutex.
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            micros: AtomicI64::new(start.timestamp_micros()),
        }
    }

    /// Moves the clock forward (or backward, for a negative `delta`) by a
    /// fixed amount.
    pub fn advance(&self, delta: chrono::Duration) {
        self.micros.fetch_add(delta.num_microseconds().expect("delta overflows i64 micros"), Ordering::SeqCst);
    }

    /// Jumps the clock directly to `to`.
    pub fn set(&self, to: DateTime<Utc>) {
        self.micros.store(to.timestamp_micros(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.micros.load(Ordering::SeqCst))
            .single()
            .expect("manual clock holds a valid instant")
    }
}

/// One transaction recorded by [`InMemoryTxnStore`], timestamped by the
/// store's own [`Clock`] so tests can assert on ordering without relying on
/// wall-clock time.
#[derive(Debug, Clone)]
pub struct TxnLogEntry {
    pub at: DateTime<Utc>,
    pub outcome: LeaseTxnOutcome,
}

/// An in-memory [`LeaseStore`] with the transaction log and fault-injection
/// a real store's client library would also give callers: a plain mutex
/// stands in for the serializable transaction a real store provides --
/// sufficient because all contention in tests is within one process -- but
/// every transaction is recorded, and `fail_next_transaction` can simulate
/// the store itself rejecting a handful of attempts (network blip, aborted
/// transaction) to exercise lease/saver retry paths.
pub struct InMemoryTxnStore {
    lease: Mutex<Option<OwnerLease>>,
    log: Mutex<Vec<TxnLogEntry>>,
    fail_next: Mutex<usize>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryTxnStore {
    fn default() -> Self {
        InMemoryTxnStore {
            lease: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            fail_next: Mutex::new(0),
            clock: Arc::new(SystemClock),
        }
    }
}

impl InMemoryTxnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// As [`InMemoryTxnStore::new`], but timestamps its transaction log
    /// through `clock` instead of the real wall clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        InMemoryTxnStore {
            lease: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            fail_next: Mutex::new(0),
            clock,
        }
    }

    /// Every transaction attempted so far, including injected failures, in
    /// order.
    pub fn log(&self) -> Vec<TxnLogEntry> {
        self.log.lock().unwrap().clone()
    }

    /// Makes the next `times` calls to [`LeaseStore::transact`] fail before
    /// reaching `f`, simulating a store-level failure (network blip,
    /// aborted transaction) rather than a logical `NoOp` outcome.
    pub fn fail_next_transaction(&self, times: usize) {
        *self.fail_next.lock().unwrap() = times;
    }
}

#[async_trait]
impl LeaseStore for InMemoryTxnStore {
    async fn transact(
        &self,
        f: Box<dyn FnOnce(Option<OwnerLease>) -> LeaseTxn + Send>,
    ) -> anyhow::Result<LeaseTxnOutcome> {
        {
            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(anyhow::anyhow!("injected transaction failure"));
            }
        }

        let mut guard = self.lease.lock().unwrap();
        let current = guard.clone();
        let outcome = match f(current) {
            LeaseTxn::NoOp(o) => o,
            LeaseTxn::Put(lease, o) => {
                *guard = Some(lease);
                o
            }
            LeaseTxn::Delete(o) => {
                *guard = None;
                o
            }
        };
        self.log.lock().unwrap().push(TxnLogEntry {
            at: self.clock.now(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }
}

/// An in-memory [`CursorSaver`].
#[derive(Default)]
pub struct InMemoryCursorSaver {
    date: Mutex<Option<DateTime<Utc>>>,
}

#[async_trait]
impl CursorSaver for InMemoryCursorSaver {
    async fn save(&self, date: DateTime<Utc>) -> anyhow::Result<()> {
        *self.date.lock().unwrap() = Some(date);
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(*self.date.lock().unwrap())
    }
}

/// One scripted response for an `InMemoryBackend` submission.
pub enum ScriptedResult {
    Success(OperationStats),
    WaitError(WaitError),
    SubmitError(String),
}

/// A scriptable [`QueryBackend`] fake. Responses are queued per
/// [`Operation`] and consumed in order; a queue that runs dry falls back
/// to an immediate success with default stats, so tests that don't care
/// about a given operation's outcome don't need to script it.
#[derive(Default)]
pub struct InMemoryBackend {
    dedup: Mutex<VecDeque<ScriptedResult>>,
    copy: Mutex<VecDeque<ScriptedResult>>,
    clean: Mutex<VecDeque<ScriptedResult>>,
    submissions: Mutex<Vec<(Operation, Job)>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_for(&self, op: Operation) -> &Mutex<VecDeque<ScriptedResult>> {
        match op {
            Operation::Dedup => &self.dedup,
            Operation::Copy => &self.copy,
            Operation::Clean => &self.clean,
        }
    }

    /// Queues a response to be returned the next time `op` is submitted.
    pub fn push(&self, op: Operation, result: ScriptedResult) {
        self.queue_for(op).lock().unwrap().push_back(result);
    }

    /// Every (operation, job) pair submitted so far, in order.
    pub fn submissions(&self) -> Vec<(Operation, Job)> {
        self.submissions.lock().unwrap().clone()
    }
}

struct InMemoryHandle(ScriptedResult);

#[async_trait]
impl RemoteJobHandle for InMemoryHandle {
    async fn wait(self: Box<Self>) -> Result<OperationStats, WaitError> {
        match self.0 {
            ScriptedResult::Success(stats) => Ok(stats),
            ScriptedResult::WaitError(err) => Err(err),
            ScriptedResult::SubmitError(_) => {
                unreachable!("submit errors are surfaced from submit(), not wait()")
            }
        }
    }
}

#[async_trait]
impl QueryBackend for InMemoryBackend {
    async fn submit(
        &self,
        op: Operation,
        job: &Job,
    ) -> anyhow::Result<Box<dyn RemoteJobHandle>> {
        self.submissions.lock().unwrap().push((op, job.clone()));
        let next = self.queue_for(op).lock().unwrap().pop_front();
        match next {
            Some(ScriptedResult::SubmitError(msg)) => Err(anyhow::anyhow!(msg)),
            Some(other) => Ok(Box::new(InMemoryHandle(other))),
            None => Ok(Box::new(InMemoryHandle(ScriptedResult::Success(
                OperationStats::default(),
            )))),
        }
    }
}

/// Convenience builders for test jobs, avoiding repetitive `Job::new` calls
/// scattered across every test module.
pub fn test_job(experiment: &str, datatype: &str, date: DateTime<Utc>) -> Job {
    Job::new("test-bucket", experiment, datatype, "20*", date)
}
