//! The job identity and state-history types that the rest of the crate is
//! built around: [`Job`], [`State`], [`Status`], and the [`JobMap`] that
//! relates them.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A unit of reprocessing work, identified by the tuple of fields below.
/// Two jobs with identical fields are the same job -- `Job` is `Eq + Hash`
/// so it can key a map directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    pub bucket: String,
    pub experiment: String,
    pub datatype: String,
    pub filter: String,
    /// UTC, truncated to a day boundary. Use [`Job::with_date`] rather than
    /// setting this directly to preserve the invariant.
    pub date: DateTime<Utc>,
}

impl Job {
    pub fn new(
        bucket: impl Into<String>,
        experiment: impl Into<String>,
        datatype: impl Into<String>,
        filter: impl Into<String>,
        date: DateTime<Utc>,
    ) -> Self {
        Job {
            bucket: bucket.into(),
            experiment: experiment.into(),
            datatype: datatype.into(),
            filter: filter.into(),
            date: truncate_to_day(date),
        }
    }

    /// Returns a copy of this job stamped with `date`, truncated to a day
    /// boundary.
    pub fn with_date(&self, date: DateTime<Utc>) -> Self {
        let mut j = self.clone();
        j.date = truncate_to_day(date);
        j
    }

    /// Resolve a destination table descriptor, producing a [`JobWithTarget`].
    pub fn with_target(&self, target: impl Into<String>) -> JobWithTarget {
        JobWithTarget {
            job: self.clone(),
            target: target.into(),
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{} {}",
            self.bucket,
            self.experiment,
            self.datatype,
            self.filter,
            self.date.format("%Y/%m/%d"),
        )
    }
}

pub fn truncate_to_day(t: DateTime<Utc>) -> DateTime<Utc> {
    match t.date_naive().and_hms_opt(0, 0, 0) {
        Some(naive) => Utc.from_utc_datetime(&naive),
        None => t,
    }
}

/// A [`Job`] plus the destination table it has been resolved to target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWithTarget {
    pub job: Job,
    pub target: String,
}

impl JobWithTarget {
    pub fn with_date(&self, date: DateTime<Utc>) -> Self {
        JobWithTarget {
            job: self.job.with_date(date),
            target: self.target.clone(),
        }
    }
}

/// A source catalog entry, materialized once at startup into the job
/// service's fixed `jobSpecs` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub bucket: String,
    pub experiment: String,
    pub datatype: String,
    pub filter: String,
    pub target: String,
}

/// The closed set of states a job passes through. The happy path is a
/// total order; `Failed` is a terminal sink reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Init,
    Parsing,
    ParseComplete,
    /// Legacy state retained only so jobs recovered from an older
    /// controller still route through the standard monitor wiring.
    Stabilizing,
    Deduplicating,
    Copying,
    Cleaning,
    Complete,
    Failed,
}

impl State {
    /// A state is "done" iff it is `Complete` or `Failed` -- no further
    /// action will ever be registered against it.
    pub fn is_done(self) -> bool {
        matches!(self, State::Complete | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Init => "Init",
            State::Parsing => "Parsing",
            State::ParseComplete => "ParseComplete",
            State::Stabilizing => "Stabilizing",
            State::Deduplicating => "Deduplicating",
            State::Copying => "Copying",
            State::Cleaning => "Cleaning",
            State::Complete => "Complete",
            State::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// One entry in a [`Status`]'s history: the state entered, when it was
/// entered, and the most recent detail message recorded while in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInfo {
    pub state: State,
    pub entry_time: DateTime<Utc>,
    pub last_update: String,
}

/// The full life history of a single job, owned exclusively by the
/// [`crate::tracker::Tracker`]. All reads return a shallow copy; mutation
/// goes only through Tracker operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    /// Ordered, non-empty. `history[0].state == State::Init`.
    pub history: Vec<StateInfo>,
    pub heartbeat_time: DateTime<Utc>,
    pub update_count: u64,
}

impl Status {
    pub fn new() -> Self {
        let now = Utc::now();
        Status {
            history: vec![StateInfo {
                state: State::Init,
                entry_time: now,
                last_update: String::new(),
            }],
            heartbeat_time: now,
            update_count: 0,
        }
    }

    /// The current (most recent) state-info entry. Panics if `history` is
    /// empty, which the type's invariant forbids.
    pub fn last_state_info(&self) -> &StateInfo {
        self.history.last().expect("Status.history is never empty")
    }

    pub fn state(&self) -> State {
        self.last_state_info().state
    }

    /// Time of the last update to the current state, used both for
    /// expiration and for the `Cleaning`-delay eviction check.
    pub fn detail_time(&self) -> DateTime<Utc> {
        self.last_state_info().entry_time
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Append a new `StateInfo` to history for `state`. No-op if `state`
    /// equals the current state -- callers check that first via
    /// [`Tracker::set_status`](crate::tracker::Tracker::set_status) so the
    /// "history length increases by exactly 1" invariant holds precisely
    /// when the state actually changes.
    pub fn new_state(&mut self, state: State) {
        self.history.push(StateInfo {
            state,
            entry_time: Utc::now(),
            last_update: String::new(),
        });
    }

    /// Set the detail message on the *current* (last) state-info entry,
    /// regardless of whether the state itself is changing this call.
    pub fn set_detail(&mut self, detail: impl Into<String>) {
        if let Some(last) = self.history.last_mut() {
            last.last_update = detail.into();
        }
    }

    pub fn label(&self) -> String {
        self.state().to_string()
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::new()
    }
}

/// Mapping from [`Job`] to [`Status`]. Serializes as an array of
/// `{job, status}` pairs rather than a JSON object, since `Job` is a
/// structured key with no natural string form.
pub type JobMap = HashMap<Job, Status>;

#[derive(Serialize, Deserialize)]
struct JobStatusPair {
    job: Job,
    status: Status,
}

pub fn job_map_to_json(map: &JobMap) -> serde_json::Result<Vec<u8>> {
    let pairs: Vec<JobStatusPair> = map
        .iter()
        .map(|(job, status)| JobStatusPair {
            job: job.clone(),
            status: status.clone(),
        })
        .collect();
    serde_json::to_vec(&pairs)
}

pub fn job_map_from_json(bytes: &[u8]) -> serde_json::Result<JobMap> {
    if bytes.is_empty() {
        return Ok(JobMap::new());
    }
    let pairs: Vec<JobStatusPair> = serde_json::from_slice(bytes)?;
    Ok(pairs
        .into_iter()
        .map(|pair| (pair.job, pair.status))
        .collect())
}

/// True if `t` is at least `delay` in the past.
pub fn older_than(t: DateTime<Utc>, delay: Duration) -> bool {
    delay > Duration::zero() && Utc::now().signed_duration_since(t) > delay
}
