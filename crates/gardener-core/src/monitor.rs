//! The State-Machine Monitor: watches the tracker, fires registered
//! actions on matching job states, and applies the resulting outcome.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, instrument, warn};

use crate::job::{Job, State};
use crate::metrics::Metrics;
use crate::tracker::Tracker;

/// The tagged result of an action. Modeled as a plain enum rather than an
/// interface-per-outcome, so the Monitor can match on it directly instead
/// of downcasting.
#[derive(Debug)]
pub enum Outcome {
    /// Advance to the action's registered `success_state`. `detail` is
    /// recorded against the *current* state before the transition.
    Success { detail: String },
    /// Leave the state unchanged; `detail` is recorded, and the Monitor
    /// will re-invoke the action on a later tick.
    Retry {
        error: anyhow::Error,
        detail: String,
    },
    /// Transition to `Failed` via `set_job_error`.
    Failure {
        error: anyhow::Error,
        detail: String,
    },
}

impl Outcome {
    pub fn success(detail: impl Into<String>) -> Outcome {
        Outcome::Success {
            detail: detail.into(),
        }
    }

    pub fn retry(error: anyhow::Error, detail: impl Into<String>) -> Outcome {
        Outcome::Retry {
            error,
            detail: detail.into(),
        }
    }

    pub fn failure(error: anyhow::Error, detail: impl Into<String>) -> Outcome {
        Outcome::Failure {
            error,
            detail: detail.into(),
        }
    }

    /// True for `Success` or `Failure`, false for `Retry`.
    pub fn is_done(&self) -> bool {
        !matches!(self, Outcome::Retry { .. })
    }
}

/// A cooperative cancellation signal threaded into every in-flight action.
/// Cancelling the Monitor's root cancels this for everyone; outstanding
/// outcomes already computed are still honored.
#[derive(Clone)]
pub struct Cancellation(watch::Receiver<bool>);

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

type ActionFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;
type ActionFn = Arc<dyn Fn(Cancellation, Job, DateTime<Utc>) -> ActionFuture + Send + Sync>;
type Precondition = Arc<dyn Fn(&Job) -> bool + Send + Sync>;

struct RegisteredAction {
    precondition: Option<Precondition>,
    action: ActionFn,
    success_state: State,
    label: String,
}

/// Watches a [`Tracker`] and drives each job through whatever action is
/// registered for its current state.
pub struct Monitor {
    tracker: Arc<Tracker>,
    metrics: Arc<dyn Metrics>,
    actions: HashMap<State, RegisteredAction>,
    in_flight: DashSet<Job>,
    concurrency: Arc<Semaphore>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Monitor {
    pub fn new(tracker: Arc<Tracker>, metrics: Arc<dyn Metrics>, max_concurrency: usize) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Monitor {
            tracker,
            metrics,
            actions: HashMap::new(),
            in_flight: DashSet::new(),
            concurrency: Arc::new(Semaphore::new(max_concurrency.max(1))),
            cancel_tx,
            cancel_rx,
        }
    }

    /// Registers an action for `state`. Only one action per state is
    /// permitted; registering a second overwrites the first.
    pub fn add_action<F, Fut>(
        &mut self,
        state: State,
        precondition: Option<Precondition>,
        action: F,
        success_state: State,
        label: impl Into<String>,
    ) where
        F: Fn(Cancellation, Job, DateTime<Utc>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.actions.insert(
            state,
            RegisteredAction {
                precondition,
                action: Arc::new(move |c, j, t| Box::pin(action(c, j, t))),
                success_state,
                label: label.into(),
            },
        );
    }

    /// Cancels the Monitor: the `Watch` loop stops arming new actions and
    /// all in-flight actions observe cancellation on their next check.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    fn cancellation(&self) -> Cancellation {
        Cancellation(self.cancel_rx.clone())
    }

    /// Runs the watch loop: sleeps `period`, snapshots the tracker, and
    /// submits the registered action for every job whose current state
    /// has one, skipping jobs that already have an action in flight.
    #[instrument(skip(self))]
    pub async fn watch(self: Arc<Self>, period: StdDuration) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = wait_for_cancel(self.cancel_rx.clone()) => {
                    info!("monitor cancelled, exiting watch loop");
                    return;
                }
            }
            if *self.cancel_rx.borrow() {
                return;
            }
            self.tick().await;
        }
    }

    pub(crate) async fn tick(self: &Arc<Self>) {
        let (jobs, _, _) = self.tracker.get_state();
        for (job, status) in jobs {
            if status.is_done() {
                continue;
            }
            let state = status.state();
            let Some(reg_label) = self.actions.get(&state).map(|r| r.label.clone()) else {
                continue;
            };
            if !self.in_flight.insert(job.clone()) {
                continue; // already in flight for this job
            }
            let precondition_ok = self
                .actions
                .get(&state)
                .and_then(|r| r.precondition.as_ref())
                .map(|p| p(&job))
                .unwrap_or(true);
            if !precondition_ok {
                self.in_flight.remove(&job);
                continue;
            }

            let this = self.clone();
            let entry_time = status.last_state_info().entry_time;
            let permit = this
                .concurrency
                .clone()
                .acquire_owned()
                .await
                .expect("monitor semaphore is never closed");
            tokio::spawn(async move {
                let _permit = permit;
                info!(job = %job, state = %state, action = %reg_label, "submitting action");
                this.run_one(job, state, entry_time).await;
            });
        }
    }

    async fn run_one(self: Arc<Self>, job: Job, state: State, entry_time: DateTime<Utc>) {
        let outcome = {
            let reg = match self.actions.get(&state) {
                Some(r) => r,
                None => {
                    self.in_flight.remove(&job);
                    return;
                }
            };
            let fut = (reg.action)(self.cancellation(), job.clone(), entry_time);
            catch_panicking(fut).await
        };

        let success_state = self.actions.get(&state).map(|r| r.success_state);
        self.apply_outcome(&job, success_state, outcome);
        self.in_flight.remove(&job);
    }

    fn apply_outcome(&self, job: &Job, success_state: Option<State>, outcome: Outcome) {
        match outcome {
            Outcome::Success { detail } => {
                if let Some(next) = success_state {
                    if let Err(e) = self.tracker.set_status(job, next, detail) {
                        warn!(job = %job, error = %e, "failed to apply success transition");
                    }
                }
            }
            Outcome::Retry { error, detail } => {
                self.metrics.warning(&job.experiment, &job.datatype, "Retry");
                if let Err(e) = self.tracker.set_detail(job, detail) {
                    warn!(job = %job, error = %e, "failed to record retry detail");
                }
                info!(job = %job, error = %error, "action will retry");
            }
            Outcome::Failure { error, detail } => {
                if let Err(e) = self.tracker.set_job_error(job, format!("{detail}: {error}")) {
                    error!(job = %job, error = %e, "failed to record job failure");
                }
            }
        }
    }
}

async fn wait_for_cancel(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Any panic inside an action must be recovered and translated into a
/// `Failure`, never allowed to poison the Monitor loop.
async fn catch_panicking(fut: ActionFuture) -> Outcome {
    use futures::FutureExt;
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let msg = panic_message(&panic);
            Outcome::failure(anyhow::anyhow!("action panicked: {msg}"), "panic")
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
