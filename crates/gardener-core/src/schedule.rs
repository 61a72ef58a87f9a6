//! A single timed callback with jitter and cancellation. Used to drive
//! the Monitor's `Watch` loop, the Tracker's save loop's sibling concerns,
//! and the Lease's renewal ticks.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::error::ScheduleError;

type Callback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// An event that fires at `first_fire + U[0, fuzz)`, then (if `interval`
/// is non-zero) re-arms for `first_fire + k*interval + U[0, fuzz)`.
///
/// Concurrent fires of the callback are prevented by an async run-lock:
/// if the callback is still running when the next tick arrives, the next
/// tick waits rather than overlapping.
pub struct RegularEvent {
    name: String,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    active: Arc<std::sync::atomic::AtomicBool>,
}

impl RegularEvent {
    /// Creates and immediately arms a new event. `first_fire` is an
    /// instant relative to now (use `Duration::ZERO` to fire ~immediately,
    /// modulo fuzz).
    ///
    /// Validates: if `interval != 0`, `fuzz` must not exceed `interval`.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        f: F,
        first_fire: Duration,
        interval: Duration,
        fuzz: Duration,
    ) -> Result<Arc<RegularEvent>, ScheduleError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !interval.is_zero() && fuzz > interval {
            return Err(ScheduleError::BadParameter("fuzz must not exceed interval"));
        }

        let callback: Callback = Arc::new(move || Box::pin(f()));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let active = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let name = name.into();

        let event = Arc::new(RegularEvent {
            name: name.clone(),
            cancel_tx: Mutex::new(Some(cancel_tx)),
            handle: Mutex::new(None),
            active: active.clone(),
        });

        let run_lock = Arc::new(tokio::sync::Mutex::new(()));
        let handle = tokio::spawn(run_loop(
            name,
            callback,
            first_fire,
            interval,
            fuzz,
            cancel_rx,
            run_lock,
            active,
        ));

        *event.handle.lock().unwrap() = Some(handle);

        Ok(event)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff a future fire is still armed.
    pub fn active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Stops future fires. A racing run that has already started the
    /// callback is allowed to finish; it will not be rescheduled.
    #[instrument(skip(self), fields(event = %self.name))]
    pub async fn cancel(&self) {
        let tx = self.cancel_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.active.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    name: String,
    callback: Callback,
    first_fire: Duration,
    interval: Duration,
    fuzz: Duration,
    mut cancel_rx: oneshot::Receiver<()>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    active: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut next_delay = jittered(first_fire, fuzz);
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                active.store(false, std::sync::atomic::Ordering::SeqCst);
                return;
            }
            _ = tokio::time::sleep(next_delay) => {}
        }

        if cancel_rx.try_recv().is_ok() {
            active.store(false, std::sync::atomic::Ordering::SeqCst);
            return;
        }

        {
            let _guard = run_lock.lock().await;
            tracing::debug!(event = %name, "firing");
            callback().await;
        }

        if interval.is_zero() {
            active.store(false, std::sync::atomic::Ordering::SeqCst);
            return;
        }
        next_delay = jittered(interval, fuzz);
    }
}

fn jittered(base: Duration, fuzz: Duration) -> Duration {
    if fuzz.is_zero() {
        base
    } else {
        base + Duration::from_nanos(fastrand::u64(0..fuzz.as_nanos().min(u64::MAX as u128) as u64))
    }
}
