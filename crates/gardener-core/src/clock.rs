//! A time source abstraction, so lease-expiry logic can run against the
//! real wall clock in production and a manually advanceable one in tests.

use chrono::{DateTime, Utc};

/// Anything that can report the current time. Production code uses
/// [`SystemClock`]; tests inject a fake (see `gardener_testing::ManualClock`)
/// to make lease-expiry behavior deterministic instead of depending on real
/// sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock, via `chrono::Utc::now()`. The default everywhere a
/// [`Clock`] is required but not otherwise specified.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_reports_a_sane_time() {
        let before = Utc::now();
        let reported = SystemClock.now();
        let after = Utc::now();
        assert!(reported >= before && reported <= after);
    }
}
