//! Time source abstraction
//!
//! Every freshness, staleness and TTL decision in this crate reads time
//! through [`Clock`], so tests can move time forward without sleeping.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;

/// Provides the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by `Utc::now()`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
///
/// Clones share the same underlying instant.
///
/// # Example
///
/// ```
/// use taskrelay_queue::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::default();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(60));
/// assert_eq!((clock.now() - start).num_seconds(), 60);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: std::time::Duration) {
        let delta = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::MAX);
        let mut now = self.now.write();
        *now += delta;
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Shared clock handle used across components
pub type SharedClock = Arc<dyn Clock>;

/// Default shared clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let other = clock.clone();
        let before = other.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!((other.now() - before).num_seconds(), 90);
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::default();
        let target = Utc::now() + ChronoDuration::days(2);
        clock.set(target);
        assert_eq!(clock.now(), target);
    }
}
