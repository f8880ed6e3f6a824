use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};

/// Timestamp used for "never happened".
pub const NEVER: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// Source of the current time.
///
/// Every age threshold in the cache (write timeout, sync timeout, idle entry
/// close) is evaluated against this, so tests can move time explicitly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.lock().unwrap() = t;
    }

    pub fn advance(&self, d: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// True if `t` lies further in the past than `age` relative to `now`.
///
/// [`NEVER`] is older than any age.
pub fn is_older_than(t: DateTime<Utc>, now: DateTime<Utc>, age: TimeDelta) -> bool {
    match now.checked_sub_signed(age) {
        Some(threshold) => t < threshold,
        None => false,
    }
}
