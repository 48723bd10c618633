use std::cell::Cell;
use std::rc::Rc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to. Clones share the same instant.
#[derive(Clone)]
pub struct ManualClock {
    now: Rc<Cell<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Rc::new(Cell::new(start)) }
    }

    pub fn advance_secs(&self, seconds: f64) {
        self.now.set(self.now.get() + secs(seconds));
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.now.set(at);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Answer from the clock-math collaborator for a time-format spec.
pub struct NextWait {
    pub seconds: f64,
    pub average: f64,
    pub details: String,
}

pub trait ClockMath {
    fn next_wait(&self, time_format: &str, now: DateTime<Utc>) -> Result<NextWait>;
}

/// Trivial collaborator: next wait and average are the same constant.
pub struct FixedInterval(pub f64);

impl ClockMath for FixedInterval {
    fn next_wait(&self, _time_format: &str, _now: DateTime<Utc>) -> Result<NextWait> {
        Ok(NextWait { seconds: self.0, average: self.0, details: String::new() })
    }
}

pub(crate) fn secs(value: f64) -> Duration {
    Duration::milliseconds((value * 1000.0).round() as i64)
}
