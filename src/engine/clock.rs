// src/engine/clock.rs

use std::fmt::Debug;

use chrono::{DateTime, Utc};

/// Source of "now" for lease and timing decisions, so tests can move time
/// forward without sleeping.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
