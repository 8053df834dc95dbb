//! Wall-clock source for cache entry timestamps.

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Seconds-resolution clock used for touched/load/expiry times.
pub trait Clock: std::fmt::Debug {
    fn now_secs(&self) -> u64;
}

/// Reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(delta) => delta.as_secs(),
            Err(err) => {
                warn!("system clock error: {err}");
                0
            }
        }
    }
}

/// Clock that only moves when told to. Useful for driving expiry deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn new(start_secs: u64) -> Self {
        Self { now: Cell::new(start_secs) }
    }

    pub fn set(&self, secs: u64) {
        self.now.set(secs);
    }

    pub fn advance(&self, secs: u64) {
        self.now.set(self.now.get().saturating_add(secs));
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.get()
    }
}
