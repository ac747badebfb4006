//! Injectable time source. Scheduling math runs on epoch seconds;
//! wall-clock formatting goes through `now_utc`.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now_secs(&self) -> f64;

    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.now_secs() as i64, 0).unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        Utc::now().timestamp_millis() as f64 / 1_000.0
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-cranked clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock().expect("clock lock") += secs;
    }

    pub fn set(&self, now: f64) {
        *self.now.lock().expect("clock lock") = now;
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        *self.now.lock().expect("clock lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_deterministically() {
        let clock = ManualClock::new(100.0);
        assert_eq!(clock.now_secs(), 100.0);
        clock.advance(5.5);
        assert_eq!(clock.now_secs(), 105.5);
        clock.set(1_700_000_000.0);
        assert_eq!(clock.now_utc().timestamp(), 1_700_000_000);
    }
}
