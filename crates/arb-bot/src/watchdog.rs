//! Silence detector for the private user stream.
//!
//! Fills are only authoritative on the private stream, so a quiet stream
//! means the engine is flying blind: past the timeout the engine trips the
//! same path as a circuit breaker.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct UserStreamWatchdog {
    timeout: Duration,
    last_event: DateTime<Utc>,
}

impl UserStreamWatchdog {
    /// A very large timeout effectively disables the watchdog.
    pub fn new(timeout_sec: i64, now: DateTime<Utc>) -> Self {
        Self {
            timeout: Duration::seconds(timeout_sec.max(1)),
            last_event: now,
        }
    }

    /// Heartbeat: called on every private event (ack, fill, cancel, reject).
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_event = now;
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        now - self.last_event > self.timeout
    }

    pub fn silence(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_event
    }
}
