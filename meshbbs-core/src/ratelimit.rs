//! Per-operation-class minimum spacing.
//!
//! Cooperative discipline: the caller awaits the remaining interval
//! before issuing the frame. This module only computes the wait; the
//! actual sleep is left to the caller's async runtime so this crate stays
//! runtime-agnostic.

use std::collections::HashMap;
use std::time::Duration;

/// A single output class's last-send timestamp, guarded by cooperative
/// discipline (single-threaded access from the scheduler task).
#[derive(Default)]
pub struct RateLimiter {
    min_interval: HashMap<String, Duration>,
    last_sent_us: HashMap<String, u64>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the minimum interval for an output class.
    pub fn configure(&mut self, class: impl Into<String>, min_interval: Duration) {
        self.min_interval.insert(class.into(), min_interval);
    }

    /// How long the caller should wait before sending on `class`, given
    /// the current time `now_us`. Zero if the class is unconfigured or
    /// already past its minimum interval.
    pub fn wait_for(&self, class: &str, now_us: u64) -> Duration {
        let Some(min) = self.min_interval.get(class) else {
            return Duration::ZERO;
        };
        let min_us = min.as_micros() as u64;
        match self.last_sent_us.get(class) {
            Some(&last) => {
                let elapsed = now_us.saturating_sub(last);
                if elapsed >= min_us {
                    Duration::ZERO
                } else {
                    Duration::from_micros(min_us - elapsed)
                }
            }
            None => Duration::ZERO,
        }
    }

    /// Record that a frame was just sent on `class` at `now_us`. Callers
    /// invoke this immediately before transmitting, after any wait from
    /// [`Self::wait_for`] has elapsed.
    pub fn record_sent(&mut self, class: &str, now_us: u64) {
        self.last_sent_us.insert(class.to_string(), now_us);
    }
}

/// Output classes named directly by the spec's tuning table.
pub mod classes {
    pub const UNICAST: &str = "unicast";
    pub const MAIL_CHUNK: &str = "mail_chunk";
    pub const BOARD_CHUNK: &str = "board_chunk";
    pub const SYNC_REQUEST: &str = "sync_request";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_wait_before_first_send() {
        let mut limiter = RateLimiter::new();
        limiter.configure(classes::UNICAST, Duration::from_millis(3500));
        assert_eq!(limiter.wait_for(classes::UNICAST, 0), Duration::ZERO);
    }

    #[test]
    fn waits_remaining_interval() {
        let mut limiter = RateLimiter::new();
        limiter.configure(classes::UNICAST, Duration::from_millis(3500));
        limiter.record_sent(classes::UNICAST, 1_000_000);
        let wait = limiter.wait_for(classes::UNICAST, 2_000_000);
        assert_eq!(wait, Duration::from_millis(2500));
    }

    #[test]
    fn unconfigured_class_never_waits() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.wait_for("unknown", 999), Duration::ZERO);
    }
}
