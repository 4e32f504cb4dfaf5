//! Trailing-edge throttle: coalesce bursts of triggers into one emission per window.
//!
//! The first trigger in a quiet period arms a deadline `window` in the future;
//! triggers before that deadline are absorbed. The host polls with the current
//! time and emits when `poll` reports the deadline has passed, or calls
//! `flush` to emit a pending notification immediately (e.g. at shutdown).

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Throttle {
    window: Duration,
    deadline: Option<Instant>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Request an emission. Returns true if this armed a new deadline.
    pub fn trigger(&mut self, now: Instant) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.window);
        true
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True (and disarmed) once the deadline has passed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Disarm. Returns true if an emission was pending and should happen now.
    pub fn flush(&mut self) -> bool {
        self.deadline.take().is_some()
    }
}
