//! Trailing-edge rate limiting
//!
//! The first call of a burst arms a deadline `window` later. Later calls in
//! the same burst only replace the pending value. When the deadline passes the
//! latest value is released exactly once, and the next call starts a new
//! burst. The limiter owns no timer: the caller sleeps until `deadline()` and
//! then calls `poll()`.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter<T> {
    window: Duration,
    deadline: Option<Instant>,
    pending: Option<T>,
    last_fire: Option<Instant>,
}

impl<T> RateLimiter<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            pending: None,
            last_fire: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Queue `value`, returning `true` when this call opened a new burst
    pub fn call(&mut self, value: T, now: Instant) -> bool {
        self.pending = Some(value);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
            true
        } else {
            false
        }
    }

    /// When the pending value is due, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Release the pending value if its deadline has passed
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.last_fire = Some(now);
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Release the pending value immediately (used on shutdown)
    pub fn flush(&mut self) -> Option<T> {
        self.deadline = None;
        let value = self.pending.take();
        if value.is_some() {
            self.last_fire = Some(Instant::now());
        }
        value
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn last_fire(&self) -> Option<Instant> {
        self.last_fire
    }
}
