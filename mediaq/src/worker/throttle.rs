//! Trailing-edge progress throttle.
//!
//! The first sample after a quiet period opens a window of `interval`; every
//! sample inside the window replaces the pending one, and only the latest is
//! emitted when the window closes. A burst therefore yields one event that
//! carries the newest value.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct ProgressThrottle<T> {
    interval: Duration,
    pending: Option<T>,
    window_started: Option<Instant>,
}

impl<T> ProgressThrottle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            window_started: None,
        }
    }

    /// Record a sample, replacing any sample still pending.
    pub fn push(&mut self, sample: T, now: Instant) {
        self.pending = Some(sample);
        if self.window_started.is_none() {
            self.window_started = Some(now);
        }
    }

    /// When the pending sample is due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match (&self.pending, self.window_started) {
            (Some(_), Some(started)) => Some(started + self.interval),
            _ => None,
        }
    }

    /// Take the pending sample if its window has closed at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Take the pending sample regardless of the window.
    pub fn flush(&mut self) -> Option<T> {
        self.window_started = None;
        self.pending.take()
    }
}
