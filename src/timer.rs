//! Session countdown timer
//!
//! Counts down a fixed session length while the session is running and
//! holds still while it is stopped. The `_at` variants take the current
//! instant explicitly so the arithmetic can be tested without sleeping.

use std::time::{Duration, Instant};

/// Session lengths offered to the listener, in minutes
pub const PRESET_MINUTES: [u64; 6] = [5, 10, 15, 30, 45, 60];

/// Default session length in minutes
pub const DEFAULT_MINUTES: u64 = 15;

#[derive(Debug, Clone)]
pub struct SessionTimer {
    duration: Duration,
    /// Running time banked by earlier pauses
    banked: Duration,
    /// Set while running
    running_since: Option<Instant>,
}

impl Default for SessionTimer {
    fn default() -> Self {
        Self::from_minutes(DEFAULT_MINUTES)
    }
}

impl SessionTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            banked: Duration::ZERO,
            running_since: None,
        }
    }

    pub fn from_minutes(minutes: u64) -> Self {
        Self::new(Duration::from_secs(minutes * 60))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn resume(&mut self) {
        self.resume_at(Instant::now());
    }

    pub fn resume_at(&mut self, now: Instant) {
        if self.running_since.is_none() && !self.is_finished_at(now) {
            self.running_since = Some(now);
        }
    }

    pub fn pause(&mut self) {
        self.pause_at(Instant::now());
    }

    pub fn pause_at(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.banked += now.saturating_duration_since(since);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    /// Running time so far, never more than the session length
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        let running = self
            .running_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        (self.banked + running).min(self.duration)
    }

    pub fn remaining(&self) -> Duration {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.duration.saturating_sub(self.elapsed_at(now))
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished_at(Instant::now())
    }

    pub fn is_finished_at(&self, now: Instant) -> bool {
        self.elapsed_at(now) >= self.duration
    }

    /// Stop and rewind, optionally to a new length
    pub fn reset(&mut self, duration: Option<Duration>) {
        if let Some(d) = duration {
            self.duration = d;
        }
        self.banked = Duration::ZERO;
        self.running_since = None;
    }
}

/// `mm:ss` display, as the countdown shows it
pub fn format_clock(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}
