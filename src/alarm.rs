//! Deadline-based alarms.
//!
//! The core is single-threaded and event-driven; nothing blocks on a timer.
//! An [`Alarm`] is just an armed deadline checked by the dispatch context
//! through `poll_timers(now)`. Firing clears the deadline, so an alarm never
//! fires twice without being re-armed.

use embassy_time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alarm {
    deadline: Option<Instant>,
}

impl Alarm {
    pub const NEW: Alarm = Alarm { deadline: None };

    pub const fn new() -> Self {
        Alarm { deadline: None }
    }

    pub fn set(&mut self, now: Instant, after: Duration) {
        self.deadline = Some(now + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// True exactly once per arming, when `now` has reached the deadline.
    pub fn expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for Alarm {
    fn default() -> Self {
        Alarm::new()
    }
}
