//! Blink recognition: the closed-run rule for live frames and the random
//! schedule used when no camera is present.

use std::time::{Duration, Instant};

use rand::Rng;

/// Counts consecutive closed-eye observations. An open observation that ends
/// a run of at least `threshold` closed ones is one blink.
#[derive(Debug, Clone)]
pub struct BlinkCounter {
    threshold: u32,
    closed_run: u32,
}

impl BlinkCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            closed_run: 0,
        }
    }

    /// Feeds one observation; returns `true` when it completes a blink.
    pub fn observe(&mut self, eyes_open: bool) -> bool {
        if !eyes_open {
            self.closed_run = self.closed_run.saturating_add(1);
            return false;
        }

        let blinked = self.closed_run >= self.threshold;
        self.closed_run = 0;
        blinked
    }
}

/// Fires once per randomly drawn interval in `[min, max]`, re-arming after
/// every emission.
#[derive(Debug, Clone)]
pub struct SimulatedSchedule {
    min: Duration,
    max: Duration,
    next_at: Instant,
}

impl SimulatedSchedule {
    pub fn new(min: Duration, max: Duration, now: Instant) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let mut schedule = Self { min, max, next_at: now };
        schedule.arm(now);
        schedule
    }

    pub fn next_at(&self) -> Instant {
        self.next_at
    }

    /// Returns `true` when the armed deadline has passed.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next_at {
            return false;
        }
        self.arm(now);
        true
    }

    fn arm(&mut self, now: Instant) {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        let wait = rand::thread_rng().gen_range(min..=max);
        self.next_at = now + Duration::from_millis(wait);
    }
}
