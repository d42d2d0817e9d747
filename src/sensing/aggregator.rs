//! In-memory session counters owned by the blink loop.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::db::models::{blinks_per_minute, StrainLevel};

/// Span of the sliding window used for the recent blink rate.
pub const RECENT_WINDOW_SECS: i64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct SessionAggregator {
    total_blinks: u64,
    session_start: DateTime<Utc>,
    last_blink_time: Option<DateTime<Utc>>,
    recent_blink_timestamps: VecDeque<DateTime<Utc>>,
}

impl SessionAggregator {
    pub fn new(session_start: DateTime<Utc>) -> Self {
        Self {
            total_blinks: 0,
            session_start,
            last_blink_time: None,
            recent_blink_timestamps: VecDeque::new(),
        }
    }

    /// Records one blink at `at` and prunes the window to `(at - 5min, at]`.
    /// Returns the new total.
    pub fn record_blink(&mut self, at: DateTime<Utc>) -> u64 {
        self.total_blinks += 1;
        self.last_blink_time = Some(at);
        self.recent_blink_timestamps.push_back(at);

        let cutoff = at - Duration::seconds(RECENT_WINDOW_SECS);
        self.recent_blink_timestamps.retain(|ts| *ts > cutoff);
        self.total_blinks
    }

    pub fn total_blinks(&self) -> u64 {
        self.total_blinks
    }

    pub fn last_blink_time(&self) -> Option<DateTime<Utc>> {
        self.last_blink_time
    }

    pub fn recent_blink_timestamps(&self) -> impl Iterator<Item = &DateTime<Utc>> {
        self.recent_blink_timestamps.iter()
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.session_start).max(Duration::zero())
    }

    pub fn blinks_per_minute(&self, now: DateTime<Utc>) -> f64 {
        blinks_per_minute(self.total_blinks, self.session_start, now)
    }

    pub fn strain_level(&self, now: DateTime<Utc>) -> StrainLevel {
        StrainLevel::from_bpm(self.blinks_per_minute(now))
    }

    /// Blinks in the window ending at `now`.
    pub fn recent_blinks(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(RECENT_WINDOW_SECS);
        self.recent_blink_timestamps
            .iter()
            .filter(|ts| **ts > cutoff)
            .count()
    }

    /// Rate over the window, or over the session if it is younger than the
    /// window. Floored at one minute like the session rate.
    pub fn recent_blinks_per_minute(&self, now: DateTime<Utc>) -> f64 {
        let window_secs = self.elapsed(now).num_seconds().min(RECENT_WINDOW_SECS);
        let minutes = (window_secs as f64 / 60.0).max(1.0);
        self.recent_blinks(now) as f64 / minutes
    }
}

/// `HH:MM:SS`; hours are not wrapped.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    #[test]
    fn window_holds_only_the_last_five_minutes() {
        let start = Utc::now();
        let mut agg = SessionAggregator::new(start);
        let offsets = [0, 30, 100, 250, 301, 400, 550, 600];
        for offset in offsets {
            agg.record_blink(start + secs(offset));
        }

        assert_eq!(agg.total_blinks(), offsets.len() as u64);
        let now = start + secs(600);
        let expected: Vec<_> = offsets
            .iter()
            .map(|o| start + secs(*o))
            .filter(|ts| *ts > now - secs(RECENT_WINDOW_SECS))
            .collect();
        let window: Vec<_> = agg.recent_blink_timestamps().copied().collect();
        assert_eq!(window, expected);
        assert_eq!(agg.last_blink_time(), Some(now));
    }

    #[test]
    fn blink_exactly_five_minutes_old_is_pruned() {
        let start = Utc::now();
        let mut agg = SessionAggregator::new(start);
        agg.record_blink(start);
        agg.record_blink(start + secs(RECENT_WINDOW_SECS));
        assert_eq!(agg.recent_blink_timestamps().count(), 1);
    }

    #[test]
    fn rate_never_divides_by_zero() {
        let start = Utc::now();
        let mut agg = SessionAggregator::new(start);
        assert_eq!(agg.blinks_per_minute(start), 0.0);
        agg.record_blink(start);
        agg.record_blink(start);
        assert_eq!(agg.blinks_per_minute(start), 2.0);
        assert_eq!(agg.blinks_per_minute(start - secs(10)), 2.0);
    }

    #[test]
    fn rate_grows_with_blinks_for_fixed_elapsed_time() {
        let start = Utc::now();
        let now = start + secs(150);
        let mut agg = SessionAggregator::new(start);
        let mut previous = agg.blinks_per_minute(now);
        for i in 0..50 {
            agg.record_blink(start + secs(i));
            let rate = agg.blinks_per_minute(now);
            assert!(rate >= previous);
            previous = rate;
        }
    }

    #[test]
    fn twelve_blinks_in_a_minute_is_moderate() {
        let start = Utc::now();
        let mut agg = SessionAggregator::new(start);
        for i in 0..12 {
            agg.record_blink(start + secs(5 * i));
        }
        let end = start + secs(60);
        assert_eq!(agg.blinks_per_minute(end), 12.0);
        assert_eq!(agg.strain_level(end), StrainLevel::Moderate);
    }

    #[test]
    fn recent_rate_uses_window_span() {
        let start = Utc::now();
        let mut agg = SessionAggregator::new(start);
        for i in 0..20 {
            agg.record_blink(start + secs(600 + 15 * i));
        }
        let now = start + secs(900);
        // Blinks at 600..=885s all fall inside (600, 900]; the one at 600 does not.
        assert_eq!(agg.recent_blinks(now), 19);
        assert!((agg.recent_blinks_per_minute(now) - 19.0 / 5.0).abs() < 1e-9);
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(secs(0)), "00:00:00");
        assert_eq!(format_elapsed(secs(65)), "00:01:05");
        assert_eq!(format_elapsed(secs(3 * 3600 + 7)), "03:00:07");
        assert_eq!(format_elapsed(secs(-5)), "00:00:00");
    }
}
