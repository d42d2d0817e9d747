//! Monitoring session rows and the strain classification derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Eye-strain classification, derived only from blinks per minute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrainLevel {
    High,
    Moderate,
    Normal,
}

impl StrainLevel {
    pub fn from_bpm(blinks_per_minute: f64) -> Self {
        if blinks_per_minute < 10.0 {
            StrainLevel::High
        } else if blinks_per_minute < 15.0 {
            StrainLevel::Moderate
        } else {
            StrainLevel::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrainLevel::High => "high",
            StrainLevel::Moderate => "moderate",
            StrainLevel::Normal => "normal",
        }
    }
}

/// Blinks per minute over `[start, end]` with the elapsed time floored at one
/// minute.
pub fn blinks_per_minute(total_blinks: u64, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let elapsed_minutes = (end - start).num_milliseconds().max(0) as f64 / 60_000.0;
    total_blinks as f64 / elapsed_minutes.max(1.0)
}

impl Default for StrainLevel {
    fn default() -> Self {
        StrainLevel::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: i64,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_blinks: u64,
    pub blinks_per_minute: f64,
    pub strain_level: StrainLevel,
    pub synced: bool,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}
