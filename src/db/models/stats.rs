use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregates over a user's recent sessions and metric samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageStats {
    pub session_count: u64,
    pub avg_blinks: f64,
    pub avg_bpm: f64,
    pub high_strain_sessions: u64,
    pub avg_cpu: f64,
    pub avg_memory: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatabaseStats {
    pub total_sessions: u64,
    pub total_metrics: u64,
    pub total_blinks: u64,
    pub unsynced_count: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub database_size_bytes: u64,
}
