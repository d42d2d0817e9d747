use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Host metrics as handed to the store; immutable once inserted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMetricSample {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: f64,
    pub disk_usage_percent: f64,
    pub network_available: bool,
    pub battery_percent: Option<f64>,
    pub power_connected: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub id: i64,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: f64,
    pub disk_usage_percent: f64,
    pub network_available: bool,
    pub battery_percent: Option<f64>,
    pub power_connected: Option<bool>,
    pub synced: bool,
}
