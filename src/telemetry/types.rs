use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::NewMetricSample;

/// Rough energy cost of the current CPU load.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerImpact {
    #[default]
    VeryLow,
    Low,
    Medium,
    High,
}

impl PowerImpact {
    pub fn from_cpu(cpu_percent: f64) -> Self {
        if cpu_percent > 80.0 {
            PowerImpact::High
        } else if cpu_percent > 50.0 {
            PowerImpact::Medium
        } else if cpu_percent > 20.0 {
            PowerImpact::Low
        } else {
            PowerImpact::VeryLow
        }
    }
}

/// One complete telemetry tick. Replaced whole; never updated field by field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HostMetrics {
    /// `None` until the first tick completes.
    pub sampled_at: Option<DateTime<Utc>>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub disk_usage_percent: f64,
    pub network_available: bool,
    /// `None` on hosts without a battery.
    pub battery_percent: Option<f64>,
    pub power_connected: Option<bool>,
    pub process_count: usize,
    pub power_impact: PowerImpact,
    pub boot_time: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

impl HostMetrics {
    pub fn to_sample(&self, user_id: &str) -> NewMetricSample {
        NewMetricSample {
            user_id: user_id.to_string(),
            timestamp: self.sampled_at.unwrap_or_else(Utc::now),
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            memory_used_mb: self.memory_used_mb,
            disk_usage_percent: self.disk_usage_percent,
            network_available: self.network_available,
            battery_percent: self.battery_percent,
            power_connected: self.power_connected,
        }
    }
}
