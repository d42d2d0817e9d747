use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per sync attempt that reached the delivery step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncLogEntry {
    pub id: i64,
    pub sync_time: DateTime<Utc>,
    pub records_synced: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

use super::{BlinkEvent, MetricSample, Session};

/// Rows with `synced = 0` captured in one read, in id order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UnsyncedRecords {
    pub sessions: Vec<Session>,
    pub metric_samples: Vec<MetricSample>,
    pub blink_events: Vec<BlinkEvent>,
}

impl UnsyncedRecords {
    pub fn len(&self) -> usize {
        self.sessions.len() + self.metric_samples.len() + self.blink_events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
