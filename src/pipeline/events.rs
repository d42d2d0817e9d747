use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    sensing::{BlinkSnapshot, SourceMode},
    sync::SyncStatus,
    telemetry::HostMetrics,
};

/// Notifications for the presentation layer. Delivery is best effort: a slow
/// subscriber skips events rather than stalling the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    MonitoringStarted {
        user_id: String,
        session_id: Option<i64>,
        source_mode: SourceMode,
    },
    MonitoringStopped {
        user_id: String,
        session_id: Option<i64>,
        summary: BlinkSnapshot,
    },
    BlinkDetected {
        timestamp: DateTime<Utc>,
        total_blinks: u64,
    },
    MetricsUpdated {
        metrics: HostMetrics,
    },
    Sync {
        status: SyncStatus,
    },
}
