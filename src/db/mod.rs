pub mod connection;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use models::{
    BlinkEvent, DatabaseStats, MetricSample, NewBlinkEvent, NewMetricSample, Session,
    StrainLevel, SyncLogEntry, UnsyncedRecords, UsageStats,
};
