pub mod blink_event;
pub mod metric_sample;
pub mod session;
pub mod stats;
pub mod sync_log;

pub use blink_event::{BlinkEvent, NewBlinkEvent};
pub use metric_sample::{MetricSample, NewMetricSample};
pub use session::{blinks_per_minute, Session, StrainLevel};
pub use stats::{DatabaseStats, UsageStats};
pub use sync_log::{SyncLogEntry, UnsyncedRecords};
