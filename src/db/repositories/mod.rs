mod blink_events;
mod metric_samples;
mod sessions;
mod stats;
mod sync;
