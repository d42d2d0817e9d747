pub mod aggregator;
pub mod blink;
mod controller;
pub mod detector;

pub use aggregator::SessionAggregator;
pub use controller::{BlinkSampler, BlinkSnapshot, BlinkView, SourceMode};
pub use detector::{CaptureDevice, EyeStateDetector, NoCaptureDevice};
