pub mod battery;
mod collector;
pub mod probe;
mod types;

pub use collector::{HostReader, TelemetrySampler, TelemetryView};
pub use probe::{ReachabilityProbe, TcpProbe};
pub use types::{HostMetrics, PowerImpact};
