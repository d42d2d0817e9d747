mod endpoint;
mod engine;

#[cfg(feature = "http-sync")]
pub use endpoint::HttpEndpoint;
pub use endpoint::{endpoint_from_settings, SimulatedEndpoint, SyncBatch, SyncEndpoint};
pub use engine::{SyncEngine, SyncState, SyncStatus};
