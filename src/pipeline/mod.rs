mod coordinator;
mod events;
mod flush;

pub use coordinator::PipelineCoordinator;
pub use events::PipelineEvent;
pub use flush::FlushStats;
