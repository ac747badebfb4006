pub mod dispatcher;
pub mod state;
pub mod task;

pub use dispatcher::{
    Dispatcher, DispatcherStats, DistributionExecutor, ExecutionContext, QueueStatus,
};
pub use state::StreamDistributionState;
pub use task::{DispatchPriority, DispatchTask};
