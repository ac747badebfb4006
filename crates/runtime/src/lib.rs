pub mod manager;
pub mod system;
pub mod worker;

pub use manager::{ManagerStats, MessageManager};
pub use system::{Collaborators, SystemContext, init_telemetry};
pub use worker::StreamWorker;
