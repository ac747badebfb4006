pub mod clock;
pub mod context;
pub mod energy;
pub mod interest;
pub mod message;
pub mod sleep;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ContextStore, ContextStoreStats, StreamContext};
pub use energy::{EnergyCalculator, EnergyInputs};
pub use interest::{InterestScore, InterestScorer};
pub use message::{ChatType, InboundEnvelope, Message};
pub use sleep::SleepManager;
