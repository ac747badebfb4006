pub mod action;
pub mod executor;
pub mod filter;
pub mod plan;
pub mod planner;
pub mod prompt;

pub use action::{ActionContext, ActionInfo, ActionOutcome, ActionRegistry, ActionType};
pub use executor::{ActionResult, ExecutionReport, PlanExecutor};
pub use filter::{FilterInputs, PlanFilter};
pub use plan::{ChatMode, DecidedAction, Plan, PlanState};
pub use planner::{PlanRequest, Planner, parse_decisions};
pub use prompt::{MessageIdMap, PromptInputs, build_planner_prompt};
