use serde::{Deserialize, Serialize};

use murmur_chat::Message;

use crate::action::{ActionInfo, ActionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    Normal,
    Focus,
    Proactive,
}

/// Plan lifecycle: `Generated → Filtered → Decided → Executing →
/// Executed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Generated,
    Filtered,
    Decided,
    Executing,
    Executed,
    Failed,
}

/// One concrete decision out of the planner.
#[derive(Debug, Clone)]
pub struct DecidedAction {
    pub action_type: ActionType,
    pub reasoning: String,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub target_message: Option<Message>,
}

impl DecidedAction {
    pub fn no_action(reasoning: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::NoAction,
            reasoning: reasoning.into(),
            data: serde_json::Map::new(),
            target_message: None,
        }
    }
}

#[derive(Debug)]
pub struct Plan {
    pub stream_id: String,
    pub mode: ChatMode,
    pub available_actions: Vec<ActionInfo>,
    pub decided_actions: Vec<DecidedAction>,
    pub state: PlanState,
    /// The exact prompt sent to the model, kept for diagnostics.
    pub llm_prompt: Option<String>,
}

impl Plan {
    pub fn new(stream_id: impl Into<String>, mode: ChatMode, actions: Vec<ActionInfo>) -> Self {
        Self {
            stream_id: stream_id.into(),
            mode,
            available_actions: actions,
            decided_actions: Vec::new(),
            state: PlanState::Generated,
            llm_prompt: None,
        }
    }

    pub fn has_reply_decision(&self) -> bool {
        self.decided_actions
            .iter()
            .any(|action| action.action_type.is_reply_kind())
    }
}
