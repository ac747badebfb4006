use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use murmur_chat::Message;

/// The action taxonomy. Anything outside the built-in kinds is a
/// plugin action resolved through the registry by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionType {
    Reply,
    ProactiveReply,
    NoReply,
    NoAction,
    Other(String),
}

impl ActionType {
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "reply" => ActionType::Reply,
            "proactive_reply" => ActionType::ProactiveReply,
            "no_reply" | "do_nothing" => ActionType::NoReply,
            "no_action" | "" => ActionType::NoAction,
            other => ActionType::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ActionType::Reply => "reply",
            ActionType::ProactiveReply => "proactive_reply",
            ActionType::NoReply => "no_reply",
            ActionType::NoAction => "no_action",
            ActionType::Other(name) => name,
        }
    }

    /// Reply-kind actions are subject to the one-reply-per-plan quota.
    pub fn is_reply_kind(&self) -> bool {
        matches!(self, ActionType::Reply | ActionType::ProactiveReply)
    }

    /// No-ops never reach the executor's registry.
    pub fn is_noop(&self) -> bool {
        matches!(self, ActionType::NoReply | ActionType::NoAction)
    }

    /// Actions that require a resolvable target message.
    pub fn needs_target(&self) -> bool {
        !self.is_noop() && *self != ActionType::ProactiveReply
    }
}

impl From<String> for ActionType {
    fn from(value: String) -> Self {
        ActionType::parse(&value)
    }
}

impl From<ActionType> for String {
    fn from(value: ActionType) -> Self {
        value.name().to_string()
    }
}

/// Descriptor of one action as shown to the planner LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInfo {
    pub name: String,
    pub description: String,
    /// Parameter name → human description, rendered into the JSON
    /// usage example.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Requirement hints ("use when …").
    #[serde(default)]
    pub requirements: Vec<String>,
}

impl ActionInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: BTreeMap::new(),
            requirements: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionContext {
    pub stream_id: String,
    pub now: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    pub success: bool,
    pub detail: Option<String>,
}

/// Plugin action surface (injected collaborator).
#[async_trait]
pub trait ActionRegistry: Send + Sync {
    fn available_actions(&self) -> Vec<ActionInfo>;

    async fn invoke(
        &self,
        name: &str,
        data: serde_json::Map<String, serde_json::Value>,
        target: Option<&Message>,
        context: &ActionContext,
    ) -> Result<ActionOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_maps_known_names_and_preserves_plugins() {
        assert_eq!(ActionType::parse("reply"), ActionType::Reply);
        assert_eq!(ActionType::parse("do_nothing"), ActionType::NoReply);
        assert_eq!(
            ActionType::parse("poke_user"),
            ActionType::Other("poke_user".to_string())
        );
    }

    #[test]
    fn reply_kinds_and_noops_are_disjoint() {
        assert!(ActionType::Reply.is_reply_kind());
        assert!(ActionType::ProactiveReply.is_reply_kind());
        assert!(!ActionType::Reply.is_noop());
        assert!(ActionType::NoAction.is_noop());
        assert!(!ActionType::NoAction.is_reply_kind());
    }

    #[test]
    fn serde_round_trips_through_names() {
        let encoded = serde_json::to_string(&ActionType::Other("poke_user".into())).unwrap();
        assert_eq!(encoded, "\"poke_user\"");
        let decoded: ActionType = serde_json::from_str("\"reply\"").unwrap();
        assert_eq!(decoded, ActionType::Reply);
    }
}
