//! Plan generation: prompt the model, parse its decision, apply the
//! reply quota. All parse and transport failures collapse to a single
//! `no_action` decision; the caller never sees an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use murmur_chat::Message;
use murmur_config::IdentityConfig;
use murmur_llm::{GenerateOptions, LlmProvider, RequestKind, json as llm_json};

use crate::action::{ActionInfo, ActionType};
use crate::plan::{ChatMode, DecidedAction, Plan};
use crate::prompt::{MessageIdMap, PromptInputs, build_planner_prompt};

pub struct PlanRequest {
    pub stream_id: String,
    pub mode: ChatMode,
    pub read_history: Vec<Message>,
    pub unread: Vec<Message>,
    /// Rendered memory lines pulled by the retriever.
    pub memories: Vec<String>,
    pub recent_actions: Vec<String>,
    pub available_actions: Vec<ActionInfo>,
    pub mood: Option<String>,
    pub schedule: Option<String>,
    pub is_group_chat: bool,
    pub peer_name: Option<String>,
}

pub struct Planner {
    llm: Arc<dyn LlmProvider>,
    identity: IdentityConfig,
    llm_timeout: Duration,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmProvider>, identity: IdentityConfig, llm_timeout: Duration) -> Self {
        Self {
            llm,
            identity,
            llm_timeout,
        }
    }

    /// Generate a plan for one dispatched batch. Returns the plan in
    /// `Generated` state plus the synthetic-id map for target
    /// resolution in the filter.
    pub async fn plan(&self, request: &PlanRequest, now: DateTime<Utc>) -> (Plan, MessageIdMap) {
        let mut plan = Plan::new(
            request.stream_id.clone(),
            request.mode,
            request.available_actions.clone(),
        );

        let inputs = PromptInputs {
            bot_name: &self.identity.bot_name,
            alias_names: &self.identity.alias_names,
            persona: &self.identity.persona,
            now,
            schedule: request.schedule.as_deref(),
            mood: request.mood.as_deref(),
            memories: &request.memories,
            read_history: &request.read_history,
            unread: &request.unread,
            recent_actions: &request.recent_actions,
            available_actions: &request.available_actions,
            is_group_chat: request.is_group_chat,
            peer_name: request.peer_name.as_deref(),
        };
        let (prompt, id_map) = build_planner_prompt(request.mode, &inputs);
        plan.llm_prompt = Some(prompt.clone());

        let options = GenerateOptions::for_request(RequestKind::Planner);
        let response =
            match tokio::time::timeout(self.llm_timeout, self.llm.generate(&prompt, &options)).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    warn!(stream = %request.stream_id, %err, "planner LLM failed");
                    plan.decided_actions =
                        vec![DecidedAction::no_action("planner model unavailable")];
                    return (plan, id_map);
                }
                Err(_) => {
                    warn!(stream = %request.stream_id, "planner LLM timed out");
                    plan.decided_actions = vec![DecidedAction::no_action("planner timed out")];
                    return (plan, id_map);
                }
            };

        plan.decided_actions = parse_decisions(&response);
        debug!(
            stream = %request.stream_id,
            decisions = plan.decided_actions.len(),
            "plan generated"
        );
        (plan, id_map)
    }
}

/// Parse the model response into decisions. Accepts a single
/// `{thinking, actions}` object or a list of them; `actions` may be an
/// object or a list. At most one reply-kind decision survives.
pub fn parse_decisions(response: &str) -> Vec<DecidedAction> {
    let Some(value) = llm_json::parse_lenient_value(response) else {
        return vec![DecidedAction::no_action("返回内容无法解析为JSON")];
    };

    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        _ => return vec![DecidedAction::no_action("返回内容不是决策对象")],
    };

    let mut decisions = Vec::new();
    let mut reply_taken = false;
    for item in items {
        let Value::Object(item) = item else { continue };

        if let Some(thinking) = item.get("thinking").and_then(Value::as_str) {
            if !thinking.is_empty() {
                info!(thinking, "planner thinking");
            }
        }

        // `actions` may be a dict, a list, or absent with the action
        // fields inlined on the item itself.
        let action_values: Vec<Value> = match item.get("actions") {
            Some(Value::Object(single)) => vec![Value::Object(single.clone())],
            Some(Value::Array(many)) => many.clone(),
            _ if item.contains_key("action_type") || item.contains_key("action") => {
                vec![Value::Object(item.clone())]
            }
            _ => vec![],
        };

        for action_value in action_values {
            let Value::Object(fields) = action_value else {
                continue;
            };
            let name = fields
                .get("action_type")
                .or_else(|| fields.get("action"))
                .and_then(Value::as_str)
                .unwrap_or("no_action");
            let action_type = ActionType::parse(name);

            // Reply-action quota: one reply-kind decision per plan.
            if action_type.is_reply_kind() {
                if reply_taken {
                    debug!("dropping extra reply decision (quota)");
                    continue;
                }
                reply_taken = true;
            }

            let reasoning = fields
                .get("reason")
                .or_else(|| fields.get("reasoning"))
                .and_then(Value::as_str)
                .unwrap_or("未提供原因")
                .to_string();
            let data: serde_json::Map<String, Value> = fields
                .iter()
                .filter(|(key, _)| {
                    !matches!(key.as_str(), "action_type" | "action" | "reason" | "reasoning")
                })
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            decisions.push(DecidedAction {
                action_type,
                reasoning,
                data,
                target_message: None,
            });
        }
    }

    if decisions.is_empty() {
        decisions.push(DecidedAction::no_action("模型未返回任何动作"));
    }
    decisions
}
