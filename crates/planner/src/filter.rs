//! Reconciles the model's raw decisions against the actions that are
//! actually available, the interest gate, and the unread messages the
//! synthetic ids point at.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::action::ActionType;
use crate::plan::{DecidedAction, Plan, PlanState};
use crate::prompt::MessageIdMap;

pub struct FilterInputs {
    /// Average interest over the batch.
    pub avg_interest: f64,
    /// Best single-message interest in the batch.
    pub top_interest: f64,
    /// Whether the interest gate allows a `reply` decision.
    pub reply_allowed: bool,
    /// Below this neither replies nor auxiliary actions run.
    pub non_reply_action_threshold: f64,
    /// Interest gating applies only to message-triggered plans, not to
    /// proactive ones.
    pub interest_gating: bool,
}

pub struct PlanFilter;

impl PlanFilter {
    pub fn filter(plan: &mut Plan, id_map: &MessageIdMap, inputs: &FilterInputs) {
        plan.state = PlanState::Filtered;

        // Interest too low for any action: collapse the whole plan.
        if inputs.interest_gating
            && inputs.avg_interest.max(inputs.top_interest) < inputs.non_reply_action_threshold
        {
            info!(
                avg = inputs.avg_interest,
                top = inputs.top_interest,
                threshold = inputs.non_reply_action_threshold,
                "interest below action threshold, collapsing to no_action"
            );
            plan.decided_actions = vec![DecidedAction::no_action(format!(
                "兴趣度 {:.3} 未达到动作阈值 {:.3}",
                inputs.avg_interest.max(inputs.top_interest),
                inputs.non_reply_action_threshold
            ))];
            plan.state = PlanState::Decided;
            return;
        }

        let available: Vec<&str> = plan
            .available_actions
            .iter()
            .map(|a| a.name.as_str())
            .collect();

        let mut filtered = Vec::with_capacity(plan.decided_actions.len());
        for mut decision in std::mem::take(&mut plan.decided_actions) {
            // Reply suppressed by the interest gate.
            if decision.action_type == ActionType::Reply && !inputs.reply_allowed {
                decision.action_type = ActionType::NoReply;
                decision
                    .reasoning
                    .push_str(" (兴趣度不足，reply不可用，已改为no_reply)");
            }

            // Unknown plugin action.
            if let ActionType::Other(name) = &decision.action_type {
                if !available.contains(&name.as_str()) {
                    warn!(action = %name, "model chose an unavailable action");
                    decision.reasoning = format!(
                        "模型选择了当前不可用的动作 '{name}'。原始理由: {}",
                        decision.reasoning
                    );
                    decision.action_type = ActionType::NoAction;
                    decision.target_message = None;
                }
            }

            if decision.action_type.needs_target() {
                resolve_target(&mut decision, id_map);
            }
            filtered.push(decision);
        }

        plan.decided_actions = prefer_real_actions(filtered);
        plan.state = PlanState::Decided;
    }
}

/// Attach the real message behind the synthetic target id. A `reply`
/// without a resolvable target downgrades to `no_action`; other
/// actions fall back to the most fitting recent message.
fn resolve_target(decision: &mut DecidedAction, id_map: &MessageIdMap) {
    let requested = decision
        .data
        .get("target_message_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let resolved = match &requested {
        Some(id) => lookup(id, id_map),
        None => None,
    };

    let resolved = resolved.or_else(|| {
        if decision.action_type == ActionType::Other("poke_user".to_string()) {
            // Prefer the poke notice that triggered the action.
            id_map
                .iter()
                .rev()
                .find(|(_, message)| message.text.contains("戳"))
                .or_else(|| id_map.last())
                .map(|(_, message)| message.clone())
        } else if requested.is_none() {
            id_map.last().map(|(_, message)| message.clone())
        } else {
            None
        }
    });

    match resolved {
        Some(message) => {
            decision.data.insert(
                "target_message_id".to_string(),
                Value::String(message.message_id.clone()),
            );
            decision.target_message = Some(message);
        }
        None => {
            if decision.action_type == ActionType::Reply {
                debug!(?requested, "reply target unresolvable, downgrading");
                decision.reasoning = format!(
                    "找不到目标消息进行回复。原始理由: {}",
                    decision.reasoning
                );
                decision.action_type = ActionType::NoAction;
            }
        }
    }
}

/// Accept `m3`, bare `3`, or a real message id.
fn lookup(requested: &str, id_map: &MessageIdMap) -> Option<murmur_chat::Message> {
    let mut candidates = vec![requested.to_string()];
    if let Some(stripped) = requested.strip_prefix('m') {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            candidates.push(stripped.to_string());
        }
    }
    if requested.chars().all(|c| c.is_ascii_digit()) {
        candidates.push(format!("m{requested}"));
    }

    id_map
        .iter()
        .find(|(synthetic, message)| {
            candidates.contains(synthetic) || candidates.contains(&message.message_id)
        })
        .map(|(_, message)| message.clone())
}

/// Keep real actions when any exist; otherwise a single no-op.
fn prefer_real_actions(decisions: Vec<DecidedAction>) -> Vec<DecidedAction> {
    let has_real = decisions.iter().any(|d| !d.action_type.is_noop());
    if has_real {
        decisions
            .into_iter()
            .filter(|d| !d.action_type.is_noop())
            .collect()
    } else {
        decisions.into_iter().take(1).collect()
    }
}

#[cfg(test)]
mod tests {
    use murmur_chat::{InboundEnvelope, Message};

    use crate::action::ActionInfo;
    use crate::plan::{ChatMode, Plan};
    use crate::planner::parse_decisions;

    use super::*;

    fn message(id: &str, text: &str) -> Message {
        Message::from_envelope(InboundEnvelope {
            platform: "test".to_string(),
            stream_id: "s1".to_string(),
            user_id: "u1".to_string(),
            user_display_name: "小明".to_string(),
            message_id: Some(id.to_string()),
            group_id: Some("g1".to_string()),
            group_name: None,
            timestamp: 100.0,
            text: text.to_string(),
            is_mention: false,
            reply_to: None,
            additional_meta: None,
        })
    }

    fn id_map() -> MessageIdMap {
        vec![
            ("m1".to_string(), message("real-1", "你好")),
            ("m2".to_string(), message("real-2", "有人戳了戳你")),
        ]
    }

    fn open_inputs() -> FilterInputs {
        FilterInputs {
            avg_interest: 0.8,
            top_interest: 0.9,
            reply_allowed: true,
            non_reply_action_threshold: 0.2,
            interest_gating: true,
        }
    }

    fn plan_with(decisions_json: &str) -> Plan {
        let mut plan = Plan::new(
            "s1",
            ChatMode::Normal,
            vec![
                ActionInfo::new("reply", "回复"),
                ActionInfo::new("poke_user", "戳回去"),
            ],
        );
        plan.decided_actions = parse_decisions(decisions_json);
        plan
    }

    #[test]
    fn low_interest_collapses_to_single_no_action() {
        let mut plan = plan_with(
            r#"{"actions": {"action_type": "reply", "target_message_id": "m1", "reason": "x"}}"#,
        );
        let inputs = FilterInputs {
            avg_interest: 0.05,
            top_interest: 0.1,
            ..open_inputs()
        };
        PlanFilter::filter(&mut plan, &id_map(), &inputs);

        assert_eq!(plan.decided_actions.len(), 1);
        assert_eq!(plan.decided_actions[0].action_type, ActionType::NoAction);
        assert_eq!(plan.state, PlanState::Decided);
    }

    #[test]
    fn disallowed_reply_becomes_no_reply() {
        let mut plan = plan_with(
            r#"{"actions": {"action_type": "reply", "target_message_id": "m1", "reason": "想回复"}}"#,
        );
        let inputs = FilterInputs {
            reply_allowed: false,
            ..open_inputs()
        };
        PlanFilter::filter(&mut plan, &id_map(), &inputs);

        assert_eq!(plan.decided_actions[0].action_type, ActionType::NoReply);
        assert!(plan.decided_actions[0].reasoning.contains("no_reply"));
    }

    #[test]
    fn unknown_action_is_rewritten_with_reason_preserved() {
        let mut plan = plan_with(
            r#"{"actions": {"action_type": "order_pizza", "reason": "饿了"}}"#,
        );
        PlanFilter::filter(&mut plan, &id_map(), &open_inputs());

        assert_eq!(plan.decided_actions[0].action_type, ActionType::NoAction);
        assert!(plan.decided_actions[0].reasoning.contains("order_pizza"));
        assert!(plan.decided_actions[0].reasoning.contains("饿了"));
    }

    #[test]
    fn reply_target_resolves_through_synthetic_id() {
        let mut plan = plan_with(
            r#"{"actions": {"action_type": "reply", "target_message_id": "m1", "reason": "x"}}"#,
        );
        PlanFilter::filter(&mut plan, &id_map(), &open_inputs());

        let decision = &plan.decided_actions[0];
        assert_eq!(decision.action_type, ActionType::Reply);
        let target = decision.target_message.as_ref().unwrap();
        assert_eq!(target.message_id, "real-1");
        assert_eq!(decision.data["target_message_id"], "real-1");
    }

    #[test]
    fn bare_numeric_target_id_is_accepted() {
        let mut plan = plan_with(
            r#"{"actions": {"action_type": "reply", "target_message_id": "2", "reason": "x"}}"#,
        );
        PlanFilter::filter(&mut plan, &id_map(), &open_inputs());
        let target = plan.decided_actions[0].target_message.as_ref().unwrap();
        assert_eq!(target.message_id, "real-2");
    }

    #[test]
    fn reply_with_missing_target_downgrades() {
        let mut plan = plan_with(
            r#"{"actions": {"action_type": "reply", "target_message_id": "m9", "reason": "x"}}"#,
        );
        PlanFilter::filter(&mut plan, &id_map(), &open_inputs());
        assert_eq!(plan.decided_actions[0].action_type, ActionType::NoAction);
    }

    #[test]
    fn poke_user_prefers_the_poke_notice() {
        let mut plan = plan_with(r#"{"actions": {"action_type": "poke_user", "reason": "x"}}"#);
        PlanFilter::filter(&mut plan, &id_map(), &open_inputs());

        let target = plan.decided_actions[0].target_message.as_ref().unwrap();
        assert_eq!(target.message_id, "real-2");
    }

    #[test]
    fn real_actions_displace_noops() {
        let mut plan = plan_with(
            r#"[{"actions": {"action_type": "no_reply", "reason": "a"}},
                {"actions": {"action_type": "reply", "target_message_id": "m1", "reason": "b"}}]"#,
        );
        PlanFilter::filter(&mut plan, &id_map(), &open_inputs());

        assert_eq!(plan.decided_actions.len(), 1);
        assert_eq!(plan.decided_actions[0].action_type, ActionType::Reply);
    }
}
