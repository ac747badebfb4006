//! Planner prompt assembly: stacked sections in the order identity,
//! time, schedule, mood, memories, history, unread, recent actions,
//! action options.

use chrono::{DateTime, Utc};

use murmur_chat::Message;

use crate::action::ActionInfo;
use crate::plan::ChatMode;

/// Synthetic short ids assigned to the unread block, mapping back to
/// the real messages for target resolution.
pub type MessageIdMap = Vec<(String, Message)>;

pub struct PromptInputs<'a> {
    pub bot_name: &'a str,
    pub alias_names: &'a [String],
    pub persona: &'a str,
    pub now: DateTime<Utc>,
    pub schedule: Option<&'a str>,
    pub mood: Option<&'a str>,
    pub memories: &'a [String],
    pub read_history: &'a [Message],
    pub unread: &'a [Message],
    pub recent_actions: &'a [String],
    pub available_actions: &'a [ActionInfo],
    pub is_group_chat: bool,
    pub peer_name: Option<&'a str>,
}

pub fn build_planner_prompt(mode: ChatMode, inputs: &PromptInputs<'_>) -> (String, MessageIdMap) {
    let mut prompt = String::new();
    let mut id_map: MessageIdMap = Vec::new();

    push_identity(&mut prompt, inputs);
    prompt.push_str(&format!(
        "当前时间：{}\n",
        inputs.now.format("%Y-%m-%d %H:%M:%S")
    ));
    if let Some(schedule) = inputs.schedule {
        prompt.push_str(&format!("你当前正在：{schedule}，但注意它与聊天无关。\n"));
    }
    if let Some(mood) = inputs.mood {
        prompt.push_str(&format!("你现在的心情是：{mood}\n"));
    }
    prompt.push('\n');

    if !inputs.memories.is_empty() {
        prompt.push_str("你记得以下相关的事情：\n");
        for memory in inputs.memories {
            prompt.push_str(&format!("- {memory}\n"));
        }
        prompt.push('\n');
    }

    if inputs.is_group_chat {
        prompt.push_str("你现在正在一个群聊中。\n");
    } else {
        let peer = inputs.peer_name.unwrap_or("对方");
        prompt.push_str(&format!("你正在和 {peer} 私聊。\n"));
    }
    prompt.push('\n');

    match mode {
        ChatMode::Proactive => {
            prompt.push_str("最近的聊天内容：\n");
            push_history_block(&mut prompt, inputs.read_history, 50);
        }
        ChatMode::Normal | ChatMode::Focus => {
            prompt.push_str("已读的历史消息：\n");
            if inputs.read_history.is_empty() {
                prompt.push_str("暂无已读历史消息\n");
            } else {
                push_history_block(&mut prompt, inputs.read_history, 50);
            }
            prompt.push('\n');

            prompt.push_str("未读的新消息：\n");
            if inputs.unread.is_empty() {
                prompt.push_str("暂无未读消息\n");
            } else {
                for (index, message) in inputs.unread.iter().enumerate() {
                    let synthetic = format!("m{}", index + 1);
                    prompt.push_str(&format!(
                        "<{synthetic}> {} {}: {}\n",
                        format_clock(message.timestamp),
                        message.user_display_name,
                        message.text
                    ));
                    id_map.push((synthetic, message.clone()));
                }
            }
        }
    }
    prompt.push('\n');

    if !inputs.recent_actions.is_empty() {
        prompt.push_str("你刚刚选择并执行过的action是：\n");
        for action in inputs.recent_actions {
            prompt.push_str(&format!("- {action}\n"));
        }
        prompt.push('\n');
    }

    push_action_options(&mut prompt, mode, inputs.available_actions);

    prompt.push_str(
        "\n请不要输出违法违规内容，不要输出色情、暴力、政治相关内容。\n\
         请以JSON输出你的决定：{\"thinking\": \"你的思考\", \"actions\": {\"action_type\": \"...\", \
         \"target_message_id\": \"触发action的消息id\", \"reason\": \"原因\"}}\n",
    );

    (prompt, id_map)
}

fn push_identity(prompt: &mut String, inputs: &PromptInputs<'_>) {
    let alias_part = if inputs.alias_names.is_empty() {
        String::new()
    } else {
        format!("，也有人叫你{}", inputs.alias_names.join("、"))
    };
    prompt.push_str(&format!(
        "你的名字是{}{alias_part}，你是{}。\n",
        inputs.bot_name, inputs.persona
    ));
}

fn push_history_block(prompt: &mut String, history: &[Message], limit: usize) {
    let start = history.len().saturating_sub(limit);
    for message in &history[start..] {
        prompt.push_str(&format!(
            "{} {}: {}\n",
            format_clock(message.timestamp),
            message.user_display_name,
            message.text
        ));
    }
}

fn push_action_options(prompt: &mut String, mode: ChatMode, actions: &[ActionInfo]) {
    prompt.push_str("可选的动作：\n");

    match mode {
        ChatMode::Focus => prompt.push_str(
            "动作：no_action\n动作描述：不选择任何动作\n\
             动作：no_reply\n动作描述：不进行回复，等待合适的回复时机\n\n",
        ),
        _ => prompt.push_str(
            "说明：'reply' 表示只进行普通聊天回复；其他action表示在回复之外执行相应的额外动作。\n\n",
        ),
    }

    for action in actions {
        prompt.push_str(&format!("动作：{}\n", action.name));
        prompt.push_str(&format!("动作描述：{}\n", action.description));
        for requirement in &action.requirements {
            prompt.push_str(&format!("- {requirement}\n"));
        }

        prompt.push_str("{\n");
        prompt.push_str(&format!("    \"action_type\": \"{}\",\n", action.name));
        for (name, description) in &action.parameters {
            prompt.push_str(&format!("    \"{name}\": \"<{description}>\",\n"));
        }
        prompt.push_str("    \"reason\": \"<执行该动作的原因>\"\n}\n\n");
    }
}

fn format_clock(timestamp: f64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp as i64, 0)
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "??:??:??".to_string())
}

#[cfg(test)]
mod tests {
    use murmur_chat::InboundEnvelope;

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
            timestamp: 1_700_000_000.0,
            text: text.to_string(),
            is_mention: false,
            reply_to: None,
            additional_meta: None,
        })
    }

    fn inputs<'a>(
        unread: &'a [Message],
        actions: &'a [ActionInfo],
        aliases: &'a [String],
    ) -> PromptInputs<'a> {
        PromptInputs {
            bot_name: "Murmur",
            alias_names: aliases,
            persona: "一个好奇的聊天伙伴",
            now: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            schedule: None,
            mood: Some("平静"),
            memories: &[],
            read_history: &[],
            unread,
            recent_actions: &[],
            available_actions: actions,
            is_group_chat: true,
            peer_name: None,
        }
    }

    #[test]
    fn unread_messages_get_sequential_synthetic_ids() {
        let unread = vec![message("real-1", "你好"), message("real-2", "在吗")];
        let actions = vec![ActionInfo::new("reply", "回复消息")];
        let (prompt, id_map) = build_planner_prompt(ChatMode::Normal, &inputs(&unread, &actions, &[]));

        assert!(prompt.contains("<m1>"));
        assert!(prompt.contains("<m2>"));
        assert_eq!(id_map.len(), 2);
        assert_eq!(id_map[0].0, "m1");
        assert_eq!(id_map[0].1.message_id, "real-1");
        assert_eq!(id_map[1].1.message_id, "real-2");
    }

    #[test]
    fn action_schema_blocks_include_parameters() {
        let mut action = ActionInfo::new("poke_user", "戳一戳用户");
        action
            .parameters
            .insert("user_id".to_string(), "要戳的用户".to_string());
        action.requirements.push("当有人戳你时使用".to_string());

        let unread = vec![message("m", "hi")];
        let actions = vec![action];
        let (prompt, _) = build_planner_prompt(ChatMode::Normal, &inputs(&unread, &actions, &[]));

        assert!(prompt.contains("动作：poke_user"));
        assert!(prompt.contains("\"user_id\": \"<要戳的用户>\""));
        assert!(prompt.contains("当有人戳你时使用"));
    }

    #[test]
    fn proactive_mode_omits_the_unread_block() {
        let unread = vec![message("m", "hi")];
        let actions = vec![ActionInfo::new("proactive_reply", "主动发言")];
        let (prompt, id_map) =
            build_planner_prompt(ChatMode::Proactive, &inputs(&unread, &actions, &[]));

        assert!(!prompt.contains("未读的新消息"));
        assert!(id_map.is_empty());
    }

    #[test]
    fn aliases_are_listed_in_the_identity_line() {
        let aliases = vec!["小莫".to_string()];
        let unread = Vec::new();
        let actions = Vec::new();
        let (prompt, _) = build_planner_prompt(ChatMode::Normal, &inputs(&unread, &actions, &aliases));
        assert!(prompt.contains("也有人叫你小莫"));
    }
}
