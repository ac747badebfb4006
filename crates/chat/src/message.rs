use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Private,
    Group,
}

/// Wire-level message envelope handed to ingestion (§ inbound surface).
/// `stream_id` is the partition key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub platform: String,
    pub stream_id: String,
    pub user_id: String,
    pub user_display_name: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    /// Epoch seconds.
    pub timestamp: f64,
    pub text: String,
    #[serde(default)]
    pub is_mention: bool,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub additional_meta: Option<serde_json::Value>,
}

/// A message inside a stream context. The identity fields are
/// immutable; the trailing fields are filled in during processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub stream_id: String,
    pub user_id: String,
    pub user_display_name: String,
    pub timestamp: f64,
    pub text: String,
    pub is_mention: bool,
    pub is_private_chat: bool,
    #[serde(default)]
    pub reply_to: Option<String>,

    // Processing-phase fields.
    #[serde(default)]
    pub interest_score: Option<f64>,
    #[serde(default)]
    pub should_reply: Option<bool>,
    #[serde(default)]
    pub actions_applied: Vec<String>,
}

impl Message {
    pub fn from_envelope(envelope: InboundEnvelope) -> Self {
        let is_private_chat = envelope.group_id.is_none() && envelope.group_name.is_none();
        Self {
            message_id: envelope
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            stream_id: envelope.stream_id,
            user_id: envelope.user_id,
            user_display_name: envelope.user_display_name,
            timestamp: envelope.timestamp,
            text: envelope.text,
            is_mention: envelope.is_mention,
            is_private_chat,
            reply_to: envelope.reply_to,
            interest_score: None,
            should_reply: None,
            actions_applied: Vec::new(),
        }
    }

    pub fn chat_type(&self) -> ChatType {
        if self.is_private_chat {
            ChatType::Private
        } else {
            ChatType::Group
        }
    }

    pub fn record_action(&mut self, action: &str) {
        if !self.actions_applied.iter().any(|a| a == action) {
            self.actions_applied.push(action.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(group_id: Option<&str>) -> InboundEnvelope {
        InboundEnvelope {
            platform: "qq".to_string(),
            stream_id: "s1".to_string(),
            user_id: "u1".to_string(),
            user_display_name: "小明".to_string(),
            message_id: None,
            group_id: group_id.map(str::to_string),
            group_name: None,
            timestamp: 100.0,
            text: "hello".to_string(),
            is_mention: false,
            reply_to: None,
            additional_meta: None,
        }
    }

    #[test]
    fn group_fields_select_the_chat_type() {
        let private = Message::from_envelope(envelope(None));
        assert_eq!(private.chat_type(), ChatType::Private);

        let group = Message::from_envelope(envelope(Some("g1")));
        assert_eq!(group.chat_type(), ChatType::Group);
    }

    #[test]
    fn missing_message_id_is_generated() {
        let message = Message::from_envelope(envelope(None));
        assert!(!message.message_id.is_empty());

        let mut with_id = envelope(None);
        with_id.message_id = Some("m42".to_string());
        assert_eq!(Message::from_envelope(with_id).message_id, "m42");
    }

    #[test]
    fn actions_are_recorded_once() {
        let mut message = Message::from_envelope(envelope(None));
        message.record_action("reply");
        message.record_action("reply");
        assert_eq!(message.actions_applied, vec!["reply".to_string()]);
    }
}
