use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound chat message as delivered by a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_from_me: bool,
}

impl InboundMessage {
    /// Display name of the sender, falling back to the raw sender id.
    pub fn display_sender(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_defaults() {
        let json = r#"{
            "id": "1",
            "chat_jid": "slack:C123",
            "sender": "U1",
            "content": "hi",
            "timestamp": "2025-01-01T00:00:00Z"
        }"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.is_from_me);
        assert!(msg.sender_name.is_none());
        assert_eq!(msg.display_sender(), "U1");
    }
}
