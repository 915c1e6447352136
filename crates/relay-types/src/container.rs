use serde::{Deserialize, Serialize};

use crate::enums::RunStatus;

/// Inline binary payload (e.g. an image) handed to the next invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub media_type: String,
    /// Base64-encoded content, passed through untouched.
    pub data: String,
}

/// Request written to the agent container's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_scheduled_task: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

/// Result emitted by the agent container as the last line of stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub status: RunStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvocationResult {
    pub fn success(result: Option<String>, new_session_id: Option<String>) -> Self {
        Self {
            status: RunStatus::Success,
            result,
            new_session_id,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format() {
        let req = InvocationRequest {
            prompt: "hi".to_string(),
            session_id: None,
            group_folder: "acme".to_string(),
            chat_jid: "tg:1".to_string(),
            is_main: false,
            is_scheduled_task: false,
            attachment: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["groupFolder"], "acme");
        assert_eq!(value["chatJid"], "tg:1");
        assert_eq!(value["isMain"], false);
        assert!(value.get("sessionId").is_none());
        assert!(value.get("isScheduledTask").is_none());
        assert!(value.get("attachment").is_none());
    }

    #[test]
    fn request_with_attachment() {
        let req = InvocationRequest {
            prompt: "what is this?".to_string(),
            session_id: Some("sess-1".to_string()),
            group_folder: "acme".to_string(),
            chat_jid: "tg:1".to_string(),
            is_main: true,
            is_scheduled_task: true,
            attachment: Some(Attachment {
                media_type: "image/png".to_string(),
                data: "iVBORw0KGgo=".to_string(),
            }),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["sessionId"], "sess-1");
        assert_eq!(value["isScheduledTask"], true);
        assert_eq!(value["attachment"]["mediaType"], "image/png");
    }

    #[test]
    fn result_parses_camel_case() {
        let json = r#"{"status":"success","result":"Done","newSessionId":"sess-42"}"#;
        let result: InvocationResult = serde_json::from_str(json).unwrap();
        assert!(result.is_success());
        assert_eq!(result.result.as_deref(), Some("Done"));
        assert_eq!(result.new_session_id.as_deref(), Some("sess-42"));
        assert!(result.error.is_none());
    }

    #[test]
    fn result_rejects_unknown_status() {
        let json = r#"{"status":"partial","result":null}"#;
        assert!(serde_json::from_str::<InvocationResult>(json).is_err());
    }

    #[test]
    fn error_constructor() {
        let result = InvocationResult::error("boom");
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(result.result.is_none());
    }
}
