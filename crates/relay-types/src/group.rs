use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A host directory exposed to the agent container in addition to the standard mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalMount {
    pub host_path: String,
    /// Relative name under `/workspace/extra/`; defaults to the host directory's basename.
    #[serde(default)]
    pub container_path: Option<String>,
    #[serde(default)]
    pub read_write: bool,
}

/// Per-conversation container settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub additional_mounts: Vec<AdditionalMount>,
    /// Timeout override in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Registered conversation the system acts on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub trigger: String,
    #[serde(default)]
    pub allowed_senders: Option<Vec<String>>,
    #[serde(default)]
    pub container_config: Option<ContainerConfig>,
    #[serde(default = "default_true")]
    pub requires_trigger: bool,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default = "Utc::now")]
    pub added_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl RegisteredGroup {
    /// Whether `sender` may address the assistant in this conversation.
    pub fn is_sender_allowed(&self, sender: &str) -> bool {
        match &self.allowed_senders {
            Some(list) => list.iter().any(|s| s == sender),
            None => true,
        }
    }

    pub fn additional_mounts(&self) -> &[AdditionalMount] {
        self.container_config
            .as_ref()
            .map(|c| c.additional_mounts.as_slice())
            .unwrap_or(&[])
    }

    pub fn timeout_override(&self) -> Option<u64> {
        self.container_config.as_ref().and_then(|c| c.timeout)
    }
}
