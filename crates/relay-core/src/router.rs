use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use regex::{Regex, RegexBuilder};
use relay_types::{InboundMessage, RegisteredGroup, RelayError, Result};
use tracing::{debug, warn};

use crate::formatting::strip_internal;

/// Trait for channel adapters that can send outbound messages.
pub trait ChannelSender: Send + Sync {
    /// Return true if this sender handles the given JID.
    fn owns_jid(&self, jid: &str) -> bool;

    /// Send a text message to the specified JID.
    fn send_message(
        &self,
        jid: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// How an inbound message affects its conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Dropped entirely.
    Ignore,
    /// Kept as context for the next run but does not start one.
    Context,
    /// Starts (or joins) the next run.
    Trigger,
}

/// Classifies inbound messages and delivers outbound text to channel adapters.
pub struct MessageRouter {
    channels: Arc<Vec<Box<dyn ChannelSender>>>,
    triggers: RwLock<HashMap<String, Regex>>,
}

impl MessageRouter {
    pub fn new(channels: Arc<Vec<Box<dyn ChannelSender>>>) -> Self {
        Self {
            channels,
            triggers: RwLock::new(HashMap::new()),
        }
    }

    /// Decide what to do with a message addressed to `group`.
    pub fn classify(&self, group: &RegisteredGroup, message: &InboundMessage) -> RouteAction {
        if message.is_from_me {
            return RouteAction::Ignore;
        }
        if !group.is_sender_allowed(&message.sender) {
            debug!(
                group = %group.folder,
                sender = %message.sender,
                "Sender not in allow-list, ignoring"
            );
            return RouteAction::Ignore;
        }
        if group.is_main || !group.requires_trigger {
            return RouteAction::Trigger;
        }
        if self.matches_trigger(&group.trigger, &message.content) {
            RouteAction::Trigger
        } else {
            RouteAction::Context
        }
    }

    fn matches_trigger(&self, trigger: &str, content: &str) -> bool {
        if let Ok(cache) = self.triggers.read() {
            if let Some(re) = cache.get(trigger) {
                return re.is_match(content);
            }
        }

        match build_trigger_regex(trigger) {
            Ok(re) => {
                let matched = re.is_match(content);
                if let Ok(mut cache) = self.triggers.write() {
                    cache.insert(trigger.to_string(), re);
                }
                matched
            }
            Err(e) => {
                warn!(trigger, error = %e, "Invalid trigger, treating as no match");
                false
            }
        }
    }

    /// Send text to the channel owning `jid`, without `<internal>` spans.
    pub async fn send_message(&self, jid: &str, text: &str) -> Result<()> {
        let text = strip_internal(text);
        if text.is_empty() {
            debug!(jid, "Nothing to send after stripping internal content");
            return Ok(());
        }

        for channel in self.channels.iter() {
            if channel.owns_jid(jid) {
                channel.send_message(jid, &text).await?;
                debug!(jid, "Message sent via channel");
                return Ok(());
            }
        }

        warn!(jid, "No channel found to send message");
        Err(RelayError::Channel(format!("No channel owns JID: {jid}")))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// `^<trigger>\b`, case-insensitive, ignoring leading whitespace.
pub fn build_trigger_regex(trigger: &str) -> Result<Regex> {
    let trigger = trigger.trim();
    if trigger.is_empty() {
        return Err(RelayError::Config("Trigger must not be empty".to_string()));
    }
    RegexBuilder::new(&format!(r"^\s*{}\b", regex::escape(trigger)))
        .case_insensitive(true)
        .build()
        .map_err(|e| RelayError::Config(format!("Invalid trigger '{trigger}': {e}")))
}
