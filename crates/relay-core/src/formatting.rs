use std::sync::OnceLock;

use regex::Regex;
use relay_types::InboundMessage;

/// Escape XML special characters.
pub fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Render accumulated messages as the prompt for one agent run, in the given order.
pub fn format_messages_xml(messages: &[InboundMessage]) -> String {
    let mut lines = vec!["<messages>".to_string()];

    for msg in messages {
        let sender = escape_xml(msg.display_sender());
        let ts_str = msg.timestamp.to_rfc3339();
        let content = escape_xml(&msg.content);

        lines.push(format!(
            "  <message sender=\"{sender}\" time=\"{ts_str}\">{content}</message>"
        ));
    }

    lines.push("</messages>".to_string());
    lines.join("\n")
}

fn internal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<internal>.*?</internal>").expect("internal tag pattern is valid")
    })
}

/// Remove `<internal>…</internal>` spans from agent output before it reaches a chat.
pub fn strip_internal(text: &str) -> String {
    internal_re().replace_all(text, "").trim().to_string()
}
