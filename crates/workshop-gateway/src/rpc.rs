//! Chat RPC surface consumed by the bridge
//!
//! The gateway only offers single-agent sessions: `chat.send` posts a user
//! message to one session and `chat.history` returns its transcript. There is
//! no push delivery for workshop sessions, so replies are found by polling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters of a `chat.send` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendRequest {
    pub session_key: String,
    pub message: String,
    pub deliver: bool,
    pub idempotency_key: String,
}

/// One transcript entry returned by `chat.history`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: Value,
}

impl HistoryMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Value::String(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Value::String(text.into()),
        }
    }

    pub fn text(&self) -> String {
        extract_text(&self.content)
    }
}

#[async_trait]
pub trait ChatRpc: Send + Sync {
    async fn send(&self, request: ChatSendRequest) -> anyhow::Result<()>;

    async fn history(&self, session_key: &str, limit: usize) -> anyhow::Result<Vec<HistoryMessage>>;

    fn is_connected(&self) -> bool;
}

/// Flatten message content into plain text.
///
/// Content is either a bare string, a list of parts (`{"type":"text","text":..}`)
/// or a single object carrying a `text` field.
pub fn extract_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.trim().to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter(|part| {
                part.get("type")
                    .and_then(Value::as_str)
                    .is_none_or(|t| t == "text")
            })
            .map(extract_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => map.get("text").map(extract_text).unwrap_or_default(),
        _ => String::new(),
    }
}

/// Newest non-empty assistant reply that came after `prompt` was posted.
///
/// Scans from the newest message backward and stops at our own prompt, so a
/// reply to an earlier message is never mistaken for the answer.
pub fn latest_reply(messages: &[HistoryMessage], prompt: &str) -> Option<String> {
    let prompt = prompt.trim();
    for message in messages.iter().rev() {
        match message.role.as_str() {
            "assistant" => {
                let text = message.text();
                if !text.is_empty() {
                    return Some(text);
                }
            }
            "user" if message.text() == prompt => return None,
            _ => {}
        }
    }
    None
}
