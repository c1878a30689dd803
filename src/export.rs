//! Conversation export parsing.
//!
//! Normalizes a `conversations.json` archive export into [`Conversation`]
//! records. The export lists conversations newest-first; indexing numbers
//! them oldest-first so `Chat 1` is the oldest. System messages, unfinished
//! messages, and content below the ignore threshold are dropped; code and
//! execution-output content is rendered with a short prefix so it stays
//! searchable as text.

use anyhow::{bail, Result};
use serde_json::Value;
use tracing::debug;

use crate::models::{ChatMessage, Conversation};

/// Parse an export document into normalized conversations, oldest first.
///
/// Conversations that end up with no indexable messages are dropped.
pub fn parse_export(raw: &Value, ignore_threshold: usize) -> Result<Vec<Conversation>> {
    let Some(exported) = raw.as_array() else {
        bail!("Export root must be an array of conversations");
    };

    let mut conversations = Vec::new();

    for (idx, conversation) in exported.iter().rev().enumerate() {
        let raw_title = conversation
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let title = if raw_title.is_empty() {
            format!("Chat {}", idx + 1)
        } else {
            format!("Chat {} - {}", idx + 1, raw_title)
        };

        let created_at = conversation
            .get("create_time")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as i64;

        let conversation_id = conversation
            .get("conversation_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let url = (!conversation_id.is_empty())
            .then(|| format!("https://chatgpt.com/c/{conversation_id}"));
        let id = if conversation_id.is_empty() {
            format!("chat-{}", idx + 1)
        } else {
            conversation_id
        };

        let Some(mapping) = conversation.get("mapping").and_then(Value::as_object) else {
            continue;
        };

        // Mapping order is arbitrary; message timestamps define the turn
        // order.
        let mut turns: Vec<(f64, ChatMessage)> = Vec::new();
        for node in mapping.values() {
            let Some(message) = node.get("message").filter(|m| !m.is_null()) else {
                continue;
            };

            let role = message
                .pointer("/author/role")
                .and_then(Value::as_str)
                .unwrap_or("");
            if role.is_empty() || role == "system" {
                continue;
            }

            if message.get("status").and_then(Value::as_str) != Some("finished_successfully") {
                continue;
            }

            let Some(content) = render_content(message) else {
                continue;
            };
            if content.len() < ignore_threshold {
                continue;
            }

            let at = message
                .get("create_time")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            turns.push((
                at,
                ChatMessage {
                    role: role.to_string(),
                    content,
                },
            ));
        }

        if turns.is_empty() {
            continue;
        }
        turns.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        conversations.push(Conversation {
            id,
            title,
            created_at,
            url,
            messages: turns.into_iter().map(|(_, m)| m).collect(),
        });
    }

    Ok(conversations)
}

/// Render one message's content as indexable text, or `None` when the
/// content kind carries nothing worth indexing.
fn render_content(message: &Value) -> Option<String> {
    let content = message.get("content")?;
    let content_type = content.get("content_type").and_then(Value::as_str)?;

    match content_type {
        "text" | "multimodal_text" => {
            let parts = content.get("parts").and_then(Value::as_array)?;
            let text = parts
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            (!text.is_empty()).then_some(text)
        }
        "code" => {
            let text = content.get("text").and_then(Value::as_str)?;
            let mut language = content
                .get("language")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            if language == "unknown" {
                let recipient = message.get("recipient").and_then(Value::as_str);
                language = if recipient == Some("python") {
                    "python"
                } else {
                    "code"
                };
            }
            Some(format!("Code Snippet: {language}\n\n{text}"))
        }
        "execution_output" => {
            let text = content.get("text").and_then(Value::as_str)?;
            Some(format!("Execution Output: {text}"))
        }
        other => {
            debug!(content_type = other, "skipping unindexed content kind");
            None
        }
    }
}
