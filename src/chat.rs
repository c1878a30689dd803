//! Conversation continuation.
//!
//! Resumes an indexed conversation through the chat endpoint: the stored
//! transcript becomes the model context, each user turn is dispatched with
//! a token/cost preview, and the exchange is appended back to the index.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::ingest;
use crate::models::{CallContext, ChatMessage};
use crate::store::BlobStore;
use crate::tokenizer::Tokenizer;

pub async fn run_chat(
    config: &Config,
    store: Arc<dyn BlobStore>,
    dispatcher: Arc<Dispatcher>,
    tokenizer: &Tokenizer,
    conversation_id: &str,
    assume_yes: bool,
) -> Result<()> {
    let mut index = ingest::load_index(store.as_ref()).await?;
    let Some(conversation) = index.get(conversation_id) else {
        bail!("Unknown conversation: {conversation_id}. Run a search to find ids.");
    };

    // Tool and other non-user roles collapse to assistant so the wire
    // context stays a plain two-party transcript.
    let mut context: Vec<ChatMessage> = conversation
        .messages
        .iter()
        .map(|m| ChatMessage {
            role: if m.role == "user" {
                "user".to_string()
            } else {
                "assistant".to_string()
            },
            content: m.content.clone(),
        })
        .collect();

    println!("Chat Title: {}", conversation.title);
    println!();
    for message in &context {
        println!("- {}: {}", capitalize(&message.role), message.content);
        println!();
        println!("-----");
        println!();
    }

    loop {
        let Some(user_input) = prompt("- User (blank to exit): ")? else {
            break;
        };

        context.push(ChatMessage {
            role: "user".to_string(),
            content: user_input,
        });

        let tokens = tokenizer.count_messages(&context);
        let cost = tokens as f64 / 1000.0 * config.models.chat.input_cost_per_1k;
        if !assume_yes {
            let go = prompt(&format!(
                "- Context Has {tokens} Tokens - Input Cost: ~${cost:.4} - Proceed? (y/n): "
            ))?;
            if !matches!(go.as_deref(), Some(s) if s.eq_ignore_ascii_case("y")) {
                context.pop();
                println!("- Aborted -");
                continue;
            }
        }

        let record = dispatcher
            .dispatch(CallContext::Messages(context.clone()), None)
            .await?;

        let Some(reply) = record.text().filter(|_| record.is_success()) else {
            eprintln!(
                "Warning: completion failed: {}",
                record.error.as_deref().unwrap_or("no output")
            );
            context.pop();
            continue;
        };

        println!();
        println!("- Assistant: {reply}");
        println!();

        let reply = reply.to_string();
        context.push(ChatMessage {
            role: "assistant".to_string(),
            content: reply,
        });

        // Persist the new exchange so the next resume sees it.
        if let Some(stored) = index.get_mut(conversation_id) {
            let n = context.len();
            stored.messages.extend_from_slice(&context[n - 2..]);
        }
        ingest::save_index(store.as_ref(), &index).await?;
    }

    Ok(())
}

fn capitalize(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Read one trimmed line; `None` on EOF or an empty answer.
fn prompt(text: &str) -> Result<Option<String>> {
    print!("{text}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    let read = std::io::stdin().read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }
    let line = line.trim().to_string();
    Ok((!line.is_empty()).then_some(line))
}
