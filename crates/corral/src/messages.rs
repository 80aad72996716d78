// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed view of the agent's newline-delimited JSON output (one-shot mode).
//!
//! Each line is classified by its `type` discriminator; unknown types are
//! retained as [`AgentMessage::Other`] so nothing is silently dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed message from the agent's structured-output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMessage {
    System {
        session_id: Option<String>,
        raw: Value,
    },
    Assistant {
        text_blocks: Vec<String>,
        input_tokens: u64,
        output_tokens: u64,
        raw: Value,
    },
    Result {
        result: Option<String>,
        is_error: bool,
        total_cost_usd: Option<f64>,
        raw: Value,
    },
    User {
        raw: Value,
    },
    Other {
        raw: Value,
    },
}

impl AgentMessage {
    /// The raw JSON value this message was parsed from.
    pub fn raw(&self) -> &Value {
        match self {
            Self::System { raw, .. }
            | Self::Assistant { raw, .. }
            | Self::Result { raw, .. }
            | Self::User { raw }
            | Self::Other { raw } => raw,
        }
    }
}

/// Parse one ANSI-stripped line as an agent message.
///
/// Returns `None` unless the line is a braced JSON object; callers fall
/// through to the plain text buffer in that case.
pub fn parse_message(line: &str) -> Option<AgentMessage> {
    let trimmed = line.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }
    let raw: Value = serde_json::from_str(trimmed).ok()?;
    if !raw.is_object() {
        return None;
    }
    Some(classify(raw))
}

fn classify(raw: Value) -> AgentMessage {
    match raw.get("type").and_then(Value::as_str) {
        Some("system") => {
            let session_id =
                raw.get("session_id").and_then(Value::as_str).map(str::to_owned);
            AgentMessage::System { session_id, raw }
        }
        Some("assistant") => {
            let message = raw.get("message");
            let text_blocks = message
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(Value::as_str))
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            let usage = message.and_then(|m| m.get("usage"));
            let input_tokens =
                usage.and_then(|u| u.get("input_tokens")).and_then(Value::as_u64).unwrap_or(0);
            let output_tokens =
                usage.and_then(|u| u.get("output_tokens")).and_then(Value::as_u64).unwrap_or(0);
            AgentMessage::Assistant { text_blocks, input_tokens, output_tokens, raw }
        }
        Some("result") => {
            let result = raw.get("result").and_then(Value::as_str).map(str::to_owned);
            let is_error = raw.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            let total_cost_usd = raw.get("total_cost_usd").and_then(Value::as_f64);
            AgentMessage::Result { result, is_error, total_cost_usd, raw }
        }
        Some("user") => AgentMessage::User { raw },
        _ => AgentMessage::Other { raw },
    }
}

/// Bounded, append-only list of parsed messages.
///
/// On overflow the list truncates to its most recent 80%, so a chatty
/// one-shot run keeps the tail of the conversation.
#[derive(Debug)]
pub struct MessageLog {
    messages: Vec<AgentMessage>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self { messages: Vec::new(), capacity: capacity.max(1) }
    }

    pub fn push(&mut self, message: AgentMessage) {
        self.messages.push(message);
        if self.messages.len() > self.capacity {
            let keep = (self.capacity * 4) / 5;
            let drop = self.messages.len() - keep;
            self.messages.drain(..drop);
        }
    }

    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
#[path = "messages_tests.rs"]
mod tests;
