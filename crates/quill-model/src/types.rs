// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single content block inside a user, assistant, or tool-result message.
///
/// `Thinking.signature` carries the provider's opaque reasoning signature
/// verbatim; some providers require it echoed back when the conversation is
/// handed off, so it is never inspected or rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    Image {
        /// Base64 payload (no data-URL prefix).
        data: String,
        mime_type: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Thinking { text: text.into(), signature: None }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self::ToolCall { id: id.into(), name: name.into(), arguments }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn text_mut(&mut self) -> Option<&mut String> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

// ─── Stop reasons and usage ───────────────────────────────────────────────────

/// Why the model stopped emitting output for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of a text response.
    Stop,
    /// The message ends with one or more tool calls awaiting results.
    ToolUse,
    /// The provider hit its output-token ceiling mid-message.
    MaxTokens,
    /// The provider reported a logical error; `error_message` is populated.
    Error,
    /// The request was cancelled locally; partial content is preserved.
    Aborted,
}

/// Token accounting for one model turn.
///
/// `total` and `cost` are provider-reported where available; `cost` stays
/// zero for providers that do not price their usage records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total: u64,
    pub cost: f64,
}

impl TokenUsage {
    /// Accumulate another turn's usage into a running total.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.total += other.total;
        self.cost += other.cost;
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessage {
    pub provider: String,
    pub model: String,
    /// Wire API family the message was produced through (e.g.
    /// "anthropic-messages", "openai-completions").
    pub api: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: TokenUsage,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AssistantMessage {
    /// All tool calls requested by this message, in content order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, name, arguments } => {
                    Some((id.as_str(), name.as_str(), arguments))
                }
                _ => None,
            })
            .collect()
    }

    /// Concatenation of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ContentBlock>,
    /// Structured sidecar data a tool (or a `tool_result` hook) may attach;
    /// persisted but never sent to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResultMessage {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// One entry in the conversation, tagged by role.
///
/// `BashExecution` / `PythonExecution` record commands the *user* ran
/// directly (outside a model turn); they are rendered into the conversation
/// so the model can see what happened between its turns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
    BashExecution {
        command: String,
        output: String,
        exit_code: i32,
    },
    PythonExecution {
        code: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    CompactionSummary {
        summary: String,
    },
    Custom {
        custom_type: String,
        data: serde_json::Value,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage { content: vec![ContentBlock::text(text)] })
    }

    pub fn user_with_blocks(content: Vec<ContentBlock>) -> Self {
        Self::User(UserMessage { content })
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::ToolResult(_) => "tool_result",
            Self::BashExecution { .. } => "bash_execution",
            Self::PythonExecution { .. } => "python_execution",
            Self::CompactionSummary { .. } => "compaction_summary",
            Self::Custom { .. } => "custom",
        }
    }

    /// Plain text of the message when it consists of exactly one text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::User(UserMessage { content }) if content.len() == 1 => content[0].as_text(),
            Self::Assistant(m) if m.content.len() == 1 => m.content[0].as_text(),
            _ => None,
        }
    }

    /// Approximate token count used for context management.
    ///
    /// Uses a 4-chars-per-token heuristic for text; images use a flat
    /// conservative estimate per block.
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            Self::User(UserMessage { content }) => blocks_chars(content),
            Self::Assistant(m) => blocks_chars(&m.content),
            Self::ToolResult(m) => blocks_chars(&m.content),
            Self::BashExecution { command, output, .. } => command.len() + output.len(),
            Self::PythonExecution { code, output, .. } => code.len() + output.len(),
            Self::CompactionSummary { summary } => summary.len(),
            Self::Custom { data, .. } => data.to_string().len(),
        };
        (chars / 4).max(1)
    }
}

fn blocks_chars(blocks: &[ContentBlock]) -> usize {
    blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => text.len(),
            ContentBlock::Thinking { text, .. } => text.len(),
            ContentBlock::ToolCall { name, arguments, .. } => {
                name.len() + arguments.to_string().len()
            }
            // ~765 tokens, the typical high-detail estimate for a 512×512 tile.
            ContentBlock::Image { .. } => 765 * 4,
        })
        .sum()
}

// ─── In-flight tool call state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Pending,
    Running,
    Completed,
    Blocked,
    Failed,
    Cancelled,
}

/// Tracking record for one tool call from acceptance to completion.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    /// Raw argument text as streamed from the provider, before any repair
    /// or validation.
    pub arguments_raw: String,
    pub arguments_validated: Option<serde_json::Value>,
    pub start_time: DateTime<Utc>,
    pub state: ToolCallState,
}

impl ToolCallRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments_raw: String) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments_raw,
            arguments_validated: None,
            start_time: Utc::now(),
            state: ToolCallState::Pending,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
