// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quill_model::{ContentBlock, Message, TokenUsage};
use quill_transcript::{Entry, EntryId, EntryPayload};

/// One phase of the agent's working plan, maintained by a todo tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoPhase {
    pub name: String,
    #[serde(default)]
    pub done: bool,
}

/// Descriptive metadata for the current session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub session_file: Option<PathBuf>,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    pub todo_phases: Vec<TodoPhase>,
    pub custom_state: serde_json::Map<String, serde_json::Value>,
}

/// Aggregate counters surfaced by `session_stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub entries: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub tool_calls: usize,
    pub tool_results: usize,
    pub compactions: usize,
    pub usage: TokenUsage,
}

/// Build the conversation presented to the model from the transcript.
///
/// When the session has been compacted, the logical conversation is
/// `[CompactionSummary] ++ entries[cut_point..]`; entries flagged
/// `exclude_from_context` are persisted but never sent.  Custom entries are
/// surfaced as `Message::Custom` so providers can render them (the
/// resolve-reminder path relies on this).
pub fn visible_conversation(entries: &[Entry]) -> Vec<Message> {
    let last_compaction = entries.iter().rev().find_map(|e| match &e.payload {
        EntryPayload::Compaction(c) => Some(c),
        _ => None,
    });

    let mut out = Vec::new();
    let min_id: Option<EntryId> = match last_compaction {
        Some(c) => {
            out.push(Message::CompactionSummary { summary: c.summary_text.clone() });
            Some(c.cut_point_entry_id)
        }
        None => None,
    };

    for entry in entries {
        if let Some(min) = min_id {
            if entry.id <= min {
                continue;
            }
        }
        match &entry.payload {
            EntryPayload::Message { message, exclude_from_context } => {
                if !exclude_from_context {
                    out.push(message.clone());
                }
            }
            EntryPayload::Custom { custom_type, data } => {
                out.push(Message::Custom {
                    custom_type: custom_type.clone(),
                    data: data.clone(),
                });
            }
            EntryPayload::BranchSummary { .. } | EntryPayload::Compaction(_) => {}
        }
    }
    out
}

/// All message entries, in transcript order (the `getMessages` view).
pub fn message_entries(entries: &[Entry]) -> Vec<Message> {
    entries
        .iter()
        .filter_map(|e| e.as_message().cloned())
        .collect()
}

/// Compute aggregate counters over a transcript.
pub fn compute_stats(session_id: &str, entries: &[Entry], usage: TokenUsage) -> SessionStats {
    let mut stats = SessionStats {
        session_id: session_id.to_string(),
        entries: entries.len(),
        usage,
        ..Default::default()
    };
    for entry in entries {
        match &entry.payload {
            EntryPayload::Message { message, .. } => match message {
                Message::User(_) => stats.user_messages += 1,
                Message::Assistant(m) => {
                    stats.assistant_messages += 1;
                    stats.tool_calls += m.tool_calls().len();
                }
                Message::ToolResult(_) => stats.tool_results += 1,
                _ => {}
            },
            EntryPayload::Compaction(_) => stats.compactions += 1,
            _ => {}
        }
    }
    stats
}

// ─── HTML export ──────────────────────────────────────────────────────────────

/// Render the transcript as a minimal self-contained HTML page.
///
/// Text is escaped, never interpreted; this is a plain log view, not a
/// markdown renderer.
pub fn export_html(session_id: &str, entries: &[Entry]) -> String {
    let mut body = String::new();
    for entry in entries {
        match &entry.payload {
            EntryPayload::Message { message, .. } => {
                body.push_str(&format!(
                    "<div class=\"msg {}\"><span class=\"role\">{}</span><pre>{}</pre></div>\n",
                    message.role(),
                    message.role(),
                    escape(&render_message(message)),
                ));
            }
            EntryPayload::Compaction(c) => {
                body.push_str(&format!(
                    "<div class=\"msg compaction\"><span class=\"role\">compaction</span><pre>{}</pre></div>\n",
                    escape(&c.summary_text),
                ));
            }
            EntryPayload::BranchSummary { source_session, source_entry } => {
                body.push_str(&format!(
                    "<div class=\"msg branch\"><span class=\"role\">branched from {} @ entry {}</span></div>\n",
                    escape(source_session),
                    source_entry,
                ));
            }
            EntryPayload::Custom { custom_type, data } => {
                body.push_str(&format!(
                    "<div class=\"msg custom\"><span class=\"role\">{}</span><pre>{}</pre></div>\n",
                    escape(custom_type),
                    escape(&data.to_string()),
                ));
            }
        }
    }
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <title>Session {id}</title>\
         <style>body{{font-family:monospace;max-width:60em;margin:auto}}\
         .role{{font-weight:bold}}pre{{white-space:pre-wrap}}</style>\
         </head><body><h1>Session {id}</h1>\n{body}</body></html>\n",
        id = escape(session_id),
    )
}

fn render_message(message: &Message) -> String {
    match message {
        Message::User(m) => render_blocks(&m.content),
        Message::Assistant(m) => render_blocks(&m.content),
        Message::ToolResult(m) => render_blocks(&m.content),
        Message::BashExecution { command, output, exit_code } => {
            format!("$ {command}\n{output}\n(exit {exit_code})")
        }
        Message::PythonExecution { code, output, .. } => format!(">>> {code}\n{output}"),
        Message::CompactionSummary { summary } => summary.clone(),
        Message::Custom { custom_type, data } => format!("[{custom_type}] {data}"),
    }
}

fn render_blocks(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::Thinking { text, .. } => format!("[thinking] {text}"),
            ContentBlock::ToolCall { name, arguments, .. } => {
                format!("[tool_call: {name}({arguments})]")
            }
            ContentBlock::Image { mime_type, .. } => format!("[image: {mime_type}]"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
