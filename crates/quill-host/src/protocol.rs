// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol for headless host mode.
//!
//! Newline-delimited JSON: commands arrive on stdin, responses and events
//! leave on stdout.  Every command may carry a correlation `id`, echoed on
//! its response.  Hook UI round-trips use a separate
//! `hook_ui_request` / `hook_ui_response` channel keyed by its own id.
//!
//! ```text
//! Client                              Host
//!    │── {"type":"prompt","text":…} ───►│  {"type":"response","command":"prompt",…}
//!    │                                  │  {"type":"event","event":{"type":"turn_start",…}}
//!    │                                  │  … deltas, tool events …
//!    │                                  │  {"type":"event","event":{"type":"turn_end",…}}
//!    │◄─ {"type":"hook_ui_request",…} ──│  (only when a hook asks the user)
//!    │── {"type":"hook_ui_response",…}─►│
//!    │── {"type":"shutdown"} ──────────►│  {"type":"response","command":"shutdown",…}, exit 0
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use quill_core::SessionEvent;
use quill_model::{ContentBlock, ThinkingLevel};

/// Commands accepted on the host's input stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Prompt {
        #[serde(default)]
        id: Option<String>,
        text: String,
        #[serde(default)]
        attachments: Vec<ContentBlock>,
    },
    Steer {
        #[serde(default)]
        id: Option<String>,
        text: String,
    },
    FollowUp {
        #[serde(default)]
        id: Option<String>,
        text: String,
    },
    QueueMessage {
        #[serde(default)]
        id: Option<String>,
        text: String,
    },
    Abort {
        #[serde(default)]
        id: Option<String>,
    },
    Compact {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        instructions: Option<String>,
    },
    SetAutoCompaction {
        #[serde(default)]
        id: Option<String>,
        enabled: bool,
    },
    SetThinkingLevel {
        #[serde(default)]
        id: Option<String>,
        level: ThinkingLevel,
    },
    CycleModel {
        #[serde(default)]
        id: Option<String>,
    },
    NewSession {
        #[serde(default)]
        id: Option<String>,
    },
    Branch {
        #[serde(default)]
        id: Option<String>,
        entry_id: u64,
    },
    SwitchSession {
        #[serde(default)]
        id: Option<String>,
        path: PathBuf,
    },
    GetMessages {
        #[serde(default)]
        id: Option<String>,
    },
    GetStats {
        #[serde(default)]
        id: Option<String>,
    },
    GetInfo {
        #[serde(default)]
        id: Option<String>,
    },
    ExportHtml {
        #[serde(default)]
        id: Option<String>,
    },
    Shutdown {
        #[serde(default)]
        id: Option<String>,
    },
}

impl Command {
    pub fn id(&self) -> Option<&str> {
        match self {
            Command::Prompt { id, .. }
            | Command::Steer { id, .. }
            | Command::FollowUp { id, .. }
            | Command::QueueMessage { id, .. }
            | Command::Abort { id }
            | Command::Compact { id, .. }
            | Command::SetAutoCompaction { id, .. }
            | Command::SetThinkingLevel { id, .. }
            | Command::CycleModel { id }
            | Command::NewSession { id }
            | Command::Branch { id, .. }
            | Command::SwitchSession { id, .. }
            | Command::GetMessages { id }
            | Command::GetStats { id }
            | Command::GetInfo { id }
            | Command::ExportHtml { id }
            | Command::Shutdown { id } => id.as_deref(),
        }
    }
}

/// Response to one command.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub command: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(
        id: Option<&str>,
        command: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: id.map(String::from),
            kind: "response",
            command: command.into(),
            success: true,
            data,
            error: None,
        }
    }

    pub fn err(id: Option<&str>, command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.map(String::from),
            kind: "response",
            command: command.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Envelope for forwarded session events.
#[derive(Debug, Serialize)]
pub struct EventEnvelope<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub event: &'a SessionEvent,
}

impl<'a> EventEnvelope<'a> {
    pub fn new(event: &'a SessionEvent) -> Self {
        Self { kind: "event", event }
    }
}

/// Outbound request asking the front-end to run a hook UI interaction.
#[derive(Debug, Clone, Serialize)]
pub struct HookUiRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub method: String,
    pub params: serde_json::Value,
}

/// Inbound answer to a [`HookUiRequest`], matched by `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct HookUiResponse {
    pub id: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
