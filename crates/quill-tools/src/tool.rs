// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use quill_model::ContentBlock;

use crate::pending::{PendingAction, PendingActionStore};

/// Shape of a tool's text output, used to pick a clipping strategy when a
/// result exceeds the configured token cap.  Each tool declares its own
/// category; the core never matches on tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Process output: most of the budget goes to the leading command
    /// context, a smaller trailing window keeps the final result visible.
    HeadTail,
    /// Ranked matches: later entries matter least, keep the front only.
    MatchList,
    /// File text: split the budget evenly so both ends survive.
    FileContent,
    /// Anything else: keep the front, cut at a line boundary.
    #[default]
    Generic,
}

/// Static description of a tool, advertised to the model and used by the
/// invoker for validation and scheduling.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Unique per session; re-registration replaces in place.
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object; compiled at registration.
    pub parameters: Value,
    /// Optional JSON Schema describing the tool's structured output.
    pub output_schema: Option<Value>,
    /// Strict tools reject any argument-schema violation.
    pub strict: bool,
    /// Pass raw arguments through on validation failure; the tool itself is
    /// expected to cope.
    pub lenient_arg_validation: bool,
    /// Run this tool exclusively instead of in parallel with the other calls
    /// of the same turn.
    pub serialize: bool,
    /// Per-tool timeout override; `None` uses the configured default.
    pub timeout: Option<Duration>,
    pub output_category: OutputCategory,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            output_schema: None,
            strict: true,
            lenient_arg_validation: false,
            serialize: false,
            timeout: None,
            output_category: OutputCategory::Generic,
        }
    }

    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self.lenient_arg_validation = true;
        self
    }

    pub fn serialized(mut self) -> Self {
        self.serialize = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_output_category(mut self, category: OutputCategory) -> Self {
        self.output_category = category;
        self
    }
}

/// Progress line emitted by a running tool; forwarded as an event but never
/// persisted.
#[derive(Debug, Clone)]
pub struct ToolProgress {
    pub tool_call_id: String,
    pub text: String,
}

/// Execution context handed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub cwd: PathBuf,
    pub cancel: CancellationToken,
    /// Per-invocation pending-action slot; the invoker drains it into the
    /// session store after the result hooks have run.
    pending: Arc<PendingActionStore>,
    tool_call_id: String,
    progress: Option<mpsc::Sender<ToolProgress>>,
}

impl ToolContext {
    pub fn new(cwd: PathBuf, cancel: CancellationToken, tool_call_id: impl Into<String>) -> Self {
        Self {
            cwd,
            cancel,
            pending: Arc::new(PendingActionStore::new()),
            tool_call_id: tool_call_id.into(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<ToolProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Register a deferred side effect for later confirmation or
    /// auto-application.
    pub fn push_pending(&self, action: PendingAction) {
        self.pending.push(action);
    }

    /// Drain the actions registered during this invocation.
    pub fn take_pending(&self) -> Vec<PendingAction> {
        self.pending.drain()
    }

    /// Emit a progress line.  Dropped silently when no consumer is attached.
    pub async fn progress(&self, text: impl Into<String>) {
        if let Some(tx) = &self.progress {
            let _ = tx
                .send(ToolProgress {
                    tool_call_id: self.tool_call_id.clone(),
                    text: text.into(),
                })
                .await;
        }
    }
}

/// The result of executing a tool, before it is wrapped into a transcript
/// message by the invoker.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    /// Structured sidecar data; persisted but not sent to the model.
    pub details: Option<Value>,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            details: None,
            is_error: false,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(message)],
            details: None,
            is_error: true,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
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

/// Trait every tool implements.  `execute` receives already-validated
/// arguments (or the raw value for lenient tools) and must wrap failures in
/// [`ToolResult::err`] rather than panicking.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn execute(&self, tool_call_id: &str, args: Value, ctx: &ToolContext) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults_are_strict_parallel_generic() {
        let d = ToolDescriptor::new("t", "a tool", serde_json::json!({"type": "object"}));
        assert!(d.strict);
        assert!(!d.lenient_arg_validation);
        assert!(!d.serialize);
        assert!(d.timeout.is_none());
        assert_eq!(d.output_category, OutputCategory::Generic);
    }

    #[test]
    fn lenient_builder_flips_both_flags() {
        let d = ToolDescriptor::new("t", "d", serde_json::json!({})).lenient();
        assert!(!d.strict);
        assert!(d.lenient_arg_validation);
    }

    #[test]
    fn tool_result_text_joins_blocks() {
        let r = ToolResult {
            content: vec![ContentBlock::text("a"), ContentBlock::text("b")],
            details: None,
            is_error: false,
        };
        assert_eq!(r.text(), "ab");
    }

    #[test]
    fn context_collects_pending_actions() {
        let ctx = ToolContext::new(
            PathBuf::from("."),
            CancellationToken::new(),
            "tc_1",
        );
        ctx.push_pending(PendingAction::new("apply patch", "edit", || Ok(vec![])));
        let drained = ctx.take_pending();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].label, "apply patch");
    }

    #[tokio::test]
    async fn progress_without_consumer_is_silent() {
        let ctx = ToolContext::new(PathBuf::from("."), CancellationToken::new(), "tc_1");
        ctx.progress("halfway").await; // must not panic or block
    }

    #[tokio::test]
    async fn progress_reaches_consumer() {
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = ToolContext::new(PathBuf::from("."), CancellationToken::new(), "tc_9")
            .with_progress(tx);
        ctx.progress("working").await;
        let p = rx.recv().await.unwrap();
        assert_eq!(p.tool_call_id, "tc_9");
        assert_eq!(p.text, "working");
    }
}
