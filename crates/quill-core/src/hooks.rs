// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use quill_model::ContentBlock;

use crate::events::{EventBus, SessionEvent};

// ─── Hook payloads ────────────────────────────────────────────────────────────

/// Snapshot of a tool call about to be executed.
#[derive(Debug, Clone)]
pub struct ToolCallEvent {
    pub tool_call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// Verdict from a `tool_call` hook.  The first handler that blocks wins;
/// later handlers are skipped.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDecision {
    pub block: bool,
    pub reason: Option<String>,
}

/// The mutable portion of a tool result as seen by `tool_result` hooks.
/// Each handler may return a replacement; later handlers see the result of
/// earlier ones.
#[derive(Debug, Clone)]
pub struct ToolResultUpdate {
    pub content: Vec<ContentBlock>,
    pub details: Option<Value>,
    pub is_error: bool,
}

/// Lifecycle actions that `before_*` hooks may veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    NewSession,
    Branch,
    SwitchSession,
    Compaction,
    Shutdown,
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleDecision {
    pub cancel: bool,
    pub reason: Option<String>,
}

// ─── Handler traits ───────────────────────────────────────────────────────────

#[async_trait]
pub trait ToolCallHook: Send + Sync {
    async fn on_tool_call(&self, event: &ToolCallEvent) -> anyhow::Result<ToolCallDecision>;
}

#[async_trait]
pub trait ToolResultHook: Send + Sync {
    /// Return `Some` to replace the current result, `None` to leave it.
    async fn on_tool_result(
        &self,
        tool_name: &str,
        current: &ToolResultUpdate,
    ) -> anyhow::Result<Option<ToolResultUpdate>>;
}

#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn before_action(&self, action: SessionAction) -> anyhow::Result<LifecycleDecision>;
}

/// Callback surface for hooks that need to ask the user something.  The RPC
/// host implements this by correlating request ids over stdio; embedded
/// front-ends implement it directly.
#[async_trait]
pub trait HookUi: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value>;
}

// ─── Dispatch ─────────────────────────────────────────────────────────────────

/// Routes lifecycle and tool events to registered handlers.
///
/// Handlers are keyed by a `custom_type` label and invoked in registration
/// order.  A handler failure is emitted as a `HookError` event and never
/// aborts the pipeline.
#[derive(Default)]
pub struct HookDispatcher {
    tool_call: Vec<(String, Arc<dyn ToolCallHook>)>,
    tool_result: Vec<(String, Arc<dyn ToolResultHook>)>,
    lifecycle: Vec<(String, Arc<dyn LifecycleHook>)>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tool_call(
        &mut self,
        custom_type: impl Into<String>,
        handler: Arc<dyn ToolCallHook>,
    ) {
        self.tool_call.push((custom_type.into(), handler));
    }

    pub fn register_tool_result(
        &mut self,
        custom_type: impl Into<String>,
        handler: Arc<dyn ToolResultHook>,
    ) {
        self.tool_result.push((custom_type.into(), handler));
    }

    pub fn register_lifecycle(
        &mut self,
        custom_type: impl Into<String>,
        handler: Arc<dyn LifecycleHook>,
    ) {
        self.lifecycle.push((custom_type.into(), handler));
    }

    /// First handler returning `block: true` wins; subsequent handlers are
    /// skipped.
    pub async fn dispatch_tool_call(
        &self,
        event: &ToolCallEvent,
        bus: &EventBus,
    ) -> Option<ToolCallDecision> {
        for (custom_type, handler) in &self.tool_call {
            match handler.on_tool_call(event).await {
                Ok(decision) if decision.block => return Some(decision),
                Ok(_) => {}
                Err(e) => self.report(bus, custom_type, "tool_call", &e),
            }
        }
        None
    }

    /// Chain replacements: each handler sees the result produced by the
    /// handlers before it.
    pub async fn dispatch_tool_result(
        &self,
        tool_name: &str,
        initial: ToolResultUpdate,
        bus: &EventBus,
    ) -> ToolResultUpdate {
        let mut current = initial;
        for (custom_type, handler) in &self.tool_result {
            match handler.on_tool_result(tool_name, &current).await {
                Ok(Some(replacement)) => current = replacement,
                Ok(None) => {}
                Err(e) => self.report(bus, custom_type, "tool_result", &e),
            }
        }
        current
    }

    /// Any handler returning `cancel: true` cancels the action.
    pub async fn dispatch_before(
        &self,
        action: SessionAction,
        bus: &EventBus,
    ) -> Option<LifecycleDecision> {
        for (custom_type, handler) in &self.lifecycle {
            match handler.before_action(action).await {
                Ok(decision) if decision.cancel => return Some(decision),
                Ok(_) => {}
                Err(e) => self.report(bus, custom_type, "lifecycle", &e),
            }
        }
        None
    }

    fn report(&self, bus: &EventBus, custom_type: &str, kind: &str, error: &anyhow::Error) {
        warn!(custom_type, kind, error = %error, "hook handler failed");
        bus.emit(SessionEvent::HookError {
            message: format!("{kind} hook '{custom_type}' failed: {error}"),
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
