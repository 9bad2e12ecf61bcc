// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use quill_config::ToolsConfig;
use quill_model::{ToolCallRecord, ToolCallState, ToolResultMessage};
use quill_tools::{
    clip_output, ArgValidation, PendingActionStore, ToolContext, ToolRegistry, ToolResult,
};

use crate::events::{EventBus, SessionEvent};
use crate::hooks::{HookDispatcher, ToolCallEvent, ToolResultUpdate};

/// One tool call accepted from an assistant message.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct InvokerConfig {
    pub default_timeout: Duration,
    pub cancel_grace: Duration,
    pub result_token_cap: usize,
}

impl InvokerConfig {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(cfg.timeout_secs),
            cancel_grace: Duration::from_secs(cfg.cancel_grace_secs),
            result_token_cap: cfg.result_token_cap,
        }
    }
}

/// Resolves, validates, and executes tool calls with hook dispatch,
/// timeouts, and cancellation.
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    hooks: Arc<HookDispatcher>,
    pending: Arc<PendingActionStore>,
    bus: Arc<EventBus>,
    config: InvokerConfig,
}

impl ToolInvoker {
    pub fn new(
        registry: Arc<ToolRegistry>,
        hooks: Arc<HookDispatcher>,
        pending: Arc<PendingActionStore>,
        bus: Arc<EventBus>,
        config: InvokerConfig,
    ) -> Self {
        Self { registry, hooks, pending, bus, config }
    }

    /// Execute every tool call of one assistant turn.
    ///
    /// Calls run in parallel unless their tool declares `serialize`; the
    /// serialized ones run one at a time afterwards.  Results are returned
    /// in the order the tools finished, which is also the order their
    /// messages are appended to the transcript.
    pub async fn dispatch_turn(
        &self,
        calls: Vec<ToolCallRequest>,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Vec<ToolResultMessage> {
        let (serial, parallel): (Vec<_>, Vec<_>) = calls.into_iter().partition(|c| {
            self.registry
                .descriptor(&c.name)
                .map(|d| d.serialize)
                .unwrap_or(false)
        });

        let mut results = Vec::new();
        let mut set = JoinSet::new();
        for call in parallel {
            let invoker = self.clone();
            let cwd = cwd.to_path_buf();
            let cancel = cancel.clone();
            set.spawn(async move { invoker.invoke(call, cwd, cancel).await });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "tool task failed to join"),
            }
        }

        for call in serial {
            let invoker = self.clone();
            let cwd = cwd.to_path_buf();
            let cancel = cancel.clone();
            let handle =
                tokio::spawn(async move { invoker.invoke(call, cwd, cancel).await });
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "serialized tool task failed to join"),
            }
        }
        results
    }

    /// Run one tool call through the full pipeline: resolve → validate →
    /// `tool_call` hook → execute (timeout + cancellation) → `tool_result`
    /// hook → pending-action hand-off.
    pub async fn invoke(
        &self,
        call: ToolCallRequest,
        cwd: PathBuf,
        cancel: CancellationToken,
    ) -> ToolResultMessage {
        let mut record =
            ToolCallRecord::new(&call.id, &call.name, call.arguments.to_string());
        self.bus.emit(SessionEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
        });
        let result = self.invoke_inner(&call, cwd, cancel, &mut record).await;
        let elapsed = (chrono::Utc::now() - record.start_time).num_milliseconds();
        tracing::debug!(
            tool = %record.name,
            state = ?record.state,
            elapsed_ms = elapsed,
            "tool call finished"
        );
        let message = ToolResultMessage {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: result.content,
            details: result.details,
            is_error: result.is_error,
        };
        self.bus.emit(SessionEvent::ToolExecutionEnd {
            tool_call_id: call.id,
            state: record.state,
            result: message.clone(),
        });
        message
    }

    async fn invoke_inner(
        &self,
        call: &ToolCallRequest,
        cwd: PathBuf,
        cancel: CancellationToken,
        record: &mut ToolCallRecord,
    ) -> ToolResult {
        // 1. Resolve.
        let Some(tool) = self.registry.get(&call.name) else {
            record.state = ToolCallState::Failed;
            return ToolResult::err(format!("Unknown tool: {}", call.name));
        };
        let descriptor = self
            .registry
            .descriptor(&call.name)
            .expect("descriptor exists for registered tool")
            .clone();

        // 2. Validate arguments.
        let args = match self.registry.validate_args(&call.name, &call.arguments) {
            ArgValidation::Valid(v) => {
                record.arguments_validated = Some(v.clone());
                v
            }
            ArgValidation::LenientPassthrough(v) => v,
            ArgValidation::Invalid(violations) => {
                record.state = ToolCallState::Failed;
                return ToolResult::err(format!(
                    "Invalid arguments for {}: {}",
                    call.name,
                    violations.join("; ")
                ));
            }
        };

        // 3. tool_call hook — a blocking handler short-circuits execution.
        let hook_event = ToolCallEvent {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: args.clone(),
        };
        if let Some(decision) = self.hooks.dispatch_tool_call(&hook_event, &self.bus).await {
            record.state = ToolCallState::Blocked;
            let reason = decision.reason.unwrap_or_else(|| "blocked by hook".into());
            return ToolResult::err(format!("Blocked by hook: {reason}"));
        }

        // 4. Execute with per-tool timeout and a cancellation grace window.
        let (progress_tx, mut progress_rx) = mpsc::channel::<quill_tools::ToolProgress>(16);
        let forwarder_bus = Arc::clone(&self.bus);
        let forwarder = tokio::spawn(async move {
            while let Some(p) = progress_rx.recv().await {
                forwarder_bus.emit(SessionEvent::ToolProgress {
                    tool_call_id: p.tool_call_id,
                    text: p.text,
                });
            }
        });

        let ctx = ToolContext::new(cwd, cancel.child_token(), call.id.clone())
            .with_progress(progress_tx);
        let timeout = descriptor.timeout.unwrap_or(self.config.default_timeout);

        record.state = ToolCallState::Running;
        let exec = tool.execute(&call.id, args, &ctx);
        tokio::pin!(exec);
        let mut result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                ctx.cancel.cancel();
                match tokio::time::timeout(self.config.cancel_grace, &mut exec).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(tool = %call.name, "tool did not stop within grace window; abandoning");
                        record.state = ToolCallState::Cancelled;
                        ToolResult::err("Cancelled")
                    }
                }
            }
            _ = tokio::time::sleep(timeout) => {
                ctx.cancel.cancel();
                record.state = ToolCallState::Failed;
                ToolResult::err(format!(
                    "Tool '{}' timed out after {}s",
                    call.name,
                    timeout.as_secs()
                ))
            }
            result = &mut exec => result,
        };
        drop(exec);
        forwarder.abort();
        if record.state == ToolCallState::Running {
            record.state = if result.is_error {
                ToolCallState::Failed
            } else {
                ToolCallState::Completed
            };
        }

        // Cap oversized text output using the tool's declared shape.
        if self.config.result_token_cap > 0 {
            for block in &mut result.content {
                if let Some(text) = block.text_mut() {
                    let clipped =
                        clip_output(text, descriptor.output_category, self.config.result_token_cap);
                    *text = clipped;
                }
            }
        }

        // 5. tool_result hook — chained replacement.
        let update = self
            .hooks
            .dispatch_tool_result(
                &call.name,
                ToolResultUpdate {
                    content: result.content,
                    details: result.details,
                    is_error: result.is_error,
                },
                &self.bus,
            )
            .await;

        // 6. Hand registered pending actions to the session store.
        for action in ctx.take_pending() {
            self.pending.push(action);
        }

        ToolResult {
            content: update.content,
            details: update.details,
            is_error: update.is_error,
        }
    }
}
