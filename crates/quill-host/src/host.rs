// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use quill_core::SessionController;

use crate::hook_ui::HookUiBridge;
use crate::protocol::{Command, EventEnvelope, HookUiResponse, Response};

/// Exit code for a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit code for an unrecoverable controller error.
pub const EXIT_CONTROLLER_ERROR: i32 = 1;

/// Run the newline-delimited JSON host loop until the input stream ends or
/// a `shutdown` command arrives.  Returns the process exit code.
///
/// All writes to `output` go through one task, so responses, events, and
/// hook UI requests never interleave mid-line.
pub async fn run<R, W>(
    controller: SessionController,
    input: R,
    output: W,
    hook_ui: Arc<HookUiBridge>,
    out_rx: mpsc::Receiver<String>,
    out_tx: mpsc::Sender<String>,
) -> i32
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = tokio::spawn(write_lines(output, out_rx));

    // Forward session events as they happen.
    let mut subscription = controller.subscribe();
    let event_tx = out_tx.clone();
    let event_pump = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            match serde_json::to_string(&EventEnvelope::new(&event)) {
                Ok(line) => {
                    if event_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize session event"),
            }
        }
    });

    let mut lines = BufReader::new(input).lines();
    let mut clean = true;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "host input read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match dispatch(&line, &controller, &out_tx, &hook_ui).await {
            Dispatch::Continue => {}
            Dispatch::Shutdown => break,
        }
    }

    hook_ui.cancel_all();
    if let Err(e) = controller.shutdown().await {
        warn!(error = %e, "controller shutdown failed");
        clean = false;
    }
    event_pump.abort();
    let _ = event_pump.await;
    // The writer drains until every sender is gone: ours, the event pump's,
    // and the hook UI bridge's.  Bounded wait in case the embedding kept a
    // sender clone alive.
    drop(hook_ui);
    drop(out_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), writer).await;
    if clean {
        EXIT_OK
    } else {
        EXIT_CONTROLLER_ERROR
    }
}

async fn write_lines<W: AsyncWrite + Unpin>(mut output: W, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if output.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        let _ = output.flush().await;
    }
}

enum Dispatch {
    Continue,
    Shutdown,
}

async fn dispatch(
    line: &str,
    controller: &SessionController,
    out: &mpsc::Sender<String>,
    hook_ui: &HookUiBridge,
) -> Dispatch {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            send(out, &Response::err(None, "", format!("Invalid JSON: {e}"))).await;
            return Dispatch::Continue;
        }
    };
    let command_type = value["type"].as_str().unwrap_or("").to_string();
    let id = value["id"].as_str().map(String::from);

    if command_type == "hook_ui_response" {
        match serde_json::from_value::<HookUiResponse>(value) {
            Ok(response) => hook_ui.resolve(response),
            Err(e) => warn!(error = %e, "malformed hook_ui_response"),
        }
        return Dispatch::Continue;
    }

    let command: Command = match serde_json::from_value(value) {
        Ok(c) => c,
        Err(_) => {
            send(
                out,
                &Response::err(
                    id.as_deref(),
                    command_type.clone(),
                    format!("Unknown command: {command_type}"),
                ),
            )
            .await;
            return Dispatch::Continue;
        }
    };

    debug!(command = command_type.as_str(), "dispatching host command");
    let id = command.id().map(String::from);
    let id = id.as_deref();
    let response = match command {
        Command::Prompt { text, attachments, .. } => controller
            .prompt_with_attachments(text, attachments)
            .await
            .map(|()| None)
            .map_err(|e| e.to_string()),
        Command::Steer { text, .. } => {
            controller.steer(text).await.map(|()| None).map_err(|e| e.to_string())
        }
        Command::FollowUp { text, .. } => {
            controller.follow_up(text).await.map(|()| None).map_err(|e| e.to_string())
        }
        Command::QueueMessage { text, .. } => {
            controller.queue_message(text).await.map(|()| None).map_err(|e| e.to_string())
        }
        Command::Abort { .. } => controller.abort().await.map(|()| None).map_err(|e| e.to_string()),
        Command::Compact { instructions, .. } => controller
            .compact(instructions)
            .await
            .map(|compacted| Some(serde_json::json!({ "compacted": compacted })))
            .map_err(|e| e.to_string()),
        Command::SetAutoCompaction { enabled, .. } => controller
            .set_auto_compaction(enabled)
            .await
            .map(|()| None)
            .map_err(|e| e.to_string()),
        Command::SetThinkingLevel { level, .. } => controller
            .set_thinking_level(level)
            .await
            .map(|()| None)
            .map_err(|e| e.to_string()),
        Command::CycleModel { .. } => controller
            .cycle_model()
            .await
            .map(|model| Some(serde_json::json!({ "model": model })))
            .map_err(|e| e.to_string()),
        Command::NewSession { .. } => controller
            .new_session()
            .await
            .map(|session_id| Some(serde_json::json!({ "session_id": session_id })))
            .map_err(|e| e.to_string()),
        Command::Branch { entry_id, .. } => controller
            .branch(entry_id)
            .await
            .map(|session_id| Some(serde_json::json!({ "session_id": session_id })))
            .map_err(|e| e.to_string()),
        Command::SwitchSession { path, .. } => controller
            .switch_session(path)
            .await
            .map(|session_id| Some(serde_json::json!({ "session_id": session_id })))
            .map_err(|e| e.to_string()),
        Command::GetMessages { .. } => controller
            .messages()
            .await
            .map(|messages| serde_json::to_value(messages).ok())
            .map_err(|e| e.to_string()),
        Command::GetStats { .. } => controller
            .stats()
            .await
            .map(|stats| serde_json::to_value(stats).ok())
            .map_err(|e| e.to_string()),
        Command::GetInfo { .. } => controller
            .info()
            .await
            .map(|info| serde_json::to_value(info).ok())
            .map_err(|e| e.to_string()),
        Command::ExportHtml { .. } => controller
            .export_html()
            .await
            .map(|html| Some(serde_json::json!({ "html": html })))
            .map_err(|e| e.to_string()),
        Command::Shutdown { .. } => {
            send(out, &Response::ok(id, "shutdown", None)).await;
            return Dispatch::Shutdown;
        }
    };

    match response {
        Ok(data) => send(out, &Response::ok(id, command_type, data)).await,
        Err(error) => send(out, &Response::err(id, command_type, error)).await,
    }
    Dispatch::Continue
}

async fn send(out: &mpsc::Sender<String>, response: &Response) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = out.send(line).await;
        }
        Err(e) => warn!(error = %e, "failed to serialize response"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
