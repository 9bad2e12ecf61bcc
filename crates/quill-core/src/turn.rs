// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use quill_config::RetryConfig;
use quill_model::{
    AssistantMessage, BlockDelta, ClientError, ContentBlock, Message, ModelClient, ModelRequest,
    RequestOptions, StopReason, StreamEvent, TokenUsage, ToolSchema,
};
use quill_tools::parse_arguments;

use crate::events::{EventBus, SessionEvent};

pub const ABORT_MESSAGE: &str = "Request was aborted";

// ─── Retry policy ─────────────────────────────────────────────────────────────

/// Exponential backoff with jitter for transport failures that occur before
/// any content has arrived.  Once a partial has been emitted, failures are
/// surfaced instead of retried so the partial data is never discarded.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Also retry transient provider errors (429/503).
    pub retry_transient_provider: bool,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base: Duration::from_millis(cfg.base_ms),
            cap: Duration::from_millis(cfg.cap_ms),
            retry_transient_provider: cfg.auto,
        }
    }

    /// Delay before retry number `attempt` (0-based): base × 2^attempt,
    /// capped, with ±25 % jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        let jitter = rand::rng().random_range(0.75..=1.25);
        Duration::from_millis((capped * jitter) as u64)
    }

    fn should_retry(&self, error: &ClientError, attempt: u32, got_content: bool) -> bool {
        if got_content || attempt + 1 >= self.max_attempts {
            return false;
        }
        match error {
            ClientError::Transport(_) => true,
            ClientError::Provider { .. } => {
                self.retry_transient_provider && error.is_transient()
            }
        }
    }
}

// ─── Turn inputs ──────────────────────────────────────────────────────────────

/// Everything one model request needs; owned so the turn future is
/// `'static` and the controller stays free to process commands while the
/// turn streams.
pub struct TurnRequest {
    pub client: Arc<dyn ModelClient>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub conversation: Vec<Message>,
    pub options: RequestOptions,
    pub retry: RetryPolicy,
}

impl TurnRequest {
    fn model_request(&self) -> ModelRequest {
        ModelRequest {
            model: self.client.model().to_string(),
            system_prompt: self.system_prompt.clone(),
            messages: self.conversation.clone(),
            tools: self.tools.clone(),
            options: self.options.clone(),
        }
    }
}

// ─── Fragment assembly ────────────────────────────────────────────────────────

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

/// Accumulates streamed fragments so that an aborted or failed turn can
/// still commit everything received so far.
struct TurnAssembly {
    blocks: Vec<ContentBlock>,
    pending_tool_calls: BTreeMap<u32, PendingToolCall>,
    usage: TokenUsage,
    got_content: bool,
}

impl TurnAssembly {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            pending_tool_calls: BTreeMap::new(),
            usage: TokenUsage::default(),
            got_content: false,
        }
    }

    fn apply(&mut self, delta: &BlockDelta) {
        self.got_content = true;
        match delta {
            BlockDelta::Text { text } => match self.blocks.last_mut() {
                Some(ContentBlock::Text { text: buf }) => buf.push_str(text),
                _ => self.blocks.push(ContentBlock::text(text.clone())),
            },
            BlockDelta::Thinking { text } => match self.blocks.last_mut() {
                Some(ContentBlock::Thinking { text: buf, .. }) => buf.push_str(text),
                _ => self.blocks.push(ContentBlock::thinking(text.clone())),
            },
            BlockDelta::ThinkingSignature { signature } => match self.blocks.last_mut() {
                Some(ContentBlock::Thinking { signature: slot, .. }) => {
                    *slot = Some(signature.clone());
                }
                _ => self.blocks.push(ContentBlock::Thinking {
                    text: String::new(),
                    signature: Some(signature.clone()),
                }),
            },
            BlockDelta::ToolCall { index, id, name, arguments } => {
                let ptc = self.pending_tool_calls.entry(*index).or_insert(PendingToolCall {
                    id: String::new(),
                    name: String::new(),
                    args_buf: String::new(),
                });
                if !id.is_empty() {
                    ptc.id = id.clone();
                }
                if !name.is_empty() {
                    ptc.name = name.clone();
                }
                ptc.args_buf.push_str(arguments);
            }
        }
    }

    /// Build a message from the fragments received so far.  Used for the
    /// abort and error paths; the happy path returns the provider's own
    /// canonical message.
    fn finish(
        mut self,
        client: &dyn ModelClient,
        stop_reason: StopReason,
        error_message: Option<String>,
    ) -> AssistantMessage {
        // Tool calls with an empty name cannot be dispatched and are
        // dropped; an empty id gets a synthetic fallback so the pair
        // invariant can still be maintained by later turns.
        let pending = std::mem::take(&mut self.pending_tool_calls);
        for (i, (_, ptc)) in pending.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping streamed tool call with empty name");
                continue;
            }
            let id = if ptc.id.is_empty() {
                warn!(tool_name = %ptc.name, "streamed tool call had empty id; generating one");
                format!("tc_synthetic_{i}")
            } else {
                ptc.id
            };
            let args = parse_arguments(&ptc.name, &ptc.args_buf);
            self.blocks.push(ContentBlock::tool_call(id, ptc.name, args));
        }
        AssistantMessage {
            provider: client.provider().to_string(),
            model: client.model().to_string(),
            api: client.api().to_string(),
            content: self.blocks,
            usage: self.usage,
            stop_reason,
            error_message,
        }
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// Execute one model request, emitting `turn_start` and partial events, and
/// return the canonical [`AssistantMessage`].
///
/// Failures never escape: transport errors are retried under the policy
/// while no content has arrived, and everything else is folded into the
/// returned message (`stop_reason = Error` / `Aborted`) so the transcript
/// always gains exactly one assistant message per turn.
pub async fn stream_turn(
    req: &TurnRequest,
    turn_index: u64,
    bus: &EventBus,
    cancel: &CancellationToken,
) -> AssistantMessage {
    bus.emit(SessionEvent::TurnStart { turn_index });

    let client = req.client.as_ref();
    let mut attempt: u32 = 0;

    loop {
        let mut assembly = TurnAssembly::new();

        if cancel.is_cancelled() {
            return assembly.finish(client, StopReason::Aborted, Some(ABORT_MESSAGE.into()));
        }

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return assembly.finish(client, StopReason::Aborted, Some(ABORT_MESSAGE.into()));
            }
            result = client.stream(req.model_request()) => result,
        };

        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                if req.retry.should_retry(&e, attempt, false) {
                    let delay = req.retry.delay(attempt);
                    attempt += 1;
                    warn!(attempt, ?delay, error = %e, "model request failed; backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return assembly.finish(
                                client,
                                StopReason::Aborted,
                                Some(ABORT_MESSAGE.into()),
                            );
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                return assembly.finish(client, StopReason::Error, Some(e.to_string()));
            }
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return assembly.finish(
                        client,
                        StopReason::Aborted,
                        Some(ABORT_MESSAGE.into()),
                    );
                }
                ev = stream.next() => ev,
            };

            match event {
                None => {
                    // Stream ended without a terminal event.  Retry as a
                    // transport failure while nothing has been received.
                    let e = ClientError::Transport("stream ended without completion".into());
                    if req.retry.should_retry(&e, attempt, assembly.got_content) {
                        attempt += 1;
                        tokio::time::sleep(req.retry.delay(attempt - 1)).await;
                        break;
                    }
                    return assembly.finish(client, StopReason::Error, Some(e.to_string()));
                }
                Some(Err(e)) => {
                    if req.retry.should_retry(&e, attempt, assembly.got_content) {
                        let delay = req.retry.delay(attempt);
                        attempt += 1;
                        warn!(attempt, ?delay, error = %e, "model stream failed; backing off");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                return assembly.finish(
                                    client,
                                    StopReason::Aborted,
                                    Some(ABORT_MESSAGE.into()),
                                );
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        break;
                    }
                    return assembly.finish(client, StopReason::Error, Some(e.to_string()));
                }
                Some(Ok(StreamEvent::Start)) => {}
                Some(Ok(StreamEvent::Delta(delta))) => {
                    match &delta {
                        BlockDelta::Text { text } if !text.is_empty() => {
                            bus.emit(SessionEvent::TextDelta {
                                turn_index,
                                text: text.clone(),
                            });
                        }
                        BlockDelta::Thinking { text } if !text.is_empty() => {
                            bus.emit(SessionEvent::ThinkingDelta {
                                turn_index,
                                text: text.clone(),
                            });
                        }
                        _ => {}
                    }
                    assembly.apply(&delta);
                }
                Some(Ok(StreamEvent::Usage(usage))) => {
                    assembly.usage = usage;
                }
                Some(Ok(StreamEvent::Done(mut message))) => {
                    // The Done message is canonical and byte-identical to
                    // what replays will show; fill in usage only if the
                    // provider put it in a separate event.
                    if message.usage == TokenUsage::default() {
                        message.usage = assembly.usage;
                    }
                    return message;
                }
                Some(Ok(StreamEvent::Error(message))) => {
                    // Verbatim, and the partial data is kept.
                    return assembly.finish(client, StopReason::Error, Some(message));
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
