// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};

use crate::{
    AssistantMessage, BlockDelta, ClientError, ContentBlock, EventStream, Message, ModelClient,
    ModelRequest, StopReason, StreamEvent, TokenUsage,
};

/// Deterministic mock client.  Echoes the last user message back as the
/// assistant response.
#[derive(Default)]
pub struct MockClient;

fn assistant(content: Vec<ContentBlock>, stop_reason: StopReason) -> AssistantMessage {
    AssistantMessage {
        provider: "mock".into(),
        model: "mock-model".into(),
        api: "mock".into(),
        content,
        usage: TokenUsage { input: 10, output: 10, total: 20, ..Default::default() },
        stop_reason,
        error_message: None,
    }
}

#[async_trait]
impl ModelClient for MockClient {
    fn provider(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "mock-model"
    }
    fn api(&self) -> &str {
        "mock"
    }

    async fn stream(&self, req: ModelRequest) -> Result<EventStream, ClientError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User(_) => m.as_text(),
                _ => None,
            })
            .unwrap_or("[no input]")
            .to_string();

        let text = format!("MOCK: {reply}");
        let events: Vec<Result<StreamEvent, ClientError>> = vec![
            Ok(StreamEvent::Start),
            Ok(StreamEvent::Delta(BlockDelta::Text { text: text.clone() })),
            Ok(StreamEvent::Done(assistant(
                vec![ContentBlock::text(text)],
                StopReason::Stop,
            ))),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Scripted client ──────────────────────────────────────────────────────────

/// A pre-scripted mock client.  Each call to `stream` pops the next event
/// script from the front of the queue, so tests can specify exact sequences
/// — including tool calls, errors, and aborts — without network access.
pub struct ScriptedClient {
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
    /// Per-event delay injected into the stream; lets steering tests cancel
    /// a turn while it is genuinely mid-flight.
    delay: Option<Duration>,
    /// `stream()` fails with a transport error this many times before the
    /// first script is served.  Exercises the retry path.
    fail_first: AtomicUsize,
    /// The last `ModelRequest` seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ModelRequest>>>,
    calls: AtomicUsize,
    context_window: usize,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            delay: None,
            fail_first: AtomicUsize::new(0),
            last_request: Arc::new(Mutex::new(None)),
            calls: AtomicUsize::new(0),
            context_window: 128_000,
        }
    }

    /// Shrink the claimed context window; exercises compaction triggers.
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Sleep `delay` before each streamed event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `n` `stream()` calls with a transport error.
    pub fn with_transport_failures(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Number of completed `stream()` calls (failures included).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Convenience: client that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_turn(reply)])
    }

    /// Event script for one plain text turn.
    pub fn text_turn(text: impl Into<String>) -> Vec<StreamEvent> {
        let text = text.into();
        vec![
            StreamEvent::Start,
            StreamEvent::Delta(BlockDelta::Text { text: text.clone() }),
            StreamEvent::Usage(TokenUsage { input: 5, output: 5, total: 10, ..Default::default() }),
            StreamEvent::Done(assistant(vec![ContentBlock::text(text)], StopReason::Stop)),
        ]
    }

    /// Event script for a turn that requests exactly one tool call.
    pub fn tool_call_turn(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Vec<StreamEvent> {
        let id = id.into();
        let name = name.into();
        vec![
            StreamEvent::Start,
            StreamEvent::Delta(BlockDelta::ToolCall {
                index: 0,
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.to_string(),
            }),
            StreamEvent::Done(assistant(
                vec![ContentBlock::tool_call(id, name, arguments)],
                StopReason::ToolUse,
            )),
        ]
    }

    /// Event script for a turn ending in a provider error after no content.
    pub fn error_turn(message: impl Into<String>) -> Vec<StreamEvent> {
        vec![StreamEvent::Start, StreamEvent::Error(message.into())]
    }

    /// Convenience: tool call on the first turn, text reply on the second.
    pub fn tool_then_text(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_turn(id, name, arguments),
            Self::text_turn(final_text),
        ])
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn provider(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "scripted-mock"
    }
    fn api(&self) -> &str {
        "mock"
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn stream(&self, req: ModelRequest) -> Result<EventStream, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req);

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(ClientError::Transport("scripted transport failure".into()));
        }

        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Fallback when all scripts are consumed.
                Self::text_turn("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };

        let delay = self.delay;
        let s = stream::iter(events.into_iter().map(Ok)).then(move |ev| async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            ev
        });
        Ok(Box::pin(s))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
