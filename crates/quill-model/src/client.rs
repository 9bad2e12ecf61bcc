// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::{AssistantMessage, Message, TokenUsage};

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Reasoning-effort knob forwarded to providers that support it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

/// Per-request tuning; everything optional so providers apply their own
/// defaults for unset fields.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub thinking: ThinkingLevel,
    /// Force a specific wire API family for providers that speak several.
    pub api_override: Option<String>,
}

/// One completion request as handed to a [`ModelClient`].
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    /// Conversation visible to the model, in transcript order.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub options: RequestOptions,
}

// ─── Stream events ────────────────────────────────────────────────────────────

/// An incremental fragment of assistant output.
///
/// `ToolCall` fragments for one call share an `index`; `arguments` arrives
/// as JSON text split across fragments and is reassembled by the consumer.
#[derive(Debug, Clone)]
pub enum BlockDelta {
    Text { text: String },
    Thinking { text: String },
    /// Opaque reasoning signature for the current thinking block, forwarded
    /// verbatim.
    ThinkingSignature { signature: String },
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
}

/// A single streamed event from the model.
///
/// `Done` carries the provider-assembled canonical [`AssistantMessage`];
/// deltas are advisory and the final message is authoritative.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start,
    Delta(BlockDelta),
    Usage(TokenUsage),
    Done(AssistantMessage),
    Error(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ClientError>> + Send>>;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Network / I/O failure before or during the exchange.  Retried by the
    /// turn engine as long as no content has arrived.
    #[error("transport error: {0}")]
    Transport(String),
    /// The provider answered with a logical error (refusal, bad request,
    /// rate limit).  Surfaced in-band as an `Error` stop reason.
    #[error("provider error: {message}")]
    Provider { status: Option<u16>, message: String },
}

impl ClientError {
    /// Transient errors are eligible for automatic retry when `auto_retry`
    /// is enabled: transport failures plus provider 429/503.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Provider { status, .. } => matches!(status, Some(429) | Some(503)),
        }
    }
}

// ─── Client and auth contracts ────────────────────────────────────────────────

/// Credential resolution callback, injected at session construction.
///
/// Resolved lazily per turn; implementations must not cache across turns
/// without their own TTL.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn credentials(&self, provider: &str) -> Result<String, ClientError>;
}

/// Provider-agnostic model client.  One implementation per provider is
/// plugged in by the embedding application; the session core only ever
/// talks through this trait.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Provider identifier for display and usage records (e.g. "anthropic").
    fn provider(&self) -> &str;

    /// Model identifier as reported to users.
    fn model(&self) -> &str;

    /// Wire API family tag recorded on assistant messages.
    fn api(&self) -> &str;

    /// Context window in tokens; drives the compaction trigger.
    fn context_window(&self) -> usize {
        128_000
    }

    /// Send a completion request and return the streaming response.
    ///
    /// Providers handle their own retries only for transport-level transient
    /// errors; logical errors surface as [`StreamEvent::Error`] or
    /// [`ClientError::Provider`].
    async fn stream(&self, req: ModelRequest) -> Result<EventStream, ClientError>;

    /// Token estimate for a message list.
    ///
    /// The default is the 4-chars-per-token heuristic; providers with a
    /// counting endpoint should override.
    async fn count_tokens(&self, messages: &[Message]) -> Result<usize, ClientError> {
        Ok(messages.iter().map(Message::approx_tokens).sum())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(ClientError::Transport("reset".into()).is_transient());
    }

    #[test]
    fn rate_limit_and_overload_are_transient() {
        for status in [429u16, 503] {
            let e = ClientError::Provider { status: Some(status), message: "busy".into() };
            assert!(e.is_transient(), "{status} should be transient");
        }
    }

    #[test]
    fn bad_request_is_not_transient() {
        let e = ClientError::Provider { status: Some(400), message: "bad schema".into() };
        assert!(!e.is_transient());
    }

    #[test]
    fn provider_error_without_status_is_not_transient() {
        let e = ClientError::Provider { status: None, message: "refused".into() };
        assert!(!e.is_transient());
    }

    #[tokio::test]
    async fn default_count_tokens_uses_heuristic() {
        struct Null;
        #[async_trait]
        impl ModelClient for Null {
            fn provider(&self) -> &str { "null" }
            fn model(&self) -> &str { "null" }
            fn api(&self) -> &str { "null" }
            async fn stream(&self, _req: ModelRequest) -> Result<EventStream, ClientError> {
                Err(ClientError::Transport("unimplemented".into()))
            }
        }
        let msgs = vec![Message::user("12345678")]; // 8 chars → 2 tokens
        assert_eq!(Null.count_tokens(&msgs).await.unwrap(), 2);
    }
}
