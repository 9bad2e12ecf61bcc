// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider-agnostic data model for agent conversations.
//!
//! Defines the message/content types shared by every other crate and the
//! [`ModelClient`] contract that provider implementations plug into.  No
//! HTTP client lives here; concrete providers are supplied by the embedding
//! application.
mod client;
mod mock;
mod types;

pub use client::{
    AuthProvider, BlockDelta, ClientError, EventStream, ModelClient, ModelRequest, RequestOptions,
    StreamEvent, ThinkingLevel, ToolSchema,
};
pub use mock::{MockClient, ScriptedClient};
pub use types::{
    AssistantMessage, ContentBlock, Message, StopReason, TokenUsage, ToolCallRecord, ToolCallState,
    ToolResultMessage, UserMessage,
};
