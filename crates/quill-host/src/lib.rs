// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Headless RPC host: newline-delimited JSON commands on stdin, responses
//! and session events on stdout, with hook UI round-trips correlated by id.
mod hook_ui;
mod host;
mod protocol;

pub use hook_ui::HookUiBridge;
pub use host::{run, EXIT_CONTROLLER_ERROR, EXIT_OK};
pub use protocol::{Command, EventEnvelope, HookUiRequest, HookUiResponse, Response};
