// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Configuration schema and layered YAML loading.
mod loader;
mod schema;

pub use loader::load;
pub use schema::{
    CompactionConfig, Config, InterruptMode, ModelConfig, QueueMode, RetryConfig, SessionConfig,
    ToolsConfig,
};
