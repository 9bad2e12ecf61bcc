// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_threshold() -> f32 {
    0.75
}

fn default_keep_fraction() -> f32 {
    0.25
}

fn default_tool_timeout_secs() -> u64 {
    300
}

fn default_cancel_grace_secs() -> u64 {
    2
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_cap_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    256
}

fn default_tool_result_token_cap() -> usize {
    12_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier.  Concrete providers are supplied by the embedding
    /// application; the built-in binary only knows "mock".
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime via the
    /// auth callback, never stored in the session file)
    pub api_key_env: Option<String>,
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-model".into(),
            api_key_env: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// How a second message is treated when one is already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Queued messages accumulate in FIFO order.
    #[default]
    All,
    /// A second queued message replaces the first.
    OneAtATime,
}

/// What a `prompt` does while a turn is streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    /// Treat the prompt as a steer: cancel the in-flight turn and restart
    /// with the new message.
    #[default]
    Immediate,
    /// Treat the prompt as a follow-up: queue it for after the current turn.
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub steering_mode: QueueMode,
    #[serde(default)]
    pub follow_up_mode: QueueMode,
    #[serde(default)]
    pub interrupt_mode: InterruptMode,
    /// Seconds a shutdown waits for in-flight work before abandoning it.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Per-subscriber event buffer; overflow drops the oldest advisory
    /// events but never turn/tool completion or lifecycle events.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            steering_mode: QueueMode::default(),
            follow_up_mode: QueueMode::default(),
            interrupt_mode: InterruptMode::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Automatic compaction when the conversation estimate crosses
    /// `threshold × context_window`.  Overridden by `QUILL_AUTO_COMPACTION`.
    #[serde(default = "default_true")]
    pub auto: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Fraction of the context window the kept (un-summarized) tail may use.
    #[serde(default = "default_keep_fraction")]
    pub keep_fraction: f32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            threshold: default_threshold(),
            keep_fraction: default_keep_fraction(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Automatic retry of transient provider errors (429/503).  Overridden
    /// by `QUILL_AUTO_RETRY`.
    #[serde(default = "default_true")]
    pub auto: bool,
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto: true,
            max_attempts: default_retry_attempts(),
            base_ms: default_retry_base_ms(),
            cap_ms: default_retry_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default per-tool execution timeout; tools may declare an override.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Grace window between signalling cancellation and abandoning a tool.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Token cap applied to a single tool result before it enters the
    /// conversation; 0 disables truncation.
    #[serde(default = "default_tool_result_token_cap")]
    pub result_token_cap: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            result_token_cap: default_tool_result_token_cap(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let c = Config::default();
        assert!(c.compaction.auto);
        assert!((c.compaction.threshold - 0.75).abs() < f32::EPSILON);
        assert!((c.compaction.keep_fraction - 0.25).abs() < f32::EPSILON);
        assert_eq!(c.retry.max_attempts, 5);
        assert_eq!(c.retry.base_ms, 500);
        assert_eq!(c.retry.cap_ms, 30_000);
        assert_eq!(c.tools.timeout_secs, 300);
        assert_eq!(c.tools.cancel_grace_secs, 2);
        assert_eq!(c.session.shutdown_grace_secs, 10);
    }

    #[test]
    fn empty_yaml_section_fills_defaults() {
        let c: Config = serde_yaml::from_str("session: {}\n").unwrap();
        assert_eq!(c.session.event_buffer, 256);
        assert_eq!(c.session.interrupt_mode, InterruptMode::Immediate);
    }

    #[test]
    fn queue_mode_parses_snake_case() {
        let c: SessionConfig =
            serde_yaml::from_str("steering_mode: one_at_a_time\n").unwrap();
        assert_eq!(c.steering_mode, QueueMode::OneAtATime);
    }

    #[test]
    fn interrupt_mode_wait_parses() {
        let c: SessionConfig = serde_yaml::from_str("interrupt_mode: wait\n").unwrap();
        assert_eq!(c.interrupt_mode, InterruptMode::Wait);
    }

    #[test]
    fn partial_compaction_override_keeps_other_defaults() {
        let c: Config = serde_yaml::from_str("compaction:\n  threshold: 0.5\n").unwrap();
        assert!((c.compaction.threshold - 0.5).abs() < f32::EPSILON);
        assert!(c.compaction.auto);
    }
}
