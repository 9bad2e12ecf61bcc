// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent session core: streaming turn engine, queue & steering
//! scheduler, compaction engine, tool invoker, hook dispatch, and the
//! session controller that orchestrates them over an append-only
//! transcript.
mod compact;
mod controller;
mod error;
mod events;
mod hooks;
mod invoker;
mod scheduler;
mod session;
#[cfg(test)]
mod tests;
mod turn;

pub use compact::{
    choose_cut_point, over_threshold, run_compaction, CompactionOutcome,
    COMPACTION_SYSTEM_PROMPT,
};
pub use controller::{SessionBuilder, SessionController, RESOLVE_REMINDER_TYPE};
pub use error::CoreError;
pub use events::{EventBus, SessionEvent, Subscription};
pub use hooks::{
    HookDispatcher, HookUi, LifecycleDecision, LifecycleHook, SessionAction, ToolCallDecision,
    ToolCallEvent, ToolCallHook, ToolResultHook, ToolResultUpdate,
};
pub use invoker::{InvokerConfig, ToolCallRequest, ToolInvoker};
pub use scheduler::{Disposition, QueuedPrompt, Scheduler, SchedulerState};
pub use session::{
    compute_stats, export_html, message_entries, visible_conversation, SessionInfo, SessionStats,
    TodoPhase,
};
pub use turn::{stream_turn, RetryPolicy, TurnRequest, ABORT_MESSAGE};
