// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;

use quill_config::{InterruptMode, QueueMode, SessionConfig};
use quill_model::ContentBlock;

/// A user message waiting to reach the model.
#[derive(Debug, Clone)]
pub struct QueuedPrompt {
    pub blocks: Vec<ContentBlock>,
}

impl QueuedPrompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self { blocks: vec![ContentBlock::text(text)] }
    }

    pub fn with_attachments(text: impl Into<String>, mut attachments: Vec<ContentBlock>) -> Self {
        let mut blocks = vec![ContentBlock::text(text)];
        blocks.append(&mut attachments);
        Self { blocks }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Streaming,
    Compacting,
    ShuttingDown,
}

/// What the scheduler decided to do with an intake call.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Start a turn with this message now.
    StartNow,
    /// The in-flight turn must be cancelled; the message is queued as
    /// steering and will lead the next turn.
    Steered,
    /// Queued for after the current turn completes naturally.
    Queued,
    /// The session is shutting down; the message was discarded.
    Rejected,
}

/// Queue and steering policy for user input.
///
/// Two queues: steering messages interrupt and lead the next turn;
/// follow-ups wait for natural completion.  The order messages reach the
/// model always equals the order they are appended to the transcript — the
/// controller drains exactly one queue slot per turn boundary.
pub struct Scheduler {
    state: SchedulerState,
    steering: VecDeque<QueuedPrompt>,
    follow_ups: VecDeque<QueuedPrompt>,
    steering_mode: QueueMode,
    follow_up_mode: QueueMode,
    interrupt_mode: InterruptMode,
}

impl Scheduler {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            state: SchedulerState::Idle,
            steering: VecDeque::new(),
            follow_ups: VecDeque::new(),
            steering_mode: cfg.steering_mode,
            follow_up_mode: cfg.follow_up_mode,
            interrupt_mode: cfg.interrupt_mode,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn set_state(&mut self, state: SchedulerState) {
        self.state = state;
    }

    /// `prompt` starts immediately when idle; while a turn is in flight its
    /// behaviour is governed by the interrupt mode.
    pub fn prompt(&mut self, prompt: QueuedPrompt) -> Disposition {
        match self.state {
            SchedulerState::Idle => Disposition::StartNow,
            SchedulerState::ShuttingDown => Disposition::Rejected,
            SchedulerState::Streaming | SchedulerState::Compacting => {
                match self.interrupt_mode {
                    InterruptMode::Immediate => {
                        self.push_steering(prompt);
                        Disposition::Steered
                    }
                    InterruptMode::Wait => {
                        self.push_follow_up(prompt);
                        Disposition::Queued
                    }
                }
            }
        }
    }

    /// Interrupt the in-flight turn; the message leads the replacement turn.
    pub fn steer(&mut self, prompt: QueuedPrompt) -> Disposition {
        match self.state {
            SchedulerState::Idle => Disposition::StartNow,
            SchedulerState::ShuttingDown => Disposition::Rejected,
            _ => {
                self.push_steering(prompt);
                Disposition::Steered
            }
        }
    }

    /// Queue for after the current turn completes naturally.
    pub fn follow_up(&mut self, prompt: QueuedPrompt) -> Disposition {
        match self.state {
            SchedulerState::Idle => Disposition::StartNow,
            SchedulerState::ShuttingDown => Disposition::Rejected,
            _ => {
                self.push_follow_up(prompt);
                Disposition::Queued
            }
        }
    }

    /// Push onto the follow-up queue unconditionally, never starting a turn.
    pub fn queue_message(&mut self, prompt: QueuedPrompt) -> Disposition {
        if self.state == SchedulerState::ShuttingDown {
            return Disposition::Rejected;
        }
        self.push_follow_up(prompt);
        Disposition::Queued
    }

    fn push_steering(&mut self, prompt: QueuedPrompt) {
        if self.steering_mode == QueueMode::OneAtATime {
            self.steering.clear();
        }
        self.steering.push_back(prompt);
    }

    fn push_follow_up(&mut self, prompt: QueuedPrompt) {
        if self.follow_up_mode == QueueMode::OneAtATime {
            self.follow_ups.clear();
        }
        self.follow_ups.push_back(prompt);
    }

    pub fn has_steering(&self) -> bool {
        !self.steering.is_empty()
    }

    /// Next message to lead a turn: steering first, then follow-ups.
    pub fn next_queued(&mut self) -> Option<QueuedPrompt> {
        self.steering.pop_front().or_else(|| self.follow_ups.pop_front())
    }

    pub fn queued_len(&self) -> usize {
        self.steering.len() + self.follow_ups.len()
    }

    pub fn clear(&mut self) {
        self.steering.clear();
        self.follow_ups.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
