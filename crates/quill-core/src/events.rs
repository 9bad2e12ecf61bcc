// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::Notify;

use quill_model::{AssistantMessage, ToolCallState, ToolResultMessage};

/// Events emitted by a session, in transcript order.
/// Consumers (TUI, RPC host, print mode) subscribe to drive their output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session became current (startup, new, branch, or switch).
    Session {
        session_id: String,
        session_file: Option<PathBuf>,
    },
    /// The agent started processing user input.
    AgentStart,
    /// The queue is exhausted and the agent is idle again.
    AgentEnd,
    TurnStart {
        turn_index: u64,
    },
    /// A streamed text fragment (advisory; the canonical message arrives
    /// with `TurnEnd`).
    TextDelta {
        turn_index: u64,
        text: String,
    },
    /// A streamed reasoning fragment (advisory).
    ThinkingDelta {
        turn_index: u64,
        text: String,
    },
    ToolExecutionStart {
        tool_call_id: String,
        name: String,
    },
    /// Progress line from a running tool; forwarded, never persisted.
    ToolProgress {
        tool_call_id: String,
        text: String,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        /// Terminal state of the call: completed, blocked, failed, or
        /// cancelled.
        state: ToolCallState,
        result: ToolResultMessage,
    },
    TurnEnd {
        turn_index: u64,
        message: AssistantMessage,
        tool_results: Vec<ToolResultMessage>,
    },
    CompactionStart,
    CompactionEnd {
        tokens_before: usize,
        tokens_after: usize,
    },
    /// A hook handler failed; the pipeline continued.
    HookError {
        message: String,
    },
    /// A recoverable session-level error.
    Error {
        message: String,
    },
}

impl SessionEvent {
    /// Advisory events may be dropped under subscriber backpressure;
    /// everything else is delivered even if the buffer has to grow.
    fn is_advisory(&self) -> bool {
        matches!(
            self,
            Self::TextDelta { .. } | Self::ThinkingDelta { .. } | Self::ToolProgress { .. }
        )
    }
}

// ─── Fan-out ──────────────────────────────────────────────────────────────────

struct SubscriberInner {
    queue: Mutex<VecDeque<SessionEvent>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

/// One subscriber's ordered view of the event stream.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
}

impl Subscription {
    /// Receive the next event; `None` once the bus is closed and the buffer
    /// drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            if let Some(ev) = self.inner.queue.lock().unwrap().pop_front() {
                return Some(ev);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.inner.queue.lock().unwrap().pop_front()
    }
}

/// Single-producer event fan-out with bounded per-subscriber buffers.
///
/// Subscribers receive events in emission order.  On overflow the oldest
/// *advisory* event is dropped; `turn_end`, tool results, and lifecycle
/// events are never dropped (the buffer grows instead).
pub struct EventBus {
    subscribers: Mutex<Vec<Weak<SubscriberInner>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let inner = Arc::new(SubscriberInner {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.capacity,
        });
        self.subscribers.lock().unwrap().push(Arc::downgrade(&inner));
        Subscription { inner }
    }

    pub fn emit(&self, event: SessionEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|weak| {
            let Some(sub) = weak.upgrade() else { return false };
            let mut queue = sub.queue.lock().unwrap();
            if queue.len() >= sub.capacity {
                if let Some(pos) = queue.iter().position(SessionEvent::is_advisory) {
                    queue.remove(pos);
                }
            }
            queue.push_back(event.clone());
            drop(queue);
            sub.notify.notify_one();
            true
        });
    }

    /// Wake every subscriber with end-of-stream.
    pub fn close(&self) {
        let subs = self.subscribers.lock().unwrap();
        for weak in subs.iter() {
            if let Some(sub) = weak.upgrade() {
                sub.closed.store(true, Ordering::Release);
                sub.notify.notify_waiters();
                sub.notify.notify_one();
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(n: u64) -> SessionEvent {
        SessionEvent::TextDelta { turn_index: n, text: format!("d{n}") }
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        bus.emit(SessionEvent::AgentStart);
        bus.emit(SessionEvent::TurnStart { turn_index: 1 });
        bus.emit(delta(1));
        assert!(matches!(sub.recv().await, Some(SessionEvent::AgentStart)));
        assert!(matches!(sub.recv().await, Some(SessionEvent::TurnStart { turn_index: 1 })));
        assert!(matches!(sub.recv().await, Some(SessionEvent::TextDelta { .. })));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_advisory_first() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        bus.emit(delta(1));
        bus.emit(delta(2));
        bus.emit(delta(3)); // displaces delta(1)
        let first = sub.try_recv().unwrap();
        assert!(matches!(first, SessionEvent::TextDelta { turn_index: 2, .. }));
    }

    #[tokio::test]
    async fn critical_events_survive_overflow() {
        let bus = EventBus::new(1);
        let mut sub = bus.subscribe();
        bus.emit(SessionEvent::AgentStart);
        bus.emit(SessionEvent::TurnStart { turn_index: 1 });
        bus.emit(SessionEvent::AgentEnd);
        // Nothing advisory to drop — all three must be delivered.
        assert!(matches!(sub.recv().await, Some(SessionEvent::AgentStart)));
        assert!(matches!(sub.recv().await, Some(SessionEvent::TurnStart { .. })));
        assert!(matches!(sub.recv().await, Some(SessionEvent::AgentEnd)));
    }

    #[tokio::test]
    async fn close_ends_the_stream_after_drain() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();
        bus.emit(SessionEvent::AgentEnd);
        bus.close();
        assert!(matches!(sub.recv().await, Some(SessionEvent::AgentEnd)));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe();
        drop(sub);
        bus.emit(SessionEvent::AgentStart);
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(SessionEvent::AgentStart);
        assert!(matches!(a.recv().await, Some(SessionEvent::AgentStart)));
        assert!(matches!(b.recv().await, Some(SessionEvent::AgentStart)));
    }
}
