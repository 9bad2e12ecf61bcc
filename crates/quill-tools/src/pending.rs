// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use quill_model::ContentBlock;

/// A deferred side effect produced by a tool (e.g. a previewed patch waiting
/// to be applied).  `apply` captures its dependencies by value and must be
/// called exactly once.
pub struct PendingAction {
    pub label: String,
    pub source_tool_name: String,
    apply: Option<Box<dyn FnOnce() -> anyhow::Result<Vec<ContentBlock>> + Send>>,
}

impl PendingAction {
    pub fn new(
        label: impl Into<String>,
        source_tool_name: impl Into<String>,
        apply: impl FnOnce() -> anyhow::Result<Vec<ContentBlock>> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            source_tool_name: source_tool_name.into(),
            apply: Some(Box::new(apply)),
        }
    }

    /// Execute the deferred effect.  A second call returns an error instead
    /// of re-running the closure.
    pub fn apply(&mut self) -> anyhow::Result<Vec<ContentBlock>> {
        match self.apply.take() {
            Some(f) => f(),
            None => anyhow::bail!("pending action '{}' already applied", self.label),
        }
    }
}

impl std::fmt::Debug for PendingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAction")
            .field("label", &self.label)
            .field("source_tool_name", &self.source_tool_name)
            .field("applied", &self.apply.is_none())
            .finish()
    }
}

/// Thread-safe FIFO of deferred side effects.
///
/// Draining is atomic; the caller executes the `apply` closures
/// sequentially, typically before dispatching the next model turn so the
/// model sees the results.
#[derive(Default)]
pub struct PendingActionStore {
    inner: Mutex<VecDeque<PendingAction>>,
}

impl PendingActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, action: PendingAction) {
        self.inner.lock().unwrap().push_back(action);
    }

    /// Remove and return every queued action in FIFO order.
    pub fn drain(&self) -> Vec<PendingAction> {
        self.inner.lock().unwrap().drain(..).collect()
    }

    /// Label of the front action, if any.
    pub fn peek(&self) -> Option<String> {
        self.inner.lock().unwrap().front().map(|a| a.label.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels of all queued actions, front first.
    pub fn labels(&self) -> Vec<String> {
        self.inner.lock().unwrap().iter().map(|a| a.label.clone()).collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain_preserve_fifo_order() {
        let store = PendingActionStore::new();
        store.push(PendingAction::new("first", "t", || Ok(vec![])));
        store.push(PendingAction::new("second", "t", || Ok(vec![])));
        let drained = store.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].label, "first");
        assert_eq!(drained[1].label, "second");
        assert!(store.is_empty());
    }

    #[test]
    fn peek_does_not_remove() {
        let store = PendingActionStore::new();
        store.push(PendingAction::new("only", "t", || Ok(vec![])));
        assert_eq!(store.peek().as_deref(), Some("only"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn apply_runs_closure_once() {
        let mut a = PendingAction::new("patch", "edit", || {
            Ok(vec![ContentBlock::text("applied")])
        });
        let blocks = a.apply().unwrap();
        assert_eq!(blocks[0].as_text(), Some("applied"));
        assert!(a.apply().is_err(), "second apply must fail");
    }

    #[test]
    fn drain_on_empty_store_returns_nothing() {
        let store = PendingActionStore::new();
        assert!(store.drain().is_empty());
        assert_eq!(store.peek(), None);
    }
}
