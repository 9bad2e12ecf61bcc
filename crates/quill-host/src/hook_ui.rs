// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use quill_core::HookUi;

use crate::protocol::{HookUiRequest, HookUiResponse};

/// [`HookUi`] implementation for host mode: requests go out as
/// `hook_ui_request` lines and answers come back as `hook_ui_response`
/// lines correlated by id.
pub struct HookUiBridge {
    out: mpsc::Sender<String>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, String>>>>,
    counter: AtomicU64,
}

impl HookUiBridge {
    pub fn new(out: mpsc::Sender<String>) -> Self {
        Self {
            out,
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
        }
    }

    /// Route an inbound `hook_ui_response` to its waiting requester.
    pub fn resolve(&self, response: HookUiResponse) {
        let waiter = self.pending.lock().unwrap().remove(&response.id);
        match waiter {
            Some(tx) => {
                let outcome = match response.error {
                    Some(e) => Err(e),
                    None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            None => warn!(id = %response.id, "hook_ui_response with no waiting request"),
        }
    }

    /// Fail every outstanding request; called when the input stream closes.
    pub fn cancel_all(&self) {
        for (_, tx) in self.pending.lock().unwrap().drain() {
            let _ = tx.send(Err("host input closed".into()));
        }
    }
}

#[async_trait]
impl HookUi for HookUiBridge {
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let id = format!("hook-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let line = serde_json::to_string(&HookUiRequest {
            kind: "hook_ui_request",
            id: id.clone(),
            method: method.to_string(),
            params,
        })?;
        if self.out.send(line).await.is_err() {
            self.pending.lock().unwrap().remove(&id);
            anyhow::bail!("host output closed");
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => anyhow::bail!("hook UI error: {e}"),
            Err(_) => anyhow::bail!("hook UI request dropped"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
