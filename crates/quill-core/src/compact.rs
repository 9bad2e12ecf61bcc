// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use quill_config::CompactionConfig;
use quill_model::{
    ContentBlock, Message, ModelClient, ModelRequest, RequestOptions, StopReason, StreamEvent,
};
use quill_transcript::{CompactionRecord, EntryId};

use crate::error::CoreError;

/// System prompt for the summarization call.  Information-dense by design:
/// the summary replaces the original history.
pub const COMPACTION_SYSTEM_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
Summarise the conversation history below in a concise, information-dense way. \
Preserve all technical details, decisions, file names, code snippets, error \
messages, and tool outputs that may be relevant to future work. Record every \
unfinished subtask and open question. The summary will replace the original \
history to free up context space.";

/// Result of a successful compaction: the record to append plus the token
/// estimates for the event stream.
#[derive(Debug)]
pub struct CompactionOutcome {
    pub record: CompactionRecord,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Choose how many leading messages to summarize.
///
/// Walks backwards accumulating the kept tail until the keep budget is
/// exhausted, then moves the split further back so it never lands on a
/// tool result — splitting a tool-call/tool-result pair would leave the
/// model with orphaned references and providers reject that.
pub fn choose_cut_point(messages: &[(EntryId, Message)], keep_budget_tokens: usize) -> usize {
    let mut kept = 0usize;
    let mut cut = messages.len();
    while cut > 0 {
        let tokens = messages[cut - 1].1.approx_tokens();
        if kept + tokens > keep_budget_tokens {
            break;
        }
        kept += tokens;
        cut -= 1;
    }
    // The first kept message must not be a tool result; move the cut back
    // until the whole tool interaction group lands in the kept tail.
    while cut > 0 && cut < messages.len() {
        match &messages[cut].1 {
            Message::ToolResult(_) => cut -= 1,
            _ => break,
        }
    }
    cut
}

/// Run one compaction pass over the visible conversation.
///
/// `messages` is the post-compaction view (a prior summary counts like any
/// other message), paired with the transcript entry id of each message so
/// the cut point can be recorded.  Returns `Ok(None)` when the session is
/// already compact — compaction is idempotent.  On any failure the session
/// is left unchanged and `CoreError::Compaction` is surfaced; cancellation
/// writes nothing.
pub async fn run_compaction(
    client: Arc<dyn ModelClient>,
    messages: &[(EntryId, Message)],
    parent: Option<&CompactionRecord>,
    custom_instructions: Option<&str>,
    config: &CompactionConfig,
    cancel: &CancellationToken,
) -> Result<Option<CompactionOutcome>, CoreError> {
    let flat: Vec<Message> = messages.iter().map(|(_, m)| m.clone()).collect();
    let tokens_before = client
        .count_tokens(&flat)
        .await
        .map_err(|e| CoreError::Compaction(e.to_string()))?;

    let keep_budget =
        (client.context_window() as f32 * config.keep_fraction).max(1.0) as usize;
    let cut = choose_cut_point(messages, keep_budget);
    if cut == 0 {
        return Ok(None);
    }

    let mut system_prompt = COMPACTION_SYSTEM_PROMPT.to_string();
    if let Some(extra) = custom_instructions {
        system_prompt.push_str("\n\nAdditional instructions:\n");
        system_prompt.push_str(extra);
    }
    let history_text = serialize_history(&flat[..cut]);
    let request = ModelRequest {
        model: client.model().to_string(),
        system_prompt: Some(system_prompt),
        messages: vec![Message::user(history_text)],
        tools: vec![],
        options: RequestOptions::default(),
    };

    let summary = collect_text(client.as_ref(), request, cancel).await?;
    if summary.trim().is_empty() {
        return Err(CoreError::Compaction("summarizer returned an empty summary".into()));
    }

    let cut_point_entry_id = messages[cut - 1].0;
    let summary_tokens = (summary.len() / 4).max(1);
    let kept_tokens: usize = flat[cut..].iter().map(Message::approx_tokens).sum();
    let record = CompactionRecord {
        id: Uuid::new_v4().to_string(),
        parent_id: parent.map(|p| p.id.clone()),
        cut_point_entry_id,
        summary_text: summary,
        generated_at: Utc::now(),
        token_estimate: summary_tokens,
    };
    Ok(Some(CompactionOutcome {
        record,
        tokens_before,
        tokens_after: summary_tokens + kept_tokens,
    }))
}

/// Should automatic compaction fire for this conversation size?
pub fn over_threshold(estimated_tokens: usize, context_window: usize, threshold: f32) -> bool {
    context_window > 0 && (estimated_tokens as f32) > threshold * context_window as f32
}

/// Drive one tool-free completion to its final text, honouring cancellation.
/// Nothing is written on any failure path.
async fn collect_text(
    client: &dyn ModelClient,
    request: ModelRequest,
    cancel: &CancellationToken,
) -> Result<String, CoreError> {
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        result = client.stream(request) => {
            result.map_err(|e| CoreError::Compaction(e.to_string()))?
        }
    };
    let mut stream = stream;
    let mut text = String::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            ev = stream.next() => ev,
        };
        match event {
            None => return Ok(text),
            Some(Err(e)) => return Err(CoreError::Compaction(e.to_string())),
            Some(Ok(StreamEvent::Done(message))) => {
                if message.stop_reason == StopReason::Error {
                    return Err(CoreError::Compaction(
                        message.error_message.unwrap_or_else(|| "summarizer error".into()),
                    ));
                }
                return Ok(message.text());
            }
            Some(Ok(StreamEvent::Error(message))) => {
                return Err(CoreError::Compaction(message));
            }
            Some(Ok(_)) => {}
        }
    }
}

/// Serialise a message list into plain text for the compaction prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = m.role();
            let text = match m {
                Message::User(u) => render_blocks(&u.content),
                Message::Assistant(a) => render_blocks(&a.content),
                Message::ToolResult(t) => format!("[tool_result: {}]", t.text()),
                Message::BashExecution { command, output, .. } => {
                    format!("[bash: {command}]\n{output}")
                }
                Message::PythonExecution { code, output, .. } => {
                    format!("[python: {code}]\n{output}")
                }
                Message::CompactionSummary { summary } => summary.clone(),
                Message::Custom { custom_type, data } => format!("[{custom_type}: {data}]"),
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_blocks(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.clone()),
            ContentBlock::Thinking { .. } => None,
            ContentBlock::ToolCall { name, arguments, .. } => {
                Some(format!("[tool_call: {name}({arguments})]"))
            }
            ContentBlock::Image { .. } => Some("[image]".to_string()),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use quill_model::{AssistantMessage, ScriptedClient, TokenUsage, ToolResultMessage};

    use super::*;

    fn user(id: EntryId, len: usize) -> (EntryId, Message) {
        (id, Message::user("x".repeat(len)))
    }

    fn assistant_with_tool_call(id: EntryId) -> (EntryId, Message) {
        (
            id,
            Message::Assistant(AssistantMessage {
                provider: "mock".into(),
                model: "m".into(),
                api: "mock".into(),
                content: vec![ContentBlock::tool_call("tc_1", "shell", serde_json::json!({}))],
                usage: TokenUsage::default(),
                stop_reason: StopReason::ToolUse,
                error_message: None,
            }),
        )
    }

    fn tool_result(id: EntryId) -> (EntryId, Message) {
        (
            id,
            Message::ToolResult(ToolResultMessage {
                tool_call_id: "tc_1".into(),
                tool_name: "shell".into(),
                content: vec![ContentBlock::text("ok")],
                details: None,
                is_error: false,
            }),
        )
    }

    #[test]
    fn cut_point_zero_when_everything_fits() {
        let msgs = vec![user(0, 40), user(1, 40)];
        assert_eq!(choose_cut_point(&msgs, 10_000), 0);
    }

    #[test]
    fn cut_point_keeps_a_recent_tail() {
        // 10 messages × 100 tokens; budget of 250 keeps 2 and summarizes 8.
        let msgs: Vec<_> = (0..10).map(|i| user(i, 400)).collect();
        assert_eq!(choose_cut_point(&msgs, 250), 8);
    }

    #[test]
    fn cut_point_never_lands_on_a_tool_result() {
        // ... user, assistant(toolCall), toolResult, user ...
        let mut msgs: Vec<_> = (0..6).map(|i| user(i, 400)).collect();
        msgs.push(assistant_with_tool_call(6));
        msgs.push(tool_result(7));
        msgs.push(user(8, 400));
        // A budget that would cut exactly at the tool result.
        let keep = msgs[7].1.approx_tokens() + msgs[8].1.approx_tokens();
        let cut = choose_cut_point(&msgs, keep);
        // Either before the tool call or after the tool result.
        assert!(cut <= 6 || cut >= 8, "cut {cut} splits the tool pair");
        assert!(!matches!(&msgs.get(cut).map(|(_, m)| m), Some(Message::ToolResult(_))));
    }

    #[test]
    fn over_threshold_matches_contract() {
        assert!(over_threshold(80_000, 100_000, 0.75));
        assert!(!over_threshold(70_000, 100_000, 0.75));
        assert!(!over_threshold(1, 0, 0.75));
    }

    #[tokio::test]
    async fn run_compaction_is_idempotent_when_compact() {
        let client = Arc::new(ScriptedClient::always_text("unused"));
        let msgs = vec![user(0, 8)];
        let out = run_compaction(
            client,
            &msgs,
            None,
            None,
            &CompactionConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn run_compaction_produces_record_with_cut_entry_id() {
        let client = Arc::new(ScriptedClient::always_text("dense summary"));
        // Tiny keep budget via a big conversation: context_window is 128k,
        // keep 25% = 32k tokens; make messages larger than that.
        let msgs: Vec<_> = (0..10).map(|i| user(i, 40_000)).collect();
        let out = run_compaction(
            client,
            &msgs,
            None,
            None,
            &CompactionConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .expect("should compact");
        assert!(out.record.cut_point_entry_id < 10);
        assert_eq!(out.record.summary_text, "dense summary");
        assert!(out.tokens_after < out.tokens_before);
    }

    #[tokio::test]
    async fn failed_summarizer_surfaces_compaction_error() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::error_turn("boom")]));
        let msgs: Vec<_> = (0..10).map(|i| user(i, 40_000)).collect();
        let err = run_compaction(
            client,
            &msgs,
            None,
            None,
            &CompactionConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Compaction(_)));
    }

    #[tokio::test]
    async fn cancelled_compaction_writes_nothing() {
        let client = Arc::new(ScriptedClient::always_text("unused"));
        let msgs: Vec<_> = (0..10).map(|i| user(i, 40_000)).collect();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_compaction(
            client,
            &msgs,
            None,
            None,
            &CompactionConfig::default(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test]
    async fn custom_instructions_reach_the_summarizer() {
        let client = Arc::new(ScriptedClient::always_text("summary"));
        let msgs: Vec<_> = (0..10).map(|i| user(i, 40_000)).collect();
        let _ = run_compaction(
            Arc::clone(&client) as Arc<dyn ModelClient>,
            &msgs,
            None,
            Some("focus on file paths"),
            &CompactionConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let req = client.last_request.lock().unwrap();
        let sys = req.as_ref().unwrap().system_prompt.clone().unwrap();
        assert!(sys.contains("focus on file paths"));
    }
}
