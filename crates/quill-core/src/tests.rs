// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the session controller.
///
/// Uses `ScriptedClient` so every scenario is deterministic and requires
/// no network access.
#[cfg(test)]
mod controller_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use quill_config::{Config, InterruptMode};
    use quill_model::{Message, ScriptedClient, StopReason, StreamEvent};
    use quill_tools::{
        PendingAction, Tool, ToolContext, ToolDescriptor, ToolRegistry, ToolResult,
    };
    use quill_transcript::EntryPayload;

    use crate::{
        SessionController, SessionEvent, Subscription, RESOLVE_REMINDER_TYPE,
    };

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn controller(client: ScriptedClient) -> SessionController {
        SessionController::builder(Arc::new(client)).spawn().unwrap()
    }

    fn controller_with_tools(client: ScriptedClient, registry: ToolRegistry) -> SessionController {
        SessionController::builder(Arc::new(client))
            .with_registry(Arc::new(registry))
            .spawn()
            .unwrap()
    }

    /// Collect events until the agent goes idle again.
    async fn collect_until_idle(sub: &mut Subscription) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("event stream stalled")
                .expect("bus closed before AgentEnd");
            let done = matches!(ev, SessionEvent::AgentEnd);
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    struct WeatherTool;

    #[async_trait]
    impl Tool for WeatherTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new(
                "get_weather",
                "Current weather for a location",
                json!({
                    "type": "object",
                    "properties": { "location": { "type": "string" } },
                    "required": ["location"],
                }),
            )
        }

        async fn execute(&self, _id: &str, _args: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok("18°C, partly cloudy")
        }
    }

    fn weather_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WeatherTool)).unwrap();
        registry
    }

    // ── Scenario: simple reply ────────────────────────────────────────────────

    #[tokio::test]
    async fn simple_reply_appends_user_and_assistant() {
        let ctl = controller(ScriptedClient::always_text("hi"));
        let mut sub = ctl.subscribe();
        ctl.prompt("Say hi").await.unwrap();
        collect_until_idle(&mut sub).await;

        let messages = ctl.messages().await.unwrap();
        assert_eq!(messages.len(), 2, "transcript must have exactly 2 entries");
        assert!(matches!(&messages[0], Message::User(_)));
        match &messages[1] {
            Message::Assistant(m) => {
                assert_eq!(m.stop_reason, StopReason::Stop);
                assert_eq!(m.text(), "hi");
                assert!(m.tool_calls().is_empty());
            }
            other => panic!("expected assistant, got {other:?}"),
        }
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn event_order_is_turn_start_partials_turn_end() {
        let ctl = controller(ScriptedClient::always_text("hello"));
        let mut sub = ctl.subscribe();
        ctl.prompt("go").await.unwrap();
        let events = collect_until_idle(&mut sub).await;

        let start = events.iter().position(|e| matches!(e, SessionEvent::TurnStart { .. }));
        let delta = events.iter().position(|e| matches!(e, SessionEvent::TextDelta { .. }));
        let end = events.iter().position(|e| matches!(e, SessionEvent::TurnEnd { .. }));
        assert!(start.unwrap() < delta.unwrap());
        assert!(delta.unwrap() < end.unwrap());
        ctl.shutdown().await.unwrap();
    }

    // ── Scenario: tool round-trip ─────────────────────────────────────────────

    #[tokio::test]
    async fn tool_round_trip_orders_transcript_correctly() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::tool_call_turn("tc_1", "get_weather", json!({"location": "Tokyo"})),
            ScriptedClient::text_turn("It is 18°C and partly cloudy in Tokyo."),
        ]);
        let ctl = controller_with_tools(client, weather_registry());
        let mut sub = ctl.subscribe();
        ctl.prompt("What's the weather in Tokyo?").await.unwrap();
        collect_until_idle(&mut sub).await;

        let messages = ctl.messages().await.unwrap();
        assert_eq!(messages.len(), 4);
        assert!(matches!(&messages[0], Message::User(_)));
        match &messages[1] {
            Message::Assistant(m) => {
                assert_eq!(m.stop_reason, StopReason::ToolUse);
                assert_eq!(m.tool_calls()[0].1, "get_weather");
            }
            other => panic!("expected tool-use assistant, got {other:?}"),
        }
        match &messages[2] {
            Message::ToolResult(r) => {
                assert_eq!(r.tool_call_id, "tc_1");
                assert!(r.text().contains("18"));
                assert!(!r.is_error);
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        match &messages[3] {
            Message::Assistant(m) => {
                assert!(m.text().contains("18"));
                assert!(m.text().contains("Tokyo"));
            }
            other => panic!("expected final assistant, got {other:?}"),
        }
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn every_tool_call_gets_exactly_one_result() {
        let client = ScriptedClient::new(vec![
            vec![
                StreamEvent::Start,
                StreamEvent::Done(quill_model::AssistantMessage {
                    provider: "mock".into(),
                    model: "m".into(),
                    api: "mock".into(),
                    content: vec![
                        quill_model::ContentBlock::tool_call(
                            "tc_a",
                            "get_weather",
                            json!({"location": "Oslo"}),
                        ),
                        quill_model::ContentBlock::tool_call(
                            "tc_b",
                            "get_weather",
                            json!({"location": "Lima"}),
                        ),
                    ],
                    usage: Default::default(),
                    stop_reason: StopReason::ToolUse,
                    error_message: None,
                }),
            ],
            ScriptedClient::text_turn("done"),
        ]);
        let ctl = controller_with_tools(client, weather_registry());
        let mut sub = ctl.subscribe();
        ctl.prompt("two cities").await.unwrap();
        collect_until_idle(&mut sub).await;

        let messages = ctl.messages().await.unwrap();
        let mut result_ids: Vec<String> = messages
            .iter()
            .filter_map(|m| match m {
                Message::ToolResult(r) => Some(r.tool_call_id.clone()),
                _ => None,
            })
            .collect();
        result_ids.sort();
        assert_eq!(result_ids, vec!["tc_a", "tc_b"]);

        // Every result is strictly later in the transcript than its call.
        let call_pos = messages
            .iter()
            .position(|m| matches!(m, Message::Assistant(a) if !a.tool_calls().is_empty()))
            .unwrap();
        let first_result = messages
            .iter()
            .position(|m| matches!(m, Message::ToolResult(_)))
            .unwrap();
        assert!(first_result > call_pos);
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_tool_produces_error_result_in_band() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::tool_call_turn("tc_1", "nope", json!({})),
            ScriptedClient::text_turn("recovered"),
        ]);
        let ctl = controller(client);
        let mut sub = ctl.subscribe();
        ctl.prompt("call something unknown").await.unwrap();
        collect_until_idle(&mut sub).await;

        let messages = ctl.messages().await.unwrap();
        match &messages[2] {
            Message::ToolResult(r) => {
                assert!(r.is_error);
                assert_eq!(r.text(), "Unknown tool: nope");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        ctl.shutdown().await.unwrap();
    }

    // ── Scenario: steering ────────────────────────────────────────────────────

    #[tokio::test]
    async fn steering_aborts_and_restarts_with_the_new_message() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::text_turn("a very long reply that streams slowly"),
            ScriptedClient::text_turn("doing X now"),
        ])
        .with_delay(Duration::from_millis(25));
        let ctl = controller(client);
        let mut sub = ctl.subscribe();

        ctl.prompt("start the long task").await.unwrap();
        // Wait until the first turn is genuinely streaming.
        loop {
            match sub.recv().await.unwrap() {
                SessionEvent::TextDelta { .. } => break,
                _ => {}
            }
        }
        ctl.steer("stop, do X instead").await.unwrap();
        collect_until_idle(&mut sub).await;

        let messages = ctl.messages().await.unwrap();
        assert_eq!(messages.len(), 4);
        match &messages[1] {
            Message::Assistant(m) => {
                assert_eq!(m.stop_reason, StopReason::Aborted);
                assert_eq!(m.error_message.as_deref(), Some("Request was aborted"));
            }
            other => panic!("expected aborted assistant, got {other:?}"),
        }
        assert_eq!(messages[2].as_text(), Some("stop, do X instead"));
        match &messages[3] {
            Message::Assistant(m) => assert_eq!(m.stop_reason, StopReason::Stop),
            other => panic!("expected fresh assistant, got {other:?}"),
        }
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn abort_stops_without_queueing_anything() {
        let client = ScriptedClient::new(vec![ScriptedClient::text_turn("slow")])
            .with_delay(Duration::from_millis(25));
        let ctl = controller(client);
        let mut sub = ctl.subscribe();
        ctl.prompt("task").await.unwrap();
        loop {
            if matches!(sub.recv().await.unwrap(), SessionEvent::TurnStart { .. }) {
                break;
            }
        }
        ctl.abort().await.unwrap();
        collect_until_idle(&mut sub).await;

        let messages = ctl.messages().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(
            matches!(&messages[1], Message::Assistant(m) if m.stop_reason == StopReason::Aborted)
        );
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn prompt_while_streaming_waits_in_wait_mode() {
        let mut config = Config::default();
        config.session.interrupt_mode = InterruptMode::Wait;
        let client = ScriptedClient::new(vec![
            ScriptedClient::text_turn("first answer"),
            ScriptedClient::text_turn("second answer"),
        ])
        .with_delay(Duration::from_millis(25));
        let ctl = SessionController::builder(Arc::new(client))
            .with_config(config)
            .spawn()
            .unwrap();
        let mut sub = ctl.subscribe();

        ctl.prompt("first").await.unwrap();
        loop {
            if matches!(sub.recv().await.unwrap(), SessionEvent::TextDelta { .. }) {
                break;
            }
        }
        ctl.prompt("second").await.unwrap();
        collect_until_idle(&mut sub).await;

        let messages = ctl.messages().await.unwrap();
        assert_eq!(messages.len(), 4);
        // The first turn completed naturally.
        assert!(
            matches!(&messages[1], Message::Assistant(m) if m.stop_reason == StopReason::Stop)
        );
        assert_eq!(messages[2].as_text(), Some("second"));
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn follow_up_runs_strictly_after_the_current_turn() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::text_turn("one"),
            ScriptedClient::text_turn("two"),
        ])
        .with_delay(Duration::from_millis(15));
        let ctl = controller(client);
        let mut sub = ctl.subscribe();

        ctl.prompt("first").await.unwrap();
        loop {
            if matches!(sub.recv().await.unwrap(), SessionEvent::TurnStart { .. }) {
                break;
            }
        }
        ctl.follow_up("and then this").await.unwrap();
        let events = collect_until_idle(&mut sub).await;

        // turn_end(1) strictly precedes turn_start(2).
        let end1 = events
            .iter()
            .position(|e| matches!(e, SessionEvent::TurnEnd { turn_index: 1, .. }))
            .unwrap();
        let start2 = events
            .iter()
            .position(|e| matches!(e, SessionEvent::TurnStart { turn_index: 2 }))
            .unwrap();
        assert!(end1 < start2);

        let messages = ctl.messages().await.unwrap();
        assert_eq!(messages[2].as_text(), Some("and then this"));
        ctl.shutdown().await.unwrap();
    }

    // ── Scenario: provider error ──────────────────────────────────────────────

    #[tokio::test]
    async fn provider_error_is_terminal_with_verbatim_message() {
        let ctl = controller(ScriptedClient::new(vec![ScriptedClient::error_turn(
            "rate limited, slow down",
        )]));
        let mut sub = ctl.subscribe();
        ctl.prompt("go").await.unwrap();
        collect_until_idle(&mut sub).await;

        let messages = ctl.messages().await.unwrap();
        match &messages[1] {
            Message::Assistant(m) => {
                assert_eq!(m.stop_reason, StopReason::Error);
                assert_eq!(m.error_message.as_deref(), Some("rate limited, slow down"));
            }
            other => panic!("expected error assistant, got {other:?}"),
        }
        ctl.shutdown().await.unwrap();
    }

    // ── Pending actions & resolve reminder ────────────────────────────────────

    struct PatchTool;

    #[async_trait]
    impl Tool for PatchTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("propose_patch", "Stage a patch for review", json!({"type": "object"}))
        }

        async fn execute(&self, _id: &str, _args: Value, ctx: &ToolContext) -> ToolResult {
            ctx.push_pending(PendingAction::new("apply staged patch", "propose_patch", || {
                Ok(vec![quill_model::ContentBlock::text("patch applied cleanly")])
            }));
            ToolResult::ok("patch staged for review")
        }
    }

    #[tokio::test]
    async fn pending_action_triggers_reminder_and_auto_apply() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::tool_call_turn("tc_1", "propose_patch", json!({})),
            ScriptedClient::text_turn("acknowledged, patch is in"),
        ]);
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(PatchTool)).unwrap();
        let ctl = controller_with_tools(client, registry);
        let mut sub = ctl.subscribe();
        ctl.prompt("stage the patch").await.unwrap();
        collect_until_idle(&mut sub).await;

        let entries = ctl.entries().await.unwrap();
        let reminder_pos = entries
            .iter()
            .position(|e| {
                matches!(&e.payload, EntryPayload::Custom { custom_type, .. }
                    if custom_type == RESOLVE_REMINDER_TYPE)
            })
            .expect("resolve-reminder entry must exist");
        let applied_pos = entries
            .iter()
            .position(|e| {
                matches!(&e.payload, EntryPayload::Custom { custom_type, .. }
                    if custom_type == "pending-action-result")
            })
            .expect("pending action must be auto-applied");
        assert!(reminder_pos < applied_pos);

        // The reminder sits between the tool-use assistant message and the
        // acknowledging assistant message.
        let last_assistant = entries
            .iter()
            .rposition(|e| matches!(e.as_message(), Some(Message::Assistant(_))))
            .unwrap();
        assert!(applied_pos < last_assistant);
        ctl.shutdown().await.unwrap();
    }

    // ── Hooks ─────────────────────────────────────────────────────────────────

    struct DenyWeather;

    #[async_trait]
    impl crate::ToolCallHook for DenyWeather {
        async fn on_tool_call(
            &self,
            event: &crate::ToolCallEvent,
        ) -> anyhow::Result<crate::ToolCallDecision> {
            Ok(crate::ToolCallDecision {
                block: event.name == "get_weather",
                reason: Some("weather lookups are disabled".into()),
            })
        }
    }

    #[tokio::test]
    async fn blocking_hook_short_circuits_tool_execution() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::tool_call_turn("tc_1", "get_weather", json!({"location": "Tokyo"})),
            ScriptedClient::text_turn("understood"),
        ]);
        let mut hooks = crate::HookDispatcher::new();
        hooks.register_tool_call("policy", Arc::new(DenyWeather));
        let ctl = SessionController::builder(Arc::new(client))
            .with_registry(Arc::new(weather_registry()))
            .with_hooks(Arc::new(hooks))
            .spawn()
            .unwrap();
        let mut sub = ctl.subscribe();
        ctl.prompt("weather please").await.unwrap();
        collect_until_idle(&mut sub).await;

        let messages = ctl.messages().await.unwrap();
        match &messages[2] {
            Message::ToolResult(r) => {
                assert!(r.is_error);
                assert!(r.text().contains("weather lookups are disabled"));
            }
            other => panic!("expected blocked tool result, got {other:?}"),
        }
        ctl.shutdown().await.unwrap();
    }

    // ── Compaction through the controller ─────────────────────────────────────

    #[tokio::test]
    async fn explicit_compact_on_small_session_is_a_no_op() {
        let ctl = controller(ScriptedClient::always_text("hi"));
        let mut sub = ctl.subscribe();
        ctl.prompt("hello").await.unwrap();
        collect_until_idle(&mut sub).await;

        let compacted = ctl.compact(None).await.unwrap();
        assert!(!compacted);
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_compact_writes_one_compaction_entry() {
        // Tiny context window: 400 tokens, keep budget 100.  Automatic
        // compaction is off so the explicit call is the only trigger.
        let client = ScriptedClient::new(vec![
            ScriptedClient::text_turn("y".repeat(2000)),
            ScriptedClient::text_turn("the summary"),
        ])
        .with_context_window(400);
        let mut config = Config::default();
        config.compaction.auto = false;
        let ctl = SessionController::builder(Arc::new(client))
            .with_config(config)
            .spawn()
            .unwrap();
        let mut sub = ctl.subscribe();
        ctl.prompt("x".repeat(2000)).await.unwrap();
        collect_until_idle(&mut sub).await;

        let compacted = ctl.compact(None).await.unwrap();
        assert!(compacted);
        let entries = ctl.entries().await.unwrap();
        let records: Vec<_> = entries
            .iter()
            .filter(|e| matches!(e.payload, EntryPayload::Compaction(_)))
            .collect();
        assert_eq!(records.len(), 1);

        // Idempotent: compacting an already-compact session adds nothing.
        let again = ctl.compact(None).await.unwrap();
        assert!(!again);
        ctl.shutdown().await.unwrap();
    }

    // ── Branching & lifecycle ─────────────────────────────────────────────────

    #[tokio::test]
    async fn branch_copies_prefix_and_leaves_parent_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parent.jsonl");
        let client = ScriptedClient::new(vec![
            ScriptedClient::text_turn("one"),
            ScriptedClient::text_turn("two"),
        ]);
        let ctl = SessionController::builder(Arc::new(client))
            .with_session_file(&path)
            .spawn()
            .unwrap();
        let mut sub = ctl.subscribe();
        ctl.prompt("first").await.unwrap();
        collect_until_idle(&mut sub).await;

        let parent_file_before = std::fs::read_to_string(&path).unwrap();
        let branch_id = ctl.branch(1).await.unwrap();
        assert!(!branch_id.is_empty());

        let entries = ctl.entries().await.unwrap();
        assert_eq!(entries.len(), 3); // user, assistant, branch summary
        assert!(matches!(
            &entries[2].payload,
            EntryPayload::BranchSummary { source_entry: 1, .. }
        ));

        // Appending to the branch must not touch the parent file.
        ctl.prompt("branch only").await.unwrap();
        collect_until_idle(&mut sub).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), parent_file_before);
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn new_session_starts_with_an_empty_transcript() {
        let ctl = controller(ScriptedClient::new(vec![
            ScriptedClient::text_turn("old session"),
            ScriptedClient::text_turn("new session"),
        ]));
        let mut sub = ctl.subscribe();
        ctl.prompt("hello").await.unwrap();
        collect_until_idle(&mut sub).await;
        assert_eq!(ctl.messages().await.unwrap().len(), 2);

        let new_id = ctl.new_session().await.unwrap();
        assert!(!new_id.is_empty());
        assert!(ctl.messages().await.unwrap().is_empty());
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn session_resumes_from_file_by_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.jsonl");
        {
            let ctl = SessionController::builder(Arc::new(ScriptedClient::always_text("hi")))
                .with_session_file(&path)
                .spawn()
                .unwrap();
            let mut sub = ctl.subscribe();
            ctl.prompt("remember me").await.unwrap();
            collect_until_idle(&mut sub).await;
            ctl.shutdown().await.unwrap();
        }

        let ctl = SessionController::builder(Arc::new(ScriptedClient::always_text("again")))
            .with_session_file(&path)
            .spawn()
            .unwrap();
        let messages = ctl.messages().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].as_text(), Some("remember me"));
        ctl.shutdown().await.unwrap();
    }

    // ── Stats & export ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stats_count_messages_and_usage() {
        let ctl = controller(ScriptedClient::always_text("hi"));
        let mut sub = ctl.subscribe();
        ctl.prompt("hello").await.unwrap();
        collect_until_idle(&mut sub).await;

        let stats = ctl.stats().await.unwrap();
        assert_eq!(stats.user_messages, 1);
        assert_eq!(stats.assistant_messages, 1);
        assert!(stats.usage.input > 0);
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn export_html_contains_the_conversation() {
        let ctl = controller(ScriptedClient::always_text("rendered reply"));
        let mut sub = ctl.subscribe();
        ctl.prompt("render me").await.unwrap();
        collect_until_idle(&mut sub).await;

        let html = ctl.export_html().await.unwrap();
        assert!(html.contains("render me"));
        assert!(html.contains("rendered reply"));
        ctl.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn session_info_reflects_custom_state() {
        let ctl = controller(ScriptedClient::always_text("hi"));
        ctl.set_custom_state("review_mode", serde_json::json!(true)).await.unwrap();
        let info = ctl.info().await.unwrap();
        assert_eq!(info.custom_state.get("review_mode"), Some(&serde_json::json!(true)));
        ctl.shutdown().await.unwrap();
    }
}
