// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Integration tests wiring the session core to the RPC host over an
/// in-memory pipe, using the deterministic mock clients.
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use quill_core::SessionController;
use quill_host::HookUiBridge;
use quill_model::{Message, ScriptedClient, StopReason};

fn spawn_host(
    client: ScriptedClient,
) -> (
    tokio::io::WriteHalf<tokio::io::SimplexStream>,
    BufReader<tokio::io::ReadHalf<tokio::io::SimplexStream>>,
    tokio::task::JoinHandle<i32>,
) {
    let (stdin_read, stdin_write) = tokio::io::simplex(4096);
    let (stdout_read, stdout_write) = tokio::io::simplex(65536);
    let controller = SessionController::builder(Arc::new(client)).spawn().unwrap();
    let (out_tx, out_rx) = mpsc::channel(256);
    let hook_ui = Arc::new(HookUiBridge::new(out_tx.clone()));
    let task = tokio::spawn(quill_host::run(
        controller,
        stdin_read,
        stdout_write,
        hook_ui,
        out_rx,
        out_tx,
    ));
    (stdin_write, BufReader::new(stdout_read), task)
}

async fn next_json(
    reader: &mut BufReader<tokio::io::ReadHalf<tokio::io::SimplexStream>>,
) -> serde_json::Value {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("host stalled")
        .expect("host closed");
    serde_json::from_str(&line).expect("invalid JSON from host")
}

#[tokio::test]
async fn host_answers_unknown_command_without_dying() {
    let (mut stdin, mut stdout, task) = spawn_host(ScriptedClient::always_text("hi"));
    stdin.write_all(b"{\"type\":\"nope\",\"id\":\"x\"}\n").await.unwrap();

    let response = loop {
        let v = next_json(&mut stdout).await;
        if v["type"] == "response" {
            break v;
        }
    };
    assert_eq!(
        serde_json::to_string(&response).unwrap(),
        r#"{"id":"x","type":"response","command":"nope","success":false,"error":"Unknown command: nope"}"#
    );

    stdin.write_all(b"{\"type\":\"shutdown\"}\n").await.unwrap();
    assert_eq!(task.await.unwrap(), 0);
}

#[tokio::test]
async fn full_prompt_round_trip_over_rpc() {
    let (mut stdin, mut stdout, task) = spawn_host(ScriptedClient::always_text("the answer"));
    stdin
        .write_all(b"{\"type\":\"prompt\",\"id\":\"p\",\"text\":\"question\"}\n")
        .await
        .unwrap();

    // Wait for the turn to finish, then fetch the transcript over RPC.
    loop {
        let v = next_json(&mut stdout).await;
        if v["type"] == "event" && v["event"]["type"] == "turn_end" {
            break;
        }
    }
    stdin.write_all(b"{\"type\":\"get_messages\",\"id\":\"m\"}\n").await.unwrap();
    let response = loop {
        let v = next_json(&mut stdout).await;
        if v["type"] == "response" && v["id"] == "m" {
            break v;
        }
    };
    let messages: Vec<Message> = serde_json::from_value(response["data"].clone()).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].as_text(), Some("question"));
    match &messages[1] {
        Message::Assistant(m) => {
            assert_eq!(m.stop_reason, StopReason::Stop);
            assert_eq!(m.text(), "the answer");
        }
        other => panic!("expected assistant, got {other:?}"),
    }

    stdin.write_all(b"{\"type\":\"shutdown\"}\n").await.unwrap();
    assert_eq!(task.await.unwrap(), 0);
}

#[tokio::test]
async fn steering_over_rpc_aborts_and_replies_to_the_new_message() {
    let client = ScriptedClient::new(vec![
        ScriptedClient::text_turn("a slow first answer"),
        ScriptedClient::text_turn("redirected"),
    ])
    .with_delay(Duration::from_millis(25));
    let (mut stdin, mut stdout, task) = spawn_host(client);

    stdin.write_all(b"{\"type\":\"prompt\",\"text\":\"start\"}\n").await.unwrap();
    // Wait until the first turn is streaming.
    loop {
        let v = next_json(&mut stdout).await;
        if v["type"] == "event" && v["event"]["type"] == "text_delta" {
            break;
        }
    }
    stdin.write_all(b"{\"type\":\"steer\",\"text\":\"do this instead\"}\n").await.unwrap();

    // Two turn_end events: the aborted turn and the steered one.
    let mut stop_reasons = Vec::new();
    while stop_reasons.len() < 2 {
        let v = next_json(&mut stdout).await;
        if v["type"] == "event" && v["event"]["type"] == "turn_end" {
            stop_reasons.push(v["event"]["message"]["stop_reason"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(stop_reasons, vec!["aborted", "stop"]);

    stdin.write_all(b"{\"type\":\"shutdown\"}\n").await.unwrap();
    assert_eq!(task.await.unwrap(), 0);
}
