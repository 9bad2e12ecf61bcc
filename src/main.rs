// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use quill_core::{SessionController, SessionEvent};
use quill_host::HookUiBridge;
use quill_model::{MockClient, ModelClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // In host mode stdout carries the protocol stream; logging goes to
    // QUILL_LOG_FILE when set, stderr when --verbose, and is otherwise off.
    init_logging(cli.verbose);

    let config = quill_config::load(cli.config.as_deref())?;

    if let Commands::ShowConfig = cli.command {
        println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        return Ok(());
    }

    let client = client_from_config(&config.model).unwrap_or_else(|e| {
        eprintln!("quill: {e}");
        std::process::exit(2);
    });

    let mut builder = SessionController::builder(client).with_config(config);
    if let Some(path) = &cli.session_file {
        builder = builder.with_session_file(path);
    }
    if let Some(cwd) = &cli.cwd {
        builder = builder.with_cwd(cwd);
    }
    let controller = builder.spawn().context("failed to start session controller")?;

    match cli.command {
        Commands::Host => {
            let (out_tx, out_rx) = mpsc::channel(1024);
            let hook_ui = Arc::new(HookUiBridge::new(out_tx.clone()));
            let code = quill_host::run(
                controller,
                tokio::io::stdin(),
                tokio::io::stdout(),
                hook_ui,
                out_rx,
                out_tx,
            )
            .await;
            std::process::exit(code);
        }
        Commands::Print { prompt } => {
            let code = run_print(&controller, &prompt).await;
            controller.shutdown().await?;
            std::process::exit(code);
        }
        Commands::ShowConfig => unreachable!("handled above"),
    }
}

/// One-shot mode: stream the reply for a single prompt to stdout.
async fn run_print(controller: &SessionController, prompt: &str) -> i32 {
    use std::io::Write;

    let mut subscription = controller.subscribe();
    if controller.prompt(prompt).await.is_err() {
        eprintln!("quill: controller rejected the prompt");
        return 1;
    }

    let mut failed = false;
    while let Some(event) = subscription.recv().await {
        match event {
            SessionEvent::TextDelta { text, .. } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            SessionEvent::TurnEnd { message, .. } => {
                if let Some(error) = &message.error_message {
                    eprintln!("quill: {error}");
                    failed = true;
                }
            }
            SessionEvent::Error { message } => {
                eprintln!("quill: {message}");
                failed = true;
            }
            SessionEvent::AgentEnd => break,
            _ => {}
        }
    }
    println!();
    if failed {
        1
    } else {
        0
    }
}

/// Resolve the configured provider.  Concrete network providers are
/// supplied by applications embedding the core; the standalone binary only
/// knows the deterministic mock.
fn client_from_config(
    model: &quill_config::ModelConfig,
) -> anyhow::Result<Arc<dyn ModelClient>> {
    match model.provider.as_str() {
        "mock" => Ok(Arc::new(MockClient)),
        other => anyhow::bail!(
            "unknown provider '{other}': model clients are supplied by the embedding application"
        ),
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));

    if let Ok(path) = std::env::var("QUILL_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
                .init();
            return;
        }
        eprintln!("quill: cannot open QUILL_LOG_FILE at {path}; logging disabled");
        return;
    }
    if verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
