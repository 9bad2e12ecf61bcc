// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "quill", version, about = "Agent session core host")]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Session file to create or resume (JSONL); in-memory when omitted
    #[arg(long, global = true)]
    pub session_file: Option<PathBuf>,

    /// Working directory exposed to tools
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Log to stderr (or honour QUILL_LOG_FILE) at debug level
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve the newline-delimited JSON protocol over stdio
    Host,
    /// Send one prompt, stream the reply to stdout, and exit
    Print {
        /// The user prompt
        prompt: String,
    },
    /// Print the merged configuration and exit
    ShowConfig,
}
