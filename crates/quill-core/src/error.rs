// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use quill_transcript::PersistenceError;

/// Error kinds that escape a component boundary.
///
/// Tool and provider failures are represented in-band (as messages in the
/// transcript) so the model can recover; only persistence failures and
/// broken controller invariants surface here.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("compaction failed: {0}")]
    Compaction(String),
    #[error("cancelled")]
    Cancelled,
    #[error("controller is shutting down")]
    ShuttingDown,
    #[error("{0}")]
    Invalid(String),
}
