// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entry::{CompactionRecord, Entry, EntryId, EntryPayload};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("transcript I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt transcript line {line}: {message}")]
    Corrupt { line: usize, message: String },
    #[error("transcript store is degraded after an I/O failure; reset before appending")]
    Degraded,
    #[error("unknown entry id {0}")]
    UnknownEntry(EntryId),
}

/// Append-only, crash-safe session log.
///
/// Entries are newline-delimited JSON in insertion order.  `append` is
/// atomically durable: the line is written and fsynced before the entry
/// becomes visible in memory, so RAM and disk never diverge.  A written
/// entry is never mutated or removed.
///
/// The store is single-writer by construction (`&mut self` on every
/// mutation); the session controller owns it and other components persist
/// by messaging the controller.
pub struct TranscriptStore {
    session_id: String,
    path: Option<PathBuf>,
    file: Option<File>,
    artifact_dir: PathBuf,
    entries: Vec<Entry>,
    next_id: EntryId,
    degraded: bool,
}

impl TranscriptStore {
    /// Ephemeral store with no backing file; used for tests and print mode.
    pub fn in_memory() -> Self {
        let session_id = Uuid::new_v4().to_string();
        let artifact_dir = std::env::temp_dir().join("quill-artifacts").join(&session_id);
        Self {
            session_id,
            path: None,
            file: None,
            artifact_dir,
            entries: Vec::new(),
            next_id: 0,
            degraded: false,
        }
    }

    /// Create a fresh session file at `path`, along with its artifact
    /// directory.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        let session_id = Uuid::new_v4().to_string();
        let artifact_dir = artifact_dir_for(&path);
        std::fs::create_dir_all(&artifact_dir)?;
        debug!(path = %path.display(), session_id, "created session file");
        Ok(Self {
            session_id,
            path: Some(path),
            file: Some(file),
            artifact_dir,
            entries: Vec::new(),
            next_id: 0,
            degraded: false,
        })
    }

    /// Open an existing session file and restore its state by replay alone;
    /// the on-disk shape is authoritative.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let entries = replay(&path)?;
        let next_id = entries.last().map(|e| e.id + 1).unwrap_or(0);
        let file = OpenOptions::new().append(true).open(&path)?;
        let artifact_dir = artifact_dir_for(&path);
        std::fs::create_dir_all(&artifact_dir)?;
        // The session id is stable across resumes: derive it from the file
        // stem so artifact references survive a restart.
        let session_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("session")
            .to_string();
        debug!(path = %path.display(), entries = entries.len(), "resumed session file");
        Ok(Self {
            session_id,
            path: Some(path),
            file: Some(file),
            artifact_dir,
            entries,
            next_id,
            degraded: false,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Per-session directory for large sidecar files (tool outputs, images).
    /// Created with the session; deleted with it.
    pub fn artifact_dir(&self) -> Result<&Path, PersistenceError> {
        if !self.artifact_dir.exists() {
            std::fs::create_dir_all(&self.artifact_dir)?;
        }
        Ok(&self.artifact_dir)
    }

    /// Append an entry, durably.  On I/O failure nothing is added to the
    /// in-memory view, the error is surfaced, and the store refuses further
    /// mutation until [`reset_degraded`](Self::reset_degraded) is called.
    pub fn append(&mut self, payload: EntryPayload) -> Result<EntryId, PersistenceError> {
        if self.degraded {
            return Err(PersistenceError::Degraded);
        }
        let entry = Entry { id: self.next_id, timestamp: Utc::now(), payload };
        if let Some(file) = &mut self.file {
            let mut line = serde_json::to_string(&entry)
                .map_err(|e| PersistenceError::Corrupt { line: 0, message: e.to_string() })?;
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.sync_data()) {
                warn!(error = %e, "transcript append failed; store degraded");
                self.degraded = true;
                return Err(e.into());
            }
        }
        let id = entry.id;
        self.entries.push(entry);
        self.next_id += 1;
        Ok(id)
    }

    /// All entries in insertion order; readers receive an immutable view.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The latest compaction record, if the session has been compacted.
    pub fn last_compaction(&self) -> Option<&CompactionRecord> {
        self.entries.iter().rev().find_map(|e| match &e.payload {
            EntryPayload::Compaction(c) => Some(c),
            _ => None,
        })
    }

    /// Create a new store seeded with entries `[0..=entry_id]` plus a
    /// `BranchSummary` marker recording the source.  The artifact directory
    /// is disjoint from the parent's; appending to the branch never touches
    /// the parent's file.
    pub fn branch_from(
        &self,
        entry_id: EntryId,
        new_path: Option<PathBuf>,
    ) -> Result<TranscriptStore, PersistenceError> {
        let cut = self
            .entries
            .iter()
            .position(|e| e.id == entry_id)
            .ok_or(PersistenceError::UnknownEntry(entry_id))?;

        let mut branch = match new_path {
            Some(p) => TranscriptStore::create(p)?,
            None => TranscriptStore::in_memory(),
        };
        // Copy the prefix verbatim — same ids and timestamps — so the two
        // sessions agree on the shared history.
        for entry in &self.entries[..=cut] {
            branch.write_verbatim(entry)?;
        }
        branch.next_id = entry_id + 1;
        branch.append(EntryPayload::BranchSummary {
            source_session: self.session_id.clone(),
            source_entry: entry_id,
        })?;
        Ok(branch)
    }

    fn write_verbatim(&mut self, entry: &Entry) -> Result<(), PersistenceError> {
        if let Some(file) = &mut self.file {
            let mut line = serde_json::to_string(entry)
                .map_err(|e| PersistenceError::Corrupt { line: 0, message: e.to_string() })?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        self.entries.push(entry.clone());
        Ok(())
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Clear the degraded flag after the caller has dealt with the failure
    /// (e.g. freed disk space).  The next append re-verifies writability.
    pub fn reset_degraded(&mut self) {
        self.degraded = false;
    }

    /// Flush all buffers to disk.  Called on shutdown.
    pub fn flush(&mut self) -> Result<(), PersistenceError> {
        if let Some(file) = &mut self.file {
            file.flush()?;
            file.sync_data()?;
        }
        Ok(())
    }

    /// Delete the session file and its artifact directory.
    pub fn delete(self) -> Result<(), PersistenceError> {
        if let Some(path) = &self.path {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        if self.artifact_dir.exists() {
            std::fs::remove_dir_all(&self.artifact_dir)?;
        }
        Ok(())
    }
}

/// Read a session file back into its exact entry sequence, custom entries
/// included.
pub fn replay(path: &Path) -> Result<Vec<Entry>, PersistenceError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: Entry = serde_json::from_str(&line).map_err(|e| PersistenceError::Corrupt {
            line: idx + 1,
            message: e.to_string(),
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn artifact_dir_for(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("session");
    path.with_file_name(format!("{stem}.artifacts"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
