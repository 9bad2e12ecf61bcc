// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quill_model::Message;

pub type EntryId = u64;

/// One compaction checkpoint.  A session carries a linear chain of these;
/// each later record summarizes strictly more history than its parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompactionRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Id of the last entry covered by the summary; everything after it is
    /// presented to the model verbatim.
    pub cut_point_entry_id: EntryId,
    pub summary_text: String,
    pub generated_at: DateTime<Utc>,
    pub token_estimate: usize,
}

/// What a transcript line contains, tagged by kind so readers can filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPayload {
    Message {
        message: Message,
        /// Persisted but not sent to the model.
        #[serde(default)]
        exclude_from_context: bool,
    },
    /// Marker written as the first non-copied entry of a branched session,
    /// recording where the prefix came from.
    BranchSummary {
        source_session: String,
        source_entry: EntryId,
    },
    Compaction(CompactionRecord),
    Custom {
        custom_type: String,
        data: serde_json::Value,
    },
}

impl EntryPayload {
    pub fn message(message: Message) -> Self {
        Self::Message { message, exclude_from_context: false }
    }
}

/// One persisted transcript record: a monotonically assigned id, the wall
/// clock at append time, and the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EntryPayload,
}

impl Entry {
    /// The message payload, if this entry is a message entry.
    pub fn as_message(&self) -> Option<&Message> {
        match &self.payload {
            EntryPayload::Message { message, .. } => Some(message),
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_entry_round_trips_with_kind_tag() {
        let e = Entry {
            id: 3,
            timestamp: Utc::now(),
            payload: EntryPayload::message(Message::user("hi")),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"kind\":\"message\""));
        assert!(json.contains("\"role\":\"user\""));
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn exclude_flag_defaults_to_false_on_old_lines() {
        let json = r#"{"id":0,"timestamp":"2026-01-01T00:00:00Z","kind":"message","message":{"role":"user","content":[{"type":"text","text":"x"}]}}"#;
        let e: Entry = serde_json::from_str(json).unwrap();
        match e.payload {
            EntryPayload::Message { exclude_from_context, .. } => {
                assert!(!exclude_from_context)
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn branch_summary_round_trips() {
        let e = Entry {
            id: 6,
            timestamp: Utc::now(),
            payload: EntryPayload::BranchSummary {
                source_session: "abc".into(),
                source_entry: 5,
            },
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"kind\":\"branch_summary\""));
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn compaction_entry_round_trips() {
        let e = Entry {
            id: 9,
            timestamp: Utc::now(),
            payload: EntryPayload::Compaction(CompactionRecord {
                id: "c1".into(),
                parent_id: None,
                cut_point_entry_id: 4,
                summary_text: "summary".into(),
                generated_at: Utc::now(),
                token_estimate: 12,
            }),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
