//! Storage-facing record types shared by both backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::state::SessionState;

/// Session listing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub slug: String,
    pub world: String,
    pub has_lock: bool,
    pub updated_at: DateTime<Utc>,
}

/// One transcript/changelog entry as returned to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogItem {
    /// 0-based entry id, stable across reads.
    pub id: String,
    pub text: String,
}

/// Paginated log read: `cursor` is the id of the last returned entry and
/// is only present when more entries follow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub items: Vec<LogItem>,
    pub cursor: Option<String>,
}

/// 1-based last positions of both logs after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogIndices {
    pub transcript: u64,
    pub changelog: u64,
}

/// A turn reservation: the witness of the state at preview time plus the
/// inputs replayed at commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preview {
    pub id: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
    pub base_turn: u64,
    pub base_hash: String,
    pub state_patch: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_entry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog_entry: Option<Value>,
    pub dice_expressions: Vec<String>,
    /// Contiguous indices starting at `log_index + 1` at preview time.
    pub reserved_indices: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
}

/// Point-in-time session capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRecord {
    pub save_id: String,
    pub session_slug: String,
    /// "auto" or "manual".
    pub save_type: String,
    pub created_at: DateTime<Utc>,
    pub data: Value,
}

/// The write set applied atomically by a turn commit:
/// state, log appends, preview deletion.
#[derive(Debug, Clone)]
pub struct CommitArtifacts {
    pub preview_id: String,
    pub new_state: SessionState,
    pub transcript_lines: Vec<String>,
    pub changelog_line: Option<String>,
    /// Owner revalidated against the live lock inside the write unit.
    pub lock_owner: Option<String>,
}

/// Auxiliary per-session documents: whole-document replace only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    Mood,
    Discoveries,
    NpcMemory,
    NpcRelationships,
    LastDiscovery,
    AutoSave,
    TurnPrompt,
}

impl DocKind {
    pub const ALL: [DocKind; 7] = [
        DocKind::Mood,
        DocKind::Discoveries,
        DocKind::NpcMemory,
        DocKind::NpcRelationships,
        DocKind::LastDiscovery,
        DocKind::AutoSave,
        DocKind::TurnPrompt,
    ];

    /// Stable key: the filename stem on disk and the row key in SQL.
    pub fn key(&self) -> &'static str {
        match self {
            DocKind::Mood => "mood",
            DocKind::Discoveries => "discoveries",
            DocKind::NpcMemory => "npc_memory",
            DocKind::NpcRelationships => "npc_relationships",
            DocKind::LastDiscovery => "last_discovery",
            DocKind::AutoSave => "auto_save",
            DocKind::TurnPrompt => "turn_prompt",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.key() == key)
    }

    /// Default payload when the document has never been written.
    pub fn empty_value(&self) -> Value {
        match self {
            DocKind::NpcMemory | DocKind::Discoveries => Value::Array(Vec::new()),
            _ => Value::Object(serde_json::Map::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_kind_keys_round_trip() {
        for kind in DocKind::ALL {
            assert_eq!(DocKind::from_key(kind.key()), Some(kind));
        }
        assert_eq!(DocKind::from_key("quests"), None);
    }

    #[test]
    fn test_doc_kind_empty_values() {
        assert!(DocKind::NpcMemory.empty_value().is_array());
        assert!(DocKind::Mood.empty_value().is_object());
    }

    #[test]
    fn test_preview_serde_round_trip() {
        let preview = Preview {
            id: "p-1".into(),
            slug: "cellar-run".into(),
            created_at: Utc::now(),
            base_turn: 3,
            base_hash: "abc".into(),
            state_patch: serde_json::json!({"location": "camp"}),
            transcript_entry: Some("Player looks around.".into()),
            changelog_entry: None,
            dice_expressions: vec!["1d20".into()],
            reserved_indices: vec![6],
            lock_owner: Some("alice".into()),
        };
        let raw = serde_json::to_string(&preview).expect("serialize");
        let back: Preview = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back.base_turn, 3);
        assert_eq!(back.reserved_indices, vec![6]);
        assert!(back.changelog_entry.is_none());
    }
}
