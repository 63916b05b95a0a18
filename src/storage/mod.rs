//! Storage contract.
//!
//! One backend-neutral trait, two compliant implementations (filesystem
//! and SQLite). Both must produce identical externally observable
//! behavior for identical operation sequences: entry ordering, turn
//! monotonicity, atomicity of the commit write set.

pub mod file;
pub mod models;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::{Settings, StorageBackendKind};
use crate::core::entropy::EntropyEntry;
use crate::core::error::{EngineError, EngineResult};
use crate::core::lock::LockInfo;
use crate::core::state::SessionState;

pub use models::{
    CommitArtifacts, DocKind, LogIndices, LogItem, LogPage, Preview, SaveRecord, SessionSummary,
};

/// Shared handle to whichever backend the service runs against.
pub type SharedStorage = Arc<dyn Storage>;

/// The full capability set both backends implement.
#[async_trait]
pub trait Storage: Send + Sync {
    // --- session lifecycle ---
    async fn list_sessions(&self) -> EngineResult<Vec<SessionSummary>>;
    /// Clone `template_slug` into a fresh session: template state with
    /// `turn = 0`, `log_index = 0`, empty transcript, a single changelog
    /// initialization line, and the template character mirrored in.
    async fn create_session(&self, slug: &str, template_slug: &str) -> EngineResult<()>;

    // --- state ---
    async fn load_state(&self, slug: &str) -> EngineResult<SessionState>;
    /// Atomic all-or-nothing replacement of the state document.
    async fn save_state(&self, slug: &str, state: &SessionState) -> EngineResult<()>;

    // --- append logs ---
    /// Append lines to the transcript; returns the 1-based position of
    /// the last appended line.
    async fn append_transcript(&self, slug: &str, lines: &[String]) -> EngineResult<u64>;
    async fn append_changelog(&self, slug: &str, lines: &[String]) -> EngineResult<u64>;
    async fn load_transcript(
        &self,
        slug: &str,
        tail: Option<usize>,
        cursor: Option<&str>,
    ) -> EngineResult<LogPage>;
    async fn load_changelog(
        &self,
        slug: &str,
        tail: Option<usize>,
        cursor: Option<&str>,
    ) -> EngineResult<LogPage>;
    /// Current 1-based last positions of both logs.
    async fn log_counts(&self, slug: &str) -> EngineResult<LogIndices>;

    // --- turn records ---
    async fn persist_turn_record(&self, slug: &str, turn: u64, record: &Value) -> EngineResult<()>;
    /// Newest-first, up to `limit`.
    async fn load_turn_records(&self, slug: &str, limit: usize) -> EngineResult<Vec<Value>>;
    async fn load_turn_record(&self, slug: &str, turn: u64) -> EngineResult<Value>;
    /// Append a roll payload to an existing record's `rolls`; returns
    /// false when no record exists for that turn.
    async fn append_rolls_to_turn(&self, slug: &str, turn: u64, roll: &Value)
        -> EngineResult<bool>;

    // --- previews ---
    async fn save_preview(&self, slug: &str, preview: &Preview) -> EngineResult<()>;
    async fn load_preview(&self, slug: &str, preview_id: &str) -> EngineResult<Preview>;
    /// Idempotent: deleting an absent preview succeeds.
    async fn delete_preview(&self, slug: &str, preview_id: &str) -> EngineResult<()>;
    /// Garbage-collect previews created before `cutoff`; returns the
    /// number removed.
    async fn sweep_previews(&self, slug: &str, cutoff: DateTime<Utc>) -> EngineResult<u64>;

    // --- lock ---
    /// Atomic against concurrent claims: exactly one of a burst of
    /// distinct owners wins on an unlocked session.
    async fn claim_lock(&self, slug: &str, owner: &str, ttl: u64) -> EngineResult<LockInfo>;
    async fn release_lock(&self, slug: &str, owner: Option<&str>) -> EngineResult<()>;
    async fn get_lock(&self, slug: &str) -> EngineResult<Option<LockInfo>>;

    // --- entropy (process-wide, read-only on the request path) ---
    async fn entropy_peek(&self, limit: usize) -> EngineResult<Vec<EntropyEntry>>;
    async fn entropy_length(&self) -> EngineResult<u64>;
    async fn load_entropy(&self, index: u64) -> EngineResult<EntropyEntry>;

    // --- turn commit (single atomic write set) ---
    /// Apply the commit write set: save state, append transcript lines,
    /// append the changelog line, delete the preview. No partial outcome
    /// may ever be observable.
    async fn apply_commit(&self, slug: &str, commit: &CommitArtifacts) -> EngineResult<LogIndices>;

    // --- snapshots ---
    async fn create_snapshot(
        &self,
        slug: &str,
        save_name: &str,
        save_type: &str,
    ) -> EngineResult<SaveRecord>;
    async fn list_snapshots(&self, slug: &str, limit: usize) -> EngineResult<Vec<SaveRecord>>;
    async fn load_snapshot(&self, slug: &str, save_id: &str) -> EngineResult<SaveRecord>;
    /// Rewrite the captured artifacts (state, logs, docs, character)
    /// back into the live session.
    async fn restore_snapshot(&self, slug: &str, save_id: &str) -> EngineResult<()>;

    // --- characters ---
    /// Session-local copy preferred, shared catalog as fallback.
    async fn load_character(&self, slug: &str) -> EngineResult<Value>;
    /// Writes the session copy; mirrors to the shared catalog when
    /// `persist_shared` is set.
    async fn save_character(
        &self,
        slug: &str,
        character: &Value,
        persist_shared: bool,
    ) -> EngineResult<Value>;

    // --- aux docs ---
    async fn load_doc(&self, slug: &str, kind: DocKind) -> EngineResult<Value>;
    async fn save_doc(&self, slug: &str, kind: DocKind, payload: &Value) -> EngineResult<()>;
}

/// Session slugs double as path components and table keys.
pub fn validate_slug(slug: &str) -> EngineResult<()> {
    let ok = !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(EngineError::schema(
            "invalid slug: use letters, numbers, hyphens, or underscores",
        ))
    }
}

/// Shared tail/cursor pagination over an in-order entry list.
///
/// Without a cursor the last `tail` entries are returned; with one,
/// reading continues after that id. The returned cursor names the last
/// delivered entry and is only present when more entries follow.
pub fn paginate_entries(entries: Vec<LogItem>, tail: Option<usize>, cursor: Option<&str>) -> LogPage {
    let len = entries.len();
    let start = match cursor {
        Some(cursor) => cursor.parse::<usize>().map(|idx| idx + 1).unwrap_or(0),
        None => len.saturating_sub(tail.unwrap_or(len)),
    };
    let end = match tail {
        Some(count) => (start + count).min(len),
        None => len,
    };
    let items: Vec<LogItem> = entries
        .into_iter()
        .skip(start)
        .take(end.saturating_sub(start))
        .collect();
    let cursor = if end < len && end > 0 {
        Some((end - 1).to_string())
    } else {
        None
    };
    LogPage { items, cursor }
}

/// Build the backend selected by configuration.
pub async fn build_storage(settings: &Settings) -> EngineResult<SharedStorage> {
    match settings.backend {
        StorageBackendKind::File => Ok(Arc::new(file::FileStorage::new(settings.clone()))),
        StorageBackendKind::Sqlite => {
            let backend = sqlite::SqliteStorage::connect(settings.clone()).await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<LogItem> {
        (0..n)
            .map(|i| LogItem {
                id: i.to_string(),
                text: format!("line {i}"),
            })
            .collect()
    }

    #[test]
    fn test_validate_slug() {
        assert!(validate_slug("cellar-run_2").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("a/b").is_err());
        assert!(validate_slug("..").is_err());
    }

    #[test]
    fn test_paginate_tail() {
        let page = paginate_entries(items(10), Some(3), None);
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.items[0].id, "7");
        assert!(page.cursor.is_none(), "tail reaches the end");
    }

    #[test]
    fn test_paginate_cursor_walk() {
        let page = paginate_entries(items(10), Some(4), Some("-"));
        // Unparseable cursor restarts from the beginning.
        assert_eq!(page.items[0].id, "0");
        assert_eq!(page.cursor.as_deref(), Some("3"));

        let next = paginate_entries(items(10), Some(4), Some("3"));
        assert_eq!(next.items[0].id, "4");
        assert_eq!(next.cursor.as_deref(), Some("7"));

        let last = paginate_entries(items(10), Some(4), Some("7"));
        assert_eq!(last.items.len(), 2);
        assert!(last.cursor.is_none());
    }

    #[test]
    fn test_paginate_empty() {
        let page = paginate_entries(Vec::new(), Some(5), None);
        assert!(page.items.is_empty());
        assert!(page.cursor.is_none());
    }
}
