//! SQLite backend.
//!
//! Schema and migrations follow the versioned const-SQL pattern; every
//! multi-artifact write runs inside one transaction, so the commit write
//! set and snapshot restore are atomic by construction. The entropy
//! stream stays authoritative in `dice/entropy.ndjson` and is mirrored
//! into the `entropy` table on demand, which keeps operator extensions
//! visible without a restart.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{info, warn};

use crate::config::Settings;
use crate::core::entropy::{self, EntropyEntry};
use crate::core::error::{EngineError, EngineResult};
use crate::core::lock::{self, ClaimDecision, LockInfo};
use crate::core::state::SessionState;

use super::models::{
    CommitArtifacts, DocKind, LogIndices, LogItem, LogPage, Preview, SaveRecord, SessionSummary,
};
use super::{paginate_entries, validate_slug, Storage};

/// Sentinel `session_id` for shared-catalog character rows.
const SHARED_SESSION_ID: i64 = 0;

/// Current database schema version.
const SCHEMA_VERSION: i32 = 2;

pub struct SqliteStorage {
    pool: SqlitePool,
    settings: Settings,
}

impl SqliteStorage {
    /// Open (creating if missing), migrate, and seed entropy.
    pub async fn connect(settings: Settings) -> EngineResult<Self> {
        let path = settings.sqlite_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| EngineError::internal(format!("bad sqlite path: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        run_migrations(&pool).await?;
        let storage = Self { pool, settings };
        storage.seed_entropy(None).await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn session_id(&self, slug: &str) -> EngineResult<i64> {
        validate_slug(slug)?;
        let row = sqlx::query("SELECT id FROM sessions WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.get::<i64, _>("id"))
            .ok_or_else(|| EngineError::SessionMissing(format!("session '{slug}'")))
    }

    /// Mirror the ndjson stream into the entropy table, stopping early
    /// once `target` is reached.
    async fn seed_entropy(&self, target: Option<u64>) -> EngineResult<u64> {
        let dice_path = self.settings.dice_path();
        if !dice_path.exists() {
            return Ok(0);
        }
        let entries = entropy::read_stream(&dice_path)?;
        let mut highest = 0;
        for entry in &entries {
            sqlx::query("INSERT OR IGNORE INTO entropy (entropy_index, entropy_json) VALUES (?, ?)")
                .bind(entry.i as i64)
                .bind(serde_json::to_string(entry)?)
                .execute(&self.pool)
                .await?;
            highest = entry.i;
            if let Some(target) = target {
                if highest >= target {
                    break;
                }
            }
        }
        Ok(highest)
    }

    async fn stored_entropy_length(&self) -> EngineResult<u64> {
        let row = sqlx::query("SELECT MAX(entropy_index) AS max_idx FROM entropy")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("max_idx").unwrap_or(0) as u64)
    }

    async fn log_items(&self, slug: &str, kind: &str) -> EngineResult<Vec<LogItem>> {
        let session_id = self.session_id(slug).await?;
        let rows = sqlx::query(
            "SELECT position, content FROM text_entries \
             WHERE session_id = ? AND kind = ? ORDER BY position ASC",
        )
        .bind(session_id)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| LogItem {
                // Positions are dense from 1; readers see 0-based ids so
                // cursors match the filesystem backend byte for byte.
                id: (row.get::<i64, _>("position") - 1).to_string(),
                text: row.get("content"),
            })
            .collect())
    }

    async fn capture_session(&self, slug: &str) -> EngineResult<Value> {
        let state = self.load_state(slug).await?.to_value()?;
        let transcript: Vec<String> = self
            .log_items(slug, "transcript")
            .await?
            .into_iter()
            .map(|item| item.text)
            .collect();
        let changelog: Vec<String> = self
            .log_items(slug, "changelog")
            .await?
            .into_iter()
            .map(|item| item.text)
            .collect();
        let character = self.load_character(slug).await.ok();
        let session_id = self.session_id(slug).await?;
        let rows = sqlx::query("SELECT kind, payload_json FROM session_docs WHERE session_id = ?")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        let mut docs = serde_json::Map::new();
        for row in rows {
            let kind: String = row.get("kind");
            let payload: Value = serde_json::from_str(row.get("payload_json"))?;
            docs.insert(kind, payload);
        }
        Ok(json!({
            "state": state,
            "transcript": transcript,
            "changelog": changelog,
            "character": character,
            "docs": docs,
        }))
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Next dense position for a log inside an open transaction.
async fn next_position(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: i64,
    kind: &str,
) -> EngineResult<i64> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(position), 0) AS last FROM text_entries \
         WHERE session_id = ? AND kind = ?",
    )
    .bind(session_id)
    .bind(kind)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.get::<i64, _>("last") + 1)
}

async fn insert_lines(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: i64,
    kind: &str,
    lines: &[String],
) -> EngineResult<i64> {
    let mut position = next_position(tx, session_id, kind).await? - 1;
    for line in lines {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            continue;
        }
        position += 1;
        sqlx::query(
            "INSERT INTO text_entries (session_id, kind, position, content, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(kind)
        .bind(position)
        .bind(trimmed)
        .bind(now_rfc3339())
        .execute(&mut **tx)
        .await?;
    }
    Ok(position)
}

async fn write_state(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: i64,
    state: &SessionState,
) -> EngineResult<()> {
    let now = now_rfc3339();
    sqlx::query(
        "UPDATE session_state SET state_json = ?, turn_number = ?, log_index = ?, updated_at = ? \
         WHERE session_id = ?",
    )
    .bind(serde_json::to_string(&state.to_value()?)?)
    .bind(state.turn as i64)
    .bind(state.log_index as i64)
    .bind(&now)
    .bind(session_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
        .bind(&now)
        .bind(session_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn lock_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: i64,
) -> EngineResult<Option<LockInfo>> {
    let row = sqlx::query(
        "SELECT owner, ttl_seconds, acquired_at FROM locks WHERE session_id = ?",
    )
    .bind(session_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|row| LockInfo {
        owner: row.get("owner"),
        ttl: row.get::<i64, _>("ttl_seconds") as u64,
        acquired_at: parse_timestamp(row.get("acquired_at")),
    }))
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn list_sessions(&self) -> EngineResult<Vec<SessionSummary>> {
        let rows = sqlx::query(
            "SELECT s.slug, s.world, s.updated_at, \
                    (SELECT COUNT(*) FROM locks l WHERE l.session_id = s.id) AS lock_count \
             FROM sessions s ORDER BY s.slug ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| SessionSummary {
                slug: row.get("slug"),
                world: row.get("world"),
                has_lock: row.get::<i64, _>("lock_count") > 0,
                updated_at: parse_timestamp(row.get("updated_at")),
            })
            .collect())
    }

    async fn create_session(&self, slug: &str, template_slug: &str) -> EngineResult<()> {
        validate_slug(slug)?;
        validate_slug(template_slug)?;
        let existing = sqlx::query("SELECT 1 FROM sessions WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(EngineError::conflict("session already exists"));
        }

        // The template may live in the database or, for a fresh install,
        // only on disk under sessions/<template>/state.json.
        let template_id = self.session_id(template_slug).await.ok();
        let (mut state_value, template_docs) = match template_id {
            Some(_) => {
                let state = self.load_state(template_slug).await?.to_value()?;
                let id = self.session_id(template_slug).await?;
                let rows =
                    sqlx::query("SELECT kind, payload_json FROM session_docs WHERE session_id = ?")
                        .bind(id)
                        .fetch_all(&self.pool)
                        .await?;
                let docs: Vec<(String, String)> = rows
                    .into_iter()
                    .map(|row| (row.get("kind"), row.get("payload_json")))
                    .collect();
                (state, docs)
            }
            None => {
                let path = self
                    .settings
                    .session_path(template_slug)
                    .join("state.json");
                if !path.exists() {
                    return Err(EngineError::SessionMissing(format!(
                        "template session '{template_slug}'"
                    )));
                }
                let raw = std::fs::read_to_string(path)?;
                (serde_json::from_str(raw.trim_start_matches('\u{feff}'))?, Vec::new())
            }
        };

        state_value["character"] = json!(slug);
        state_value["turn"] = json!(0);
        state_value["log_index"] = json!(0);
        let validated = SessionState::validate(&state_value)?;
        let world = validated.world_name().to_string();

        let now = now_rfc3339();
        let init_line = serde_json::to_string(&json!({
            "timestamp": now,
            "turn": 0,
            "scene_id": "init",
            "summary": "Initialized session state",
            "entropy_indices": [],
            "rolls": [],
        }))?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO sessions (slug, world, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(slug)
        .bind(&world)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        let session_id = result.last_insert_rowid();
        sqlx::query(
            "INSERT INTO session_state (session_id, state_json, turn_number, log_index, updated_at) \
             VALUES (?, ?, 0, 0, ?)",
        )
        .bind(session_id)
        .bind(serde_json::to_string(&validated.to_value()?)?)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO text_entries (session_id, kind, position, content, created_at) \
             VALUES (?, 'changelog', 1, ?, ?)",
        )
        .bind(session_id)
        .bind(&init_line)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        for (kind, payload) in template_docs {
            sqlx::query(
                "INSERT INTO session_docs (session_id, kind, payload_json, updated_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(session_id)
            .bind(kind)
            .bind(payload)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        // Seed the character from the shared catalog under the new slug.
        let template_character = self.load_character(template_slug).await.ok();
        if let Some(mut character) = template_character {
            character["slug"] = json!(slug);
            self.save_character(slug, &character, true).await?;
        }
        Ok(())
    }

    async fn load_state(&self, slug: &str) -> EngineResult<SessionState> {
        let session_id = self.session_id(slug).await?;
        let row = sqlx::query("SELECT state_json FROM session_state WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::SessionMissing(format!("state for '{slug}'")))?;
        let value: Value = serde_json::from_str(row.get("state_json"))?;
        SessionState::validate(&value)
    }

    async fn save_state(&self, slug: &str, state: &SessionState) -> EngineResult<()> {
        let session_id = self.session_id(slug).await?;
        let mut tx = self.pool.begin().await?;
        write_state(&mut tx, session_id, state).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_transcript(&self, slug: &str, lines: &[String]) -> EngineResult<u64> {
        let session_id = self.session_id(slug).await?;
        let mut tx = self.pool.begin().await?;
        let last = insert_lines(&mut tx, session_id, "transcript", lines).await?;
        tx.commit().await?;
        Ok(last as u64)
    }

    async fn append_changelog(&self, slug: &str, lines: &[String]) -> EngineResult<u64> {
        let session_id = self.session_id(slug).await?;
        let mut tx = self.pool.begin().await?;
        let last = insert_lines(&mut tx, session_id, "changelog", lines).await?;
        tx.commit().await?;
        Ok(last as u64)
    }

    async fn load_transcript(
        &self,
        slug: &str,
        tail: Option<usize>,
        cursor: Option<&str>,
    ) -> EngineResult<LogPage> {
        Ok(paginate_entries(
            self.log_items(slug, "transcript").await?,
            tail,
            cursor,
        ))
    }

    async fn load_changelog(
        &self,
        slug: &str,
        tail: Option<usize>,
        cursor: Option<&str>,
    ) -> EngineResult<LogPage> {
        Ok(paginate_entries(
            self.log_items(slug, "changelog").await?,
            tail,
            cursor,
        ))
    }

    async fn log_counts(&self, slug: &str) -> EngineResult<LogIndices> {
        let session_id = self.session_id(slug).await?;
        let row = sqlx::query(
            "SELECT \
               COALESCE(MAX(CASE WHEN kind = 'transcript' THEN position END), 0) AS transcript, \
               COALESCE(MAX(CASE WHEN kind = 'changelog' THEN position END), 0) AS changelog \
             FROM text_entries WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(LogIndices {
            transcript: row.get::<i64, _>("transcript") as u64,
            changelog: row.get::<i64, _>("changelog") as u64,
        })
    }

    async fn persist_turn_record(&self, slug: &str, turn: u64, record: &Value) -> EngineResult<()> {
        let session_id = self.session_id(slug).await?;
        sqlx::query(
            "INSERT INTO turns (session_id, turn_number, turn_record_json, created_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(session_id, turn_number) DO UPDATE \
             SET turn_record_json = excluded.turn_record_json, created_at = excluded.created_at",
        )
        .bind(session_id)
        .bind(turn as i64)
        .bind(serde_json::to_string(record)?)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_turn_records(&self, slug: &str, limit: usize) -> EngineResult<Vec<Value>> {
        let session_id = self.session_id(slug).await?;
        let rows = sqlx::query(
            "SELECT turn_record_json FROM turns WHERE session_id = ? \
             ORDER BY turn_number DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(serde_json::from_str(row.get("turn_record_json"))?);
        }
        Ok(records)
    }

    async fn load_turn_record(&self, slug: &str, turn: u64) -> EngineResult<Value> {
        let session_id = self.session_id(slug).await?;
        let row = sqlx::query(
            "SELECT turn_record_json FROM turns WHERE session_id = ? AND turn_number = ?",
        )
        .bind(session_id)
        .bind(turn as i64)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::SessionMissing(format!("turn record {turn}")))?;
        Ok(serde_json::from_str(row.get("turn_record_json"))?)
    }

    async fn append_rolls_to_turn(
        &self,
        slug: &str,
        turn: u64,
        roll: &Value,
    ) -> EngineResult<bool> {
        let session_id = self.session_id(slug).await?;
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT turn_record_json FROM turns WHERE session_id = ? AND turn_number = ?",
        )
        .bind(session_id)
        .bind(turn as i64)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut record: Value = serde_json::from_str(row.get("turn_record_json"))?;
        let mut rolls: Vec<Value> = record
            .get("rolls")
            .and_then(|r| r.as_array().cloned())
            .unwrap_or_default();
        rolls.push(roll.clone());
        record["rolls"] = Value::Array(rolls);
        sqlx::query(
            "UPDATE turns SET turn_record_json = ? WHERE session_id = ? AND turn_number = ?",
        )
        .bind(serde_json::to_string(&record)?)
        .bind(session_id)
        .bind(turn as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn save_preview(&self, slug: &str, preview: &Preview) -> EngineResult<()> {
        let session_id = self.session_id(slug).await?;
        sqlx::query(
            "INSERT INTO previews (session_id, preview_id, payload_json, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(&preview.id)
        .bind(serde_json::to_string(preview)?)
        .bind(preview.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_preview(&self, slug: &str, preview_id: &str) -> EngineResult<Preview> {
        let session_id = self.session_id(slug).await?;
        let row = sqlx::query(
            "SELECT payload_json FROM previews WHERE session_id = ? AND preview_id = ?",
        )
        .bind(session_id)
        .bind(preview_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::PreviewMissing)?;
        let preview: Preview = serde_json::from_str(row.get("payload_json"))?;
        if preview.slug != slug {
            return Err(EngineError::PreviewMissing);
        }
        Ok(preview)
    }

    async fn delete_preview(&self, slug: &str, preview_id: &str) -> EngineResult<()> {
        let session_id = self.session_id(slug).await?;
        sqlx::query("DELETE FROM previews WHERE session_id = ? AND preview_id = ?")
            .bind(session_id)
            .bind(preview_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_previews(&self, slug: &str, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let session_id = self.session_id(slug).await?;
        let result = sqlx::query("DELETE FROM previews WHERE session_id = ? AND created_at < ?")
            .bind(session_id)
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn claim_lock(&self, slug: &str, owner: &str, ttl: u64) -> EngineResult<LockInfo> {
        let session_id = self.session_id(slug).await?;
        let info = LockInfo::new(owner, ttl);

        // Fast path: conditional insert decides races at the database.
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO locks (session_id, owner, ttl_seconds, acquired_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(owner)
        .bind(ttl as i64)
        .bind(info.acquired_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(info);
        }

        let mut tx = self.pool.begin().await?;
        let existing = lock_row(&mut tx, session_id).await?;
        match lock::decide_claim(existing.as_ref(), owner, Utc::now())? {
            ClaimDecision::CreateNew => {
                // The holder vanished between insert and read; retry the
                // insert inside the transaction.
                sqlx::query(
                    "INSERT INTO locks (session_id, owner, ttl_seconds, acquired_at) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(session_id)
                .bind(owner)
                .bind(ttl as i64)
                .bind(info.acquired_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
            }
            ClaimDecision::Refresh | ClaimDecision::ReplaceExpired => {
                let previous = existing.expect("decision implies a row");
                let updated = sqlx::query(
                    "UPDATE locks SET owner = ?, ttl_seconds = ?, acquired_at = ? \
                     WHERE session_id = ? AND owner = ? AND acquired_at = ?",
                )
                .bind(owner)
                .bind(ttl as i64)
                .bind(info.acquired_at.to_rfc3339())
                .bind(session_id)
                .bind(&previous.owner)
                .bind(previous.acquired_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() != 1 {
                    // Someone else replaced the lease first.
                    let current = lock_row(&mut tx, session_id).await?;
                    return Err(EngineError::LockHeld {
                        owner: current.map(|l| l.owner).unwrap_or_default(),
                    });
                }
            }
        }
        tx.commit().await?;
        Ok(info)
    }

    async fn release_lock(&self, slug: &str, owner: Option<&str>) -> EngineResult<()> {
        let session_id = self.session_id(slug).await?;
        let existing = self.get_lock(slug).await?;
        lock::validate_release(existing.as_ref(), owner)?;
        sqlx::query("DELETE FROM locks WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_lock(&self, slug: &str) -> EngineResult<Option<LockInfo>> {
        let session_id = self.session_id(slug).await?;
        let row = sqlx::query(
            "SELECT owner, ttl_seconds, acquired_at FROM locks WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| LockInfo {
            owner: row.get("owner"),
            ttl: row.get::<i64, _>("ttl_seconds") as u64,
            acquired_at: parse_timestamp(row.get("acquired_at")),
        }))
    }

    async fn entropy_peek(&self, limit: usize) -> EngineResult<Vec<EntropyEntry>> {
        self.seed_entropy(None).await?;
        let rows = sqlx::query(
            "SELECT entropy_json FROM entropy ORDER BY entropy_index ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(serde_json::from_str(row.get("entropy_json"))?);
        }
        Ok(entries)
    }

    async fn entropy_length(&self) -> EngineResult<u64> {
        let stored = self.stored_entropy_length().await?;
        // The file may have been extended by the operator tool.
        let seeded = self.seed_entropy(None).await?;
        Ok(stored.max(seeded))
    }

    async fn load_entropy(&self, index: u64) -> EngineResult<EntropyEntry> {
        let row = sqlx::query("SELECT entropy_json FROM entropy WHERE entropy_index = ?")
            .bind(index as i64)
            .fetch_optional(&self.pool)
            .await?;
        let row = match row {
            Some(row) => row,
            None => {
                self.seed_entropy(Some(index)).await?;
                sqlx::query("SELECT entropy_json FROM entropy WHERE entropy_index = ?")
                    .bind(index as i64)
                    .fetch_optional(&self.pool)
                    .await?
                    .ok_or(EngineError::EntropyMissing(index))?
            }
        };
        Ok(serde_json::from_str(row.get("entropy_json"))?)
    }

    async fn apply_commit(&self, slug: &str, commit: &CommitArtifacts) -> EngineResult<LogIndices> {
        let session_id = self.session_id(slug).await?;
        let mut tx = self.pool.begin().await?;

        // Lock validation rides inside the same transaction as the
        // writes it protects.
        let held = lock_row(&mut tx, session_id).await?;
        lock::require_lock(held.as_ref(), commit.lock_owner.as_deref())?;

        write_state(&mut tx, session_id, &commit.new_state).await?;
        insert_lines(&mut tx, session_id, "transcript", &commit.transcript_lines).await?;
        if let Some(line) = &commit.changelog_line {
            insert_lines(&mut tx, session_id, "changelog", std::slice::from_ref(line)).await?;
        }
        sqlx::query("DELETE FROM previews WHERE session_id = ? AND preview_id = ?")
            .bind(session_id)
            .bind(&commit.preview_id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            "SELECT \
               COALESCE(MAX(CASE WHEN kind = 'transcript' THEN position END), 0) AS transcript, \
               COALESCE(MAX(CASE WHEN kind = 'changelog' THEN position END), 0) AS changelog \
             FROM text_entries WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;
        let indices = LogIndices {
            transcript: row.get::<i64, _>("transcript") as u64,
            changelog: row.get::<i64, _>("changelog") as u64,
        };
        tx.commit().await?;
        Ok(indices)
    }

    async fn create_snapshot(
        &self,
        slug: &str,
        save_name: &str,
        save_type: &str,
    ) -> EngineResult<SaveRecord> {
        let session_id = self.session_id(slug).await?;
        let created_at = Utc::now();
        let save_id = format!(
            "{save_name}-{}",
            created_at.to_rfc3339().replace(':', "-")
        );
        let record = SaveRecord {
            save_id: save_id.clone(),
            session_slug: slug.to_string(),
            save_type: save_type.to_string(),
            created_at,
            data: self.capture_session(slug).await?,
        };
        let result = sqlx::query(
            "INSERT OR IGNORE INTO snapshots (session_id, save_id, save_type, snapshot_json, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(&save_id)
        .bind(save_type)
        .bind(serde_json::to_string(&record)?)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::conflict(format!(
                "save '{save_id}' already exists"
            )));
        }
        Ok(record)
    }

    async fn list_snapshots(&self, slug: &str, limit: usize) -> EngineResult<Vec<SaveRecord>> {
        let session_id = self.session_id(slug).await?;
        let rows = sqlx::query(
            "SELECT snapshot_json FROM snapshots WHERE session_id = ? \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut saves = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_str(row.get("snapshot_json")) {
                Ok(record) => saves.push(record),
                Err(e) => warn!(slug, error = %e, "skipping unreadable snapshot"),
            }
        }
        Ok(saves)
    }

    async fn load_snapshot(&self, slug: &str, save_id: &str) -> EngineResult<SaveRecord> {
        let session_id = self.session_id(slug).await?;
        let row = sqlx::query(
            "SELECT snapshot_json FROM snapshots WHERE session_id = ? AND save_id = ?",
        )
        .bind(session_id)
        .bind(save_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::SessionMissing(format!("save '{save_id}'")))?;
        Ok(serde_json::from_str(row.get("snapshot_json"))?)
    }

    async fn restore_snapshot(&self, slug: &str, save_id: &str) -> EngineResult<()> {
        let record = self.load_snapshot(slug, save_id).await?;
        let session_id = self.session_id(slug).await?;
        let data = &record.data;
        let state = data
            .get("state")
            .ok_or_else(|| EngineError::internal("snapshot missing state"))?;
        let validated = SessionState::validate(state)?;

        let mut tx = self.pool.begin().await?;
        write_state(&mut tx, session_id, &validated).await?;
        for (key, kind) in [("transcript", "transcript"), ("changelog", "changelog")] {
            sqlx::query("DELETE FROM text_entries WHERE session_id = ? AND kind = ?")
                .bind(session_id)
                .bind(kind)
                .execute(&mut *tx)
                .await?;
            let lines: Vec<String> = data
                .get(key)
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            insert_lines(&mut tx, session_id, kind, &lines).await?;
        }
        if let Some(docs) = data.get("docs").and_then(|d| d.as_object()) {
            for (kind, payload) in docs {
                if DocKind::from_key(kind).is_none() {
                    continue;
                }
                sqlx::query(
                    "INSERT INTO session_docs (session_id, kind, payload_json, updated_at) \
                     VALUES (?, ?, ?, ?) \
                     ON CONFLICT(session_id, kind) DO UPDATE \
                     SET payload_json = excluded.payload_json, updated_at = excluded.updated_at",
                )
                .bind(session_id)
                .bind(kind)
                .bind(serde_json::to_string(payload)?)
                .bind(now_rfc3339())
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        if let Some(character) = data.get("character").filter(|c| !c.is_null()) {
            self.save_character(slug, character, false).await?;
        }
        info!(slug, save_id, "session restored from snapshot");
        Ok(())
    }

    async fn load_character(&self, slug: &str) -> EngineResult<Value> {
        validate_slug(slug)?;
        let session_id = self.session_id(slug).await.ok();
        if let Some(session_id) = session_id {
            let row = sqlx::query(
                "SELECT character_json FROM characters WHERE session_id = ? AND slug = ?",
            )
            .bind(session_id)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                return Ok(serde_json::from_str(row.get("character_json"))?);
            }
        }
        let row = sqlx::query(
            "SELECT character_json FROM characters WHERE session_id = ? AND slug = ?",
        )
        .bind(SHARED_SESSION_ID)
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(serde_json::from_str(row.get("character_json"))?);
        }
        // Fall back to the on-disk catalog used for first-run templates.
        let path = self.settings.characters_path().join(format!("{slug}.json"));
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            return Ok(serde_json::from_str(raw.trim_start_matches('\u{feff}'))?);
        }
        Err(EngineError::SessionMissing(format!("character '{slug}'")))
    }

    async fn save_character(
        &self,
        slug: &str,
        character: &Value,
        persist_shared: bool,
    ) -> EngineResult<Value> {
        let session_id = self.session_id(slug).await?;
        let mut payload = character.clone();
        payload["slug"] = json!(slug);
        let raw = serde_json::to_string(&payload)?;
        let now = now_rfc3339();

        let mut tx = self.pool.begin().await?;
        let upsert = "INSERT INTO characters \
             (session_id, slug, character_json, is_shared, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(session_id, slug) DO UPDATE \
             SET character_json = excluded.character_json, updated_at = excluded.updated_at";
        sqlx::query(upsert)
            .bind(session_id)
            .bind(slug)
            .bind(&raw)
            .bind(0)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        if persist_shared {
            sqlx::query(upsert)
                .bind(SHARED_SESSION_ID)
                .bind(slug)
                .bind(&raw)
                .bind(1)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(payload)
    }

    async fn load_doc(&self, slug: &str, kind: DocKind) -> EngineResult<Value> {
        let session_id = self.session_id(slug).await?;
        let row = sqlx::query(
            "SELECT payload_json FROM session_docs WHERE session_id = ? AND kind = ?",
        )
        .bind(session_id)
        .bind(kind.key())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(serde_json::from_str(row.get("payload_json"))?),
            None => Ok(kind.empty_value()),
        }
    }

    async fn save_doc(&self, slug: &str, kind: DocKind, payload: &Value) -> EngineResult<()> {
        let session_id = self.session_id(slug).await?;
        sqlx::query(
            "INSERT INTO session_docs (session_id, kind, payload_json, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(session_id, kind) DO UPDATE \
             SET payload_json = excluded.payload_json, updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(kind.key())
        .bind(serde_json::to_string(payload)?)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Run all pending migrations.
pub async fn run_migrations(pool: &SqlitePool) -> EngineResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations ( \
             version INTEGER PRIMARY KEY, \
             name TEXT NOT NULL, \
             applied_at TEXT NOT NULL DEFAULT (datetime('now')) \
         )",
    )
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT MAX(version) AS version FROM _migrations")
        .fetch_one(pool)
        .await?;
    let current: i32 = row.try_get::<i32, _>("version").unwrap_or(0);

    if current < SCHEMA_VERSION {
        info!(current, target = SCHEMA_VERSION, "running database migrations");
        for version in (current + 1)..=SCHEMA_VERSION {
            run_migration(pool, version).await?;
        }
    }
    Ok(())
}

async fn run_migration(pool: &SqlitePool, version: i32) -> EngineResult<()> {
    let (name, sql) = match version {
        1 => ("session_core", MIGRATION_V1),
        2 => ("snapshots_and_docs", MIGRATION_V2),
        _ => {
            warn!(version, "unknown migration version");
            return Ok(());
        }
    };
    info!(version, name, "applying migration");
    for statement in sql.split(';').filter(|s| !s.trim().is_empty()) {
        sqlx::query(statement.trim()).execute(pool).await?;
    }
    sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

/// Migration v1: sessions, state, logs, turns, previews, locks, entropy,
/// characters.
const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT UNIQUE NOT NULL,
    world TEXT NOT NULL DEFAULT 'default',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_state (
    session_id INTEGER PRIMARY KEY,
    state_json TEXT NOT NULL,
    turn_number INTEGER NOT NULL,
    log_index INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS text_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('transcript', 'changelog')),
    position INTEGER NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, kind, position),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    turn_number INTEGER NOT NULL,
    turn_record_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, turn_number),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS previews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    preview_id TEXT UNIQUE NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS locks (
    session_id INTEGER PRIMARY KEY,
    owner TEXT NOT NULL,
    ttl_seconds INTEGER NOT NULL,
    acquired_at TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS entropy (
    entropy_index INTEGER PRIMARY KEY,
    entropy_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS characters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    slug TEXT NOT NULL,
    character_json TEXT NOT NULL,
    is_shared INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(session_id, slug)
);

CREATE INDEX IF NOT EXISTS idx_text_entries_session ON text_entries(session_id, kind, position);
CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, turn_number);
"#;

/// Migration v2: snapshots and per-session docs.
const MIGRATION_V2: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    save_id TEXT NOT NULL,
    save_type TEXT NOT NULL,
    snapshot_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, save_id),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS session_docs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(session_id, kind),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_snapshots_session ON snapshots(session_id, created_at DESC);
"#;
