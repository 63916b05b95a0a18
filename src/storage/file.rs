//! Filesystem backend.
//!
//! Session tree: `sessions/<slug>/` holding `state.json`, `transcript.md`
//! (one entry per non-blank line), `changelog.md` (one JSON object per
//! line), `turns/<N>.json`, `previews/<id>.json`, `saves/<save_id>.json`,
//! `LOCK`, `character.json`, and one `<kind>.json` per aux doc. The
//! entropy stream lives process-wide at `dice/entropy.ndjson`.
//!
//! Every whole-document write goes through temp-write-then-rename so a
//! crash never leaves a half-written artifact visible. The lock claim
//! uses `create_new` (O_EXCL); the commit write set runs in a fixed
//! order with best-effort reversal on failure.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::config::Settings;
use crate::core::entropy::{self, EntropyEntry};
use crate::core::error::{EngineError, EngineResult};
use crate::core::lock::{self, ClaimDecision, LockInfo};
use crate::core::state::SessionState;

use super::models::{
    CommitArtifacts, DocKind, LogIndices, LogItem, LogPage, Preview, SaveRecord, SessionSummary,
};
use super::{paginate_entries, validate_slug, Storage};

pub struct FileStorage {
    settings: Settings,
}

impl FileStorage {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn session_dir(&self, slug: &str) -> EngineResult<PathBuf> {
        validate_slug(slug)?;
        let path = self.settings.session_path(slug);
        if !path.is_dir() {
            return Err(EngineError::SessionMissing(format!("session '{slug}'")));
        }
        Ok(path)
    }

    fn state_path(&self, slug: &str) -> EngineResult<PathBuf> {
        Ok(self.session_dir(slug)?.join("state.json"))
    }

    fn read_state_value(&self, slug: &str) -> EngineResult<Value> {
        let path = self.state_path(slug)?;
        if !path.exists() {
            return Err(EngineError::SessionMissing(format!("session '{slug}'")));
        }
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(strip_bom(&raw))?)
    }

    fn read_log(&self, slug: &str, file: &str) -> EngineResult<Vec<String>> {
        let path = self.session_dir(slug)?.join(file);
        read_nonblank_lines(&path)
    }

    fn log_items(&self, slug: &str, file: &str) -> EngineResult<Vec<LogItem>> {
        Ok(self
            .read_log(slug, file)?
            .into_iter()
            .enumerate()
            .map(|(idx, text)| LogItem {
                id: idx.to_string(),
                text,
            })
            .collect())
    }

    fn capture_session(&self, slug: &str) -> EngineResult<Value> {
        let state = self.read_state_value(slug)?;
        let transcript = self.read_log(slug, "transcript.md")?;
        let changelog = self.read_log(slug, "changelog.md")?;
        let dir = self.settings.session_path(slug);
        let character_path = dir.join("character.json");
        let character: Option<Value> = if character_path.exists() {
            Some(serde_json::from_str(strip_bom(&fs::read_to_string(
                &character_path,
            )?))?)
        } else {
            None
        };
        let mut docs = serde_json::Map::new();
        for kind in DocKind::ALL {
            let path = dir.join(format!("{}.json", kind.key()));
            if path.exists() {
                let value: Value = serde_json::from_str(strip_bom(&fs::read_to_string(&path)?))?;
                docs.insert(kind.key().to_string(), value);
            }
        }
        Ok(json!({
            "state": state,
            "transcript": transcript,
            "changelog": changelog,
            "character": character,
            "docs": docs,
        }))
    }

    fn turns_dir(&self, slug: &str) -> EngineResult<PathBuf> {
        Ok(self.session_dir(slug)?.join("turns"))
    }

    fn previews_dir(&self, slug: &str) -> EngineResult<PathBuf> {
        Ok(self.session_dir(slug)?.join("previews"))
    }

    fn saves_dir(&self, slug: &str) -> EngineResult<PathBuf> {
        Ok(self.session_dir(slug)?.join("saves"))
    }
}

/// Remove a UTF-8 BOM left behind by external editors.
fn strip_bom(raw: &str) -> &str {
    raw.strip_prefix('\u{feff}').unwrap_or(raw)
}

/// Durable whole-file replacement: write a temp sibling, fsync, rename.
fn atomic_write(path: &Path, contents: &str) -> EngineResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| EngineError::internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4().simple()
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn atomic_write_json(path: &Path, value: &Value) -> EngineResult<()> {
    atomic_write(path, &format!("{}\n", serde_json::to_string_pretty(value)?))
}

fn read_nonblank_lines(path: &Path) -> EngineResult<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .map(|l| l.trim_end().to_string())
        .filter(|l| !l.trim().is_empty())
        .collect())
}

fn append_lines(path: &Path, lines: &[String]) -> EngineResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        let trimmed = line.trim_end();
        // Blank lines are not entries; writing them would skew counts.
        if trimmed.trim().is_empty() {
            continue;
        }
        writeln!(file, "{trimmed}")?;
    }
    file.sync_all()?;
    Ok(())
}

fn file_mtime(path: &Path) -> DateTime<Utc> {
    path.metadata()
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Filesystem-safe save id: `<name>-<timestamp with ':' -> '-'>`.
fn format_save_id(name: &str, created_at: DateTime<Utc>) -> String {
    let stamp = created_at.to_rfc3339().replace(':', "-");
    format!("{name}-{stamp}")
}

#[async_trait]
impl Storage for FileStorage {
    async fn list_sessions(&self) -> EngineResult<Vec<SessionSummary>> {
        let root = self.settings.sessions_path();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        let mut dirs: Vec<PathBuf> = fs::read_dir(&root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        for dir in dirs {
            let slug = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) if !name.starts_with('.') => name.to_string(),
                _ => continue,
            };
            let world = self
                .read_state_value(&slug)
                .ok()
                .and_then(|state| state.get("world").and_then(|w| w.as_str()).map(String::from))
                .unwrap_or_else(|| "default".to_string());
            summaries.push(SessionSummary {
                has_lock: dir.join("LOCK").exists(),
                updated_at: file_mtime(&dir.join("state.json")),
                slug,
                world,
            });
        }
        Ok(summaries)
    }

    async fn create_session(&self, slug: &str, template_slug: &str) -> EngineResult<()> {
        validate_slug(slug)?;
        validate_slug(template_slug)?;
        let dir = self.settings.session_path(slug);
        if dir.exists() {
            return Err(EngineError::conflict("session already exists"));
        }
        let template_dir = self.settings.session_path(template_slug);
        if !template_dir.is_dir() {
            return Err(EngineError::SessionMissing(format!("template session '{template_slug}'")));
        }

        let template_raw = fs::read_to_string(template_dir.join("state.json"))?;
        let mut state: Value = serde_json::from_str(strip_bom(&template_raw))?;
        state["character"] = json!(slug);
        state["turn"] = json!(0);
        state["log_index"] = json!(0);
        let validated = SessionState::validate(&state)?;

        fs::create_dir_all(&dir)?;
        atomic_write_json(&dir.join("state.json"), &validated.to_value()?)?;
        // Fresh transcript: zero entries, so the first commit lands at
        // position 1 on both backends.
        atomic_write(&dir.join("transcript.md"), "")?;
        let init_line = serde_json::to_string(&json!({
            "timestamp": Utc::now().to_rfc3339(),
            "turn": 0,
            "scene_id": "init",
            "summary": "Initialized session state",
            "entropy_indices": [],
            "rolls": [],
        }))?;
        atomic_write(&dir.join("changelog.md"), &format!("{init_line}\n"))?;

        // Carry the template's aux docs; locks, previews, turn records,
        // and saves never clone.
        for kind in DocKind::ALL {
            let source = template_dir.join(format!("{}.json", kind.key()));
            if source.exists() {
                fs::copy(&source, dir.join(format!("{}.json", kind.key())))?;
            }
        }

        // Seed the character from the shared catalog, mirroring back
        // under the new slug.
        let template_character = self
            .settings
            .characters_path()
            .join(format!("{template_slug}.json"));
        let session_character = template_dir.join("character.json");
        let source = if session_character.exists() {
            Some(session_character)
        } else if template_character.exists() {
            Some(template_character)
        } else {
            None
        };
        if let Some(source) = source {
            let mut character: Value = serde_json::from_str(strip_bom(&fs::read_to_string(source)?))?;
            character["slug"] = json!(slug);
            self.save_character(slug, &character, true).await?;
        }
        Ok(())
    }

    async fn load_state(&self, slug: &str) -> EngineResult<SessionState> {
        SessionState::validate(&self.read_state_value(slug)?)
    }

    async fn save_state(&self, slug: &str, state: &SessionState) -> EngineResult<()> {
        let path = self.state_path(slug)?;
        atomic_write_json(&path, &state.to_value()?)
    }

    async fn append_transcript(&self, slug: &str, lines: &[String]) -> EngineResult<u64> {
        let dir = self.session_dir(slug)?;
        append_lines(&dir.join("transcript.md"), lines)?;
        Ok(self.read_log(slug, "transcript.md")?.len() as u64)
    }

    async fn append_changelog(&self, slug: &str, lines: &[String]) -> EngineResult<u64> {
        let dir = self.session_dir(slug)?;
        append_lines(&dir.join("changelog.md"), lines)?;
        Ok(self.read_log(slug, "changelog.md")?.len() as u64)
    }

    async fn load_transcript(
        &self,
        slug: &str,
        tail: Option<usize>,
        cursor: Option<&str>,
    ) -> EngineResult<LogPage> {
        Ok(paginate_entries(
            self.log_items(slug, "transcript.md")?,
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
            self.log_items(slug, "changelog.md")?,
            tail,
            cursor,
        ))
    }

    async fn log_counts(&self, slug: &str) -> EngineResult<LogIndices> {
        Ok(LogIndices {
            transcript: self.read_log(slug, "transcript.md")?.len() as u64,
            changelog: self.read_log(slug, "changelog.md")?.len() as u64,
        })
    }

    async fn persist_turn_record(&self, slug: &str, turn: u64, record: &Value) -> EngineResult<()> {
        let dir = self.turns_dir(slug)?;
        fs::create_dir_all(&dir)?;
        atomic_write_json(&dir.join(format!("{turn}.json")), record)
    }

    async fn load_turn_records(&self, slug: &str, limit: usize) -> EngineResult<Vec<Value>> {
        let dir = self.turns_dir(slug)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut turns: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse().ok())
            })
            .collect();
        turns.sort_unstable_by(|a, b| b.cmp(a));
        let mut records = Vec::new();
        for turn in turns.into_iter().take(limit) {
            let raw = fs::read_to_string(dir.join(format!("{turn}.json")))?;
            records.push(serde_json::from_str(strip_bom(&raw))?);
        }
        Ok(records)
    }

    async fn load_turn_record(&self, slug: &str, turn: u64) -> EngineResult<Value> {
        let path = self.turns_dir(slug)?.join(format!("{turn}.json"));
        if !path.exists() {
            return Err(EngineError::SessionMissing(format!("turn record {turn}")));
        }
        Ok(serde_json::from_str(strip_bom(&fs::read_to_string(path)?))?)
    }

    async fn append_rolls_to_turn(
        &self,
        slug: &str,
        turn: u64,
        roll: &Value,
    ) -> EngineResult<bool> {
        let path = self.turns_dir(slug)?.join(format!("{turn}.json"));
        if !path.exists() {
            return Ok(false);
        }
        let mut record: Value = serde_json::from_str(strip_bom(&fs::read_to_string(&path)?))?;
        let mut rolls: Vec<Value> = record
            .get("rolls")
            .and_then(|r| r.as_array().cloned())
            .unwrap_or_default();
        rolls.push(roll.clone());
        record["rolls"] = Value::Array(rolls);
        atomic_write_json(&path, &record)?;
        Ok(true)
    }

    async fn save_preview(&self, slug: &str, preview: &Preview) -> EngineResult<()> {
        let dir = self.previews_dir(slug)?;
        fs::create_dir_all(&dir)?;
        atomic_write_json(
            &dir.join(format!("{}.json", preview.id)),
            &serde_json::to_value(preview)?,
        )
    }

    async fn load_preview(&self, slug: &str, preview_id: &str) -> EngineResult<Preview> {
        let path = self.previews_dir(slug)?.join(format!("{preview_id}.json"));
        if !path.exists() {
            return Err(EngineError::PreviewMissing);
        }
        let preview: Preview = serde_json::from_str(strip_bom(&fs::read_to_string(path)?))?;
        if preview.slug != slug {
            return Err(EngineError::PreviewMissing);
        }
        Ok(preview)
    }

    async fn delete_preview(&self, slug: &str, preview_id: &str) -> EngineResult<()> {
        let path = self.previews_dir(slug)?.join(format!("{preview_id}.json"));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn sweep_previews(&self, slug: &str, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let dir = self.previews_dir(slug)?;
        if !dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(preview) = serde_json::from_str::<Preview>(strip_bom(&raw)) else {
                continue;
            };
            if preview.created_at < cutoff && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn claim_lock(&self, slug: &str, owner: &str, ttl: u64) -> EngineResult<LockInfo> {
        let path = self.session_dir(slug)?.join("LOCK");
        let existing = self.get_lock(slug).await?;
        let decision = lock::decide_claim(existing.as_ref(), owner, Utc::now())?;
        let info = LockInfo::new(owner, ttl);
        let payload = format!("{}\n", serde_json::to_string(&info)?);
        match decision {
            ClaimDecision::CreateNew => {
                // O_EXCL create: exactly one concurrent claimant wins.
                let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        let current = self.get_lock(slug).await?;
                        return Err(EngineError::LockHeld {
                            owner: current.map(|l| l.owner).unwrap_or_default(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                };
                file.write_all(payload.as_bytes())?;
                file.sync_all()?;
            }
            ClaimDecision::Refresh | ClaimDecision::ReplaceExpired => {
                // Rename replaces the stale lease in one step.
                atomic_write(&path, &payload)?;
            }
        }
        Ok(info)
    }

    async fn release_lock(&self, slug: &str, owner: Option<&str>) -> EngineResult<()> {
        let path = self.session_dir(slug)?.join("LOCK");
        let existing = self.get_lock(slug).await?;
        lock::validate_release(existing.as_ref(), owner)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_lock(&self, slug: &str) -> EngineResult<Option<LockInfo>> {
        let path = self.session_dir(slug)?.join("LOCK");
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let info: LockInfo = serde_json::from_str(strip_bom(&raw))
            .map_err(|_| EngineError::conflict("lock file unreadable"))?;
        Ok(Some(info))
    }

    async fn entropy_peek(&self, limit: usize) -> EngineResult<Vec<EntropyEntry>> {
        entropy::peek(&self.settings.dice_path(), limit)
    }

    async fn entropy_length(&self) -> EngineResult<u64> {
        entropy::stream_length(&self.settings.dice_path())
    }

    async fn load_entropy(&self, index: u64) -> EngineResult<EntropyEntry> {
        entropy::load_entry(&self.settings.dice_path(), index)
    }

    async fn apply_commit(&self, slug: &str, commit: &CommitArtifacts) -> EngineResult<LogIndices> {
        let dir = self.session_dir(slug)?;
        let state_path = dir.join("state.json");
        let transcript_path = dir.join("transcript.md");
        let changelog_path = dir.join("changelog.md");

        // Journal: everything needed to reverse steps already taken.
        let prior_state = fs::read_to_string(&state_path)?;
        let prior_transcript_len = transcript_path.metadata().map(|m| m.len()).unwrap_or(0);
        let prior_changelog_len = changelog_path.metadata().map(|m| m.len()).unwrap_or(0);

        let rollback = |failed: EngineError| -> EngineError {
            if let Err(e) = atomic_write(&state_path, &prior_state) {
                warn!(slug, error = %e, "rollback: state restore failed");
            }
            for (path, len) in [
                (&transcript_path, prior_transcript_len),
                (&changelog_path, prior_changelog_len),
            ] {
                if let Ok(file) = OpenOptions::new().write(true).open(path) {
                    if let Err(e) = file.set_len(len) {
                        warn!(slug, error = %e, "rollback: log truncate failed");
                    }
                }
            }
            failed
        };

        // 1. state
        atomic_write_json(&state_path, &commit.new_state.to_value()?)?;
        // 2. transcript
        if let Err(e) = append_lines(&transcript_path, &commit.transcript_lines) {
            return Err(rollback(e));
        }
        // 3. changelog
        if let Some(line) = &commit.changelog_line {
            if let Err(e) = append_lines(&changelog_path, std::slice::from_ref(line)) {
                return Err(rollback(e));
            }
        }
        // 4. preview
        self.delete_preview(slug, &commit.preview_id).await?;

        self.log_counts(slug).await
    }

    async fn create_snapshot(
        &self,
        slug: &str,
        save_name: &str,
        save_type: &str,
    ) -> EngineResult<SaveRecord> {
        let dir = self.saves_dir(slug)?;
        fs::create_dir_all(&dir)?;
        let created_at = Utc::now();
        let save_id = format_save_id(save_name, created_at);
        let path = dir.join(format!("{save_id}.json"));
        if path.exists() {
            return Err(EngineError::conflict(format!(
                "save '{save_id}' already exists"
            )));
        }
        let record = SaveRecord {
            save_id,
            session_slug: slug.to_string(),
            save_type: save_type.to_string(),
            created_at,
            data: self.capture_session(slug)?,
        };
        atomic_write_json(&path, &serde_json::to_value(&record)?)?;
        Ok(record)
    }

    async fn list_snapshots(&self, slug: &str, limit: usize) -> EngineResult<Vec<SaveRecord>> {
        let dir = self.saves_dir(slug)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut saves: Vec<SaveRecord> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(record) = serde_json::from_str::<SaveRecord>(strip_bom(&raw)) {
                saves.push(record);
            }
        }
        saves.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        saves.truncate(limit);
        Ok(saves)
    }

    async fn load_snapshot(&self, slug: &str, save_id: &str) -> EngineResult<SaveRecord> {
        let path = self.saves_dir(slug)?.join(format!("{save_id}.json"));
        if !path.exists() {
            return Err(EngineError::SessionMissing(format!("save '{save_id}'")));
        }
        Ok(serde_json::from_str(strip_bom(&fs::read_to_string(path)?))?)
    }

    async fn restore_snapshot(&self, slug: &str, save_id: &str) -> EngineResult<()> {
        let record = self.load_snapshot(slug, save_id).await?;
        let dir = self.session_dir(slug)?;
        let data = &record.data;

        let state = data
            .get("state")
            .ok_or_else(|| EngineError::internal("snapshot missing state"))?;
        let validated = SessionState::validate(state)?;
        atomic_write_json(&dir.join("state.json"), &validated.to_value()?)?;

        for (key, file) in [("transcript", "transcript.md"), ("changelog", "changelog.md")] {
            let lines: Vec<String> = data
                .get(key)
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            let mut body = lines.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            atomic_write(&dir.join(file), &body)?;
        }

        if let Some(character) = data.get("character").filter(|c| !c.is_null()) {
            atomic_write_json(&dir.join("character.json"), character)?;
        }
        if let Some(docs) = data.get("docs").and_then(|d| d.as_object()) {
            for (key, value) in docs {
                if DocKind::from_key(key).is_some() {
                    atomic_write_json(&dir.join(format!("{key}.json")), value)?;
                }
            }
        }
        Ok(())
    }

    async fn load_character(&self, slug: &str) -> EngineResult<Value> {
        validate_slug(slug)?;
        let session_copy = self.settings.session_path(slug).join("character.json");
        let catalog_copy = self.settings.characters_path().join(format!("{slug}.json"));
        let path = if session_copy.exists() {
            session_copy
        } else if catalog_copy.exists() {
            catalog_copy
        } else {
            return Err(EngineError::SessionMissing(format!("character '{slug}'")));
        };
        Ok(serde_json::from_str(strip_bom(&fs::read_to_string(path)?))?)
    }

    async fn save_character(
        &self,
        slug: &str,
        character: &Value,
        persist_shared: bool,
    ) -> EngineResult<Value> {
        let dir = self.session_dir(slug)?;
        let mut payload = character.clone();
        payload["slug"] = json!(slug);
        atomic_write_json(&dir.join("character.json"), &payload)?;
        if persist_shared {
            let catalog = self.settings.characters_path();
            fs::create_dir_all(&catalog)?;
            atomic_write_json(&catalog.join(format!("{slug}.json")), &payload)?;
        }
        Ok(payload)
    }

    async fn load_doc(&self, slug: &str, kind: DocKind) -> EngineResult<Value> {
        let path = self.session_dir(slug)?.join(format!("{}.json", kind.key()));
        if !path.exists() {
            return Ok(kind.empty_value());
        }
        Ok(serde_json::from_str(strip_bom(&fs::read_to_string(path)?))?)
    }

    async fn save_doc(&self, slug: &str, kind: DocKind, payload: &Value) -> EngineResult<()> {
        let path = self.session_dir(slug)?.join(format!("{}.json", kind.key()));
        atomic_write_json(&path, payload)
    }
}
