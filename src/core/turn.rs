//! Turn engine: the preview/commit protocol.
//!
//! A turn splits into two phases separated by human and narrator
//! latency. Preview witnesses the state (base turn + stable hash),
//! validates the patch, and reserves the next contiguous entropy
//! indices without side effects. Commit revalidates the witness,
//! resolves the reserved dice, and applies the whole write set
//! atomically. Any interleaved writer, including an out-of-band roll,
//! changes the hash and parks the preview as stale.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::storage::{CommitArtifacts, DocKind, LogIndices, Preview, SharedStorage};

use super::dice::{resolve_expression, DiceExpression, ResolvedRoll};
use super::error::{EngineError, EngineResult};
use super::events::{LogDelta, RollsDelta, UpdateBus, UpdateEvent};
use super::lock::require_lock;
use super::llm::LlmClient;
use super::narration::{self, DmNarration, TurnRecord};
use super::state::{self, apply_patch, stable_hash, DiffEntry, SessionState};

/// Inputs to the preview phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreviewRequest {
    /// Proposed narration text; doubles as the transcript entry when no
    /// explicit one is given.
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub state_patch: Value,
    #[serde(default)]
    pub transcript_entry: Option<String>,
    #[serde(default)]
    pub changelog_entry: Option<Value>,
    #[serde(default)]
    pub dice_expressions: Vec<String>,
    #[serde(default)]
    pub lock_owner: Option<String>,
}

/// The reservation plan returned by preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntropyPlan {
    pub indices: Vec<u64>,
    pub usage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewOutcome {
    pub id: String,
    pub diffs: Vec<DiffEntry>,
    pub entropy_plan: EntropyPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub state: SessionState,
    pub log_indices: LogIndices,
    pub rolls: Vec<ResolvedRoll>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitAndNarrateOutcome {
    pub commit: CommitOutcome,
    pub dm: DmNarration,
    pub turn_record: TurnRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<std::collections::HashMap<String, u64>>,
}

/// Preview + commit state machine over a storage backend.
#[derive(Clone)]
pub struct TurnEngine {
    storage: SharedStorage,
    bus: UpdateBus,
    settings: Settings,
}

impl TurnEngine {
    pub fn new(storage: SharedStorage, bus: UpdateBus, settings: Settings) -> Self {
        Self {
            storage,
            bus,
            settings,
        }
    }

    /// Preview phase: witness, validate, reserve. Never
    /// mutates state, logs, or the entropy cursor.
    pub async fn preview(&self, slug: &str, request: PreviewRequest) -> EngineResult<PreviewOutcome> {
        let lock = self.storage.get_lock(slug).await?;
        require_lock(lock.as_ref(), request.lock_owner.as_deref())?;

        // Expressions must parse before anything is reserved for them.
        for expr in &request.dice_expressions {
            DiceExpression::parse(expr)?;
        }

        let current = self.storage.load_state(slug).await?;
        let base_value = current.to_value()?;
        let base_hash = stable_hash(&base_value);

        let proposed = apply_patch(&base_value, &request.state_patch)?;
        SessionState::validate(&proposed)?;

        let count = request.dice_expressions.len() as u64;
        let reserved_indices: Vec<u64> =
            (current.log_index + 1..=current.log_index + count).collect();
        if let Some(&last) = reserved_indices.last() {
            let have = self.storage.entropy_length().await?;
            super::entropy::ensure_available(have, last)?;
        }

        let diffs = state::diff_leaf_paths(&base_value, &proposed);

        // Opportunistic GC keeps abandoned reservations from piling up.
        let cutoff = Utc::now() - Duration::seconds(self.settings.preview_max_age_secs);
        let swept = self.storage.sweep_previews(slug, cutoff).await?;
        if swept > 0 {
            debug!(slug, swept, "collected stale previews");
        }

        let preview = Preview {
            id: Uuid::new_v4().to_string(),
            slug: slug.to_string(),
            created_at: Utc::now(),
            base_turn: current.turn,
            base_hash,
            state_patch: request.state_patch.clone(),
            transcript_entry: effective_transcript_entry(&request),
            changelog_entry: request.changelog_entry.clone(),
            dice_expressions: request.dice_expressions.clone(),
            reserved_indices: reserved_indices.clone(),
            lock_owner: request.lock_owner.clone(),
        };
        self.storage.save_preview(slug, &preview).await?;
        debug!(slug, preview_id = %preview.id, reserved = count, "preview created");

        Ok(PreviewOutcome {
            id: preview.id,
            diffs,
            entropy_plan: EntropyPlan {
                indices: reserved_indices,
                usage: format!("{count} rolls"),
            },
        })
    }

    /// Commit phase: revalidate the witness, resolve the
    /// reserved dice, and apply the write set as one atomic unit.
    pub async fn commit(
        &self,
        slug: &str,
        preview_id: &str,
        lock_owner: Option<&str>,
    ) -> EngineResult<CommitOutcome> {
        let lock = self.storage.get_lock(slug).await?;
        require_lock(lock.as_ref(), lock_owner)?;

        let preview = self.storage.load_preview(slug, preview_id).await?;

        let current = self.storage.load_state(slug).await?;
        let current_value = current.to_value()?;
        let current_hash = stable_hash(&current_value);
        if current.turn != preview.base_turn || current_hash != preview.base_hash {
            // The reservation is dead; drop it so the caller re-previews.
            self.storage.delete_preview(slug, preview_id).await?;
            return Err(EngineError::PreviewStale);
        }

        if let Some(&first) = preview.reserved_indices.first() {
            if first != current.log_index + 1 {
                return Err(EngineError::conflict("entropy reservation mismatch"));
            }
        }

        // Re-verify every reserved index and resolve its expression.
        let mut rolls: Vec<ResolvedRoll> = Vec::with_capacity(preview.reserved_indices.len());
        for (expr_text, &index) in preview
            .dice_expressions
            .iter()
            .zip(preview.reserved_indices.iter())
        {
            let entry = self.storage.load_entropy(index).await?;
            let expr = DiceExpression::parse(expr_text)?;
            rolls.push(resolve_expression(&expr, &entry)?);
        }

        let proposed = apply_patch(&current_value, &preview.state_patch)?;
        let mut new_state = SessionState::validate(&proposed)?;
        new_state.turn = current.turn + 1;
        new_state.log_index = preview
            .reserved_indices
            .iter()
            .copied()
            .max()
            .map_or(current.log_index, |max| current.log_index.max(max));

        let mut transcript_lines: Vec<String> = Vec::new();
        if let Some(entry) = &preview.transcript_entry {
            if !entry.trim().is_empty() {
                transcript_lines.push(entry.trim_end().to_string());
            }
        }
        for roll in &rolls {
            transcript_lines.push(roll.breakdown.clone());
        }

        let changelog_line = preview
            .changelog_entry
            .as_ref()
            .map(|entry| stamp_changelog_entry(entry, new_state.turn, &preview.reserved_indices))
            .transpose()?;

        let artifacts = CommitArtifacts {
            preview_id: preview.id.clone(),
            new_state: new_state.clone(),
            transcript_lines: transcript_lines.clone(),
            changelog_line: changelog_line.clone(),
            lock_owner: lock_owner.map(String::from),
        };
        let log_indices = self.storage.apply_commit(slug, &artifacts).await?;
        info!(slug, turn = new_state.turn, log_index = new_state.log_index, "turn committed");

        self.bus
            .publish(
                slug,
                UpdateEvent {
                    transcript: (!transcript_lines.is_empty()).then(|| LogDelta {
                        lines: transcript_lines,
                        position: log_indices.transcript,
                    }),
                    changelog: changelog_line.map(|line| LogDelta {
                        lines: vec![line],
                        position: log_indices.changelog,
                    }),
                    rolls: (!rolls.is_empty()).then(|| RollsDelta {
                        turn: new_state.turn,
                        items: rolls
                            .iter()
                            .filter_map(|r| serde_json::to_value(r).ok())
                            .collect(),
                    }),
                    turn: new_state.turn,
                },
            )
            .await;

        Ok(CommitOutcome {
            state: new_state,
            log_indices,
            rolls,
        })
    }

    /// Cancel a parked preview without committing it.
    pub async fn cancel_preview(
        &self,
        slug: &str,
        preview_id: &str,
        lock_owner: Option<&str>,
    ) -> EngineResult<()> {
        let lock = self.storage.get_lock(slug).await?;
        require_lock(lock.as_ref(), lock_owner)?;
        self.storage.delete_preview(slug, preview_id).await
    }

    /// Commit plus narration: the committed diff feeds the narration
    /// producer, the sanitized result persists as the turn record, and a
    /// discovery carried by the narration lands in the discovery log.
    pub async fn commit_and_narrate(
        &self,
        llm: &LlmClient,
        slug: &str,
        preview_id: &str,
        lock_owner: Option<&str>,
        player_intent: &str,
    ) -> EngineResult<CommitAndNarrateOutcome> {
        let before_value = self.storage.load_state(slug).await?.to_value()?;
        let commit = self.commit(slug, preview_id, lock_owner).await?;
        let after_value = commit.state.to_value()?;

        let diff = state::summarize_diff(&before_value, &after_value);
        let include_discovery = self.discovery_due(slug, commit.state.turn).await;

        let (dm, usage) = narration::generate(
            llm,
            slug,
            &after_value,
            &before_value,
            player_intent,
            &diff,
            include_discovery,
        )
        .await;

        let rolls_json: Vec<Value> = commit
            .rolls
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect();
        let record = TurnRecord {
            turn: commit.state.turn,
            player_intent: player_intent.to_string(),
            diff,
            consequence_echo: dm.consequence_echo.clone(),
            dm: dm.clone(),
            created_at: Utc::now(),
            rolls: (!rolls_json.is_empty()).then_some(rolls_json),
        };
        self.storage
            .persist_turn_record(slug, record.turn, &serde_json::to_value(&record)?)
            .await?;

        if let Some(discovery) = &dm.discovery_added {
            self.record_discovery(slug, commit.state.turn, discovery)
                .await?;
        }

        Ok(CommitAndNarrateOutcome {
            commit,
            dm,
            turn_record: record,
            usage,
        })
    }

    /// A discovery is requested when none was ever recorded or the last
    /// one is at least `discovery_interval` turns old.
    async fn discovery_due(&self, slug: &str, new_turn: u64) -> bool {
        let last = self
            .storage
            .load_doc(slug, DocKind::LastDiscovery)
            .await
            .ok()
            .and_then(|doc| doc.get("turn").and_then(|t| t.as_u64()));
        match last {
            Some(last_turn) => new_turn.saturating_sub(last_turn) >= self.settings.discovery_interval,
            None => true,
        }
    }

    async fn record_discovery(
        &self,
        slug: &str,
        turn: u64,
        discovery: &narration::DiscoveryItem,
    ) -> EngineResult<()> {
        let mut log = match self.storage.load_doc(slug, DocKind::Discoveries).await? {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        log.push(json!({
            "title": discovery.title,
            "text": discovery.text,
            "turn": turn,
            "discovered_at": Utc::now().to_rfc3339(),
        }));
        self.storage
            .save_doc(slug, DocKind::Discoveries, &Value::Array(log))
            .await?;
        self.storage
            .save_doc(
                slug,
                DocKind::LastDiscovery,
                &json!({"turn": turn, "recorded_at": Utc::now().to_rfc3339()}),
            )
            .await
    }
}

fn effective_transcript_entry(request: &PreviewRequest) -> Option<String> {
    request
        .transcript_entry
        .clone()
        .filter(|entry| !entry.trim().is_empty())
        .or_else(|| {
            let response = request.response.trim();
            (!response.is_empty()).then(|| response.to_string())
        })
}

/// The changelog line is engine-stamped: whatever the caller supplied
/// gains authoritative `turn` and `entropy_indices` fields; a bare
/// string becomes a structured entry around a `summary`.
fn stamp_changelog_entry(entry: &Value, turn: u64, indices: &[u64]) -> EngineResult<String> {
    let stamped = match entry {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("turn".to_string(), json!(turn));
            map.insert("entropy_indices".to_string(), json!(indices));
            Value::Object(map)
        }
        Value::String(text) => json!({
            "turn": turn,
            "summary": text,
            "entropy_indices": indices,
        }),
        other => json!({
            "turn": turn,
            "summary": other,
            "entropy_indices": indices,
        }),
    };
    Ok(serde_json::to_string(&stamped)?)
}
