//! Session state document.
//!
//! The state is a typed root with the fields the engine enforces plus a
//! flattened extensions map for open-ended domain data. Patches are
//! JSON-merge style; `turn` and `log_index` are engine-owned and can
//! never be set through a patch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::error::{EngineError, EngineResult};

/// Fields only the turn engine itself may advance.
const RESERVED_FIELDS: [&str; 2] = ["turn", "log_index"];

/// The authoritative mutable document for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub character: String,
    pub turn: u64,
    pub log_index: u64,
    pub scene_id: String,
    pub location: String,
    pub hp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ac: Option<i64>,
    pub conditions: Vec<String>,
    pub inventory: Vec<String>,
    pub flags: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quests: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spells: Option<Value>,
    /// Open-ended domain fields ride along untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionState {
    /// Validate a raw document against the state schema.
    pub fn validate(value: &Value) -> EngineResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| EngineError::schema(format!("state validation failed: {e}")))
    }

    pub fn to_value(&self) -> EngineResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn world_name(&self) -> &str {
        self.world.as_deref().unwrap_or("default")
    }
}

/// Deterministic hash of a state document: SHA-256 over compact JSON.
/// `serde_json::Map` is key-ordered, so serialization is canonical.
pub fn stable_hash(value: &Value) -> String {
    let payload = serde_json::to_string(value).unwrap_or_default();
    let digest = Sha256::digest(payload.as_bytes());
    format!("{digest:x}")
}

/// Apply a JSON-merge-style patch: objects merge recursively, everything
/// else replaces. Reserved fields are rejected up front.
pub fn apply_patch(state: &Value, patch: &Value) -> EngineResult<Value> {
    let patch_map = match patch {
        Value::Object(map) => map,
        Value::Null => return Ok(state.clone()),
        _ => return Err(EngineError::schema("state patch must be an object")),
    };
    for reserved in RESERVED_FIELDS {
        if patch_map.contains_key(reserved) {
            return Err(EngineError::schema(format!(
                "'{reserved}' cannot be set directly"
            )));
        }
    }
    Ok(merge(state, patch))
}

fn merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in patch_map {
                let entry = match merged.get(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge(existing, value)
                    }
                    _ => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

/// One changed leaf in a proposed state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub changes: String,
}

/// Enumerate added/removed/changed leaf paths between two documents.
/// Arrays and scalars are leaves; objects recurse with dotted paths.
pub fn diff_leaf_paths(before: &Value, after: &Value) -> Vec<DiffEntry> {
    let mut diffs = Vec::new();
    walk_diff("", before, after, &mut diffs);
    diffs
}

fn walk_diff(prefix: &str, before: &Value, after: &Value, out: &mut Vec<DiffEntry>) {
    match (before, after) {
        (Value::Object(before_map), Value::Object(after_map)) => {
            let mut keys: Vec<&String> = before_map.keys().chain(after_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match (before_map.get(key), after_map.get(key)) {
                    (Some(b), Some(a)) => walk_diff(&path, b, a, out),
                    (Some(b), None) => out.push(DiffEntry {
                        path,
                        changes: format!("{}\u{2192}", render(b)),
                    }),
                    (None, Some(a)) => out.push(DiffEntry {
                        path,
                        changes: format!("\u{2192}{}", render(a)),
                    }),
                    (None, None) => {}
                }
            }
        }
        _ => {
            if before != after {
                out.push(DiffEntry {
                    path: prefix.to_string(),
                    changes: format!("{}\u{2192}{}", render(before), render(after)),
                });
            }
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flat `key: old -> new` lines for changelog summaries and narration
/// context.
pub fn summarize_diff(before: &Value, after: &Value) -> Vec<String> {
    diff_leaf_paths(before, after)
        .into_iter()
        .map(|d| format!("{}: {}", d.path, d.changes.replace('\u{2192}', " -> ")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_state() -> Value {
        json!({
            "character": "rogue",
            "turn": 3,
            "log_index": 5,
            "scene_id": "cellar",
            "location": "The Damp Cellar",
            "hp": 9,
            "conditions": ["poisoned"],
            "inventory": ["dagger", "rope"],
            "flags": {"met_innkeep": true},
            "gp": 12,
            "mood": "wary"
        })
    }

    #[test]
    fn test_validate_accepts_extra_fields() {
        let state = SessionState::validate(&base_state()).expect("valid");
        assert_eq!(state.turn, 3);
        assert_eq!(state.extra.get("mood"), Some(&json!("wary")));
        // Round trip keeps the extension field.
        let value = state.to_value().expect("to_value");
        assert_eq!(value.get("mood"), Some(&json!("wary")));
    }

    #[test]
    fn test_validate_rejects_wrong_types() {
        let mut bad = base_state();
        bad["hp"] = json!("lots");
        assert_eq!(
            SessionState::validate(&bad).unwrap_err().kind(),
            "SchemaViolation"
        );
    }

    #[test]
    fn test_apply_patch_merges_nested() {
        let patched = apply_patch(
            &base_state(),
            &json!({"flags": {"door_open": true}, "location": "camp"}),
        )
        .expect("patch");
        assert_eq!(patched["location"], json!("camp"));
        assert_eq!(patched["flags"]["met_innkeep"], json!(true));
        assert_eq!(patched["flags"]["door_open"], json!(true));
    }

    #[test]
    fn test_apply_patch_replaces_arrays() {
        let patched =
            apply_patch(&base_state(), &json!({"inventory": ["dagger"]})).expect("patch");
        assert_eq!(patched["inventory"], json!(["dagger"]));
    }

    #[test]
    fn test_apply_patch_rejects_reserved() {
        for field in ["turn", "log_index"] {
            let err = apply_patch(&base_state(), &json!({ field: 99 })).unwrap_err();
            assert_eq!(err.kind(), "SchemaViolation");
        }
    }

    #[test]
    fn test_stable_hash_is_key_order_independent() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(stable_hash(&a), stable_hash(&b));
        assert_ne!(stable_hash(&a), stable_hash(&json!({"b": 1, "a": {}})));
    }

    #[test]
    fn test_diff_leaf_paths() {
        let before = json!({"location": "", "hp": 9, "flags": {"a": 1}});
        let after = json!({"location": "camp", "hp": 9, "flags": {"a": 1, "b": 2}, "gp": 4});
        let diffs = diff_leaf_paths(&before, &after);
        assert_eq!(
            diffs,
            vec![
                DiffEntry {
                    path: "flags.b".into(),
                    changes: "\u{2192}2".into()
                },
                DiffEntry {
                    path: "gp".into(),
                    changes: "\u{2192}4".into()
                },
                DiffEntry {
                    path: "location".into(),
                    changes: "\u{2192}camp".into()
                },
            ]
        );
    }

    #[test]
    fn test_diff_detects_removal_and_change() {
        let before = json!({"hp": 9, "mood": "wary"});
        let after = json!({"hp": 7});
        let diffs = diff_leaf_paths(&before, &after);
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].path, "hp");
        assert_eq!(diffs[0].changes, "9\u{2192}7");
        assert_eq!(diffs[1].path, "mood");
        assert_eq!(diffs[1].changes, "wary\u{2192}");
    }

    #[test]
    fn test_summarize_diff_format() {
        let lines = summarize_diff(&json!({"hp": 9}), &json!({"hp": 7}));
        assert_eq!(lines, vec!["hp: 9 -> 7"]);
    }
}
