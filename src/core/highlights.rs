//! Diff highlight reduction.
//!
//! Collapses a raw state diff into the player-facing categories the
//! narration layer anchors its consequence echo on: HP swings, location
//! shifts, inventory churn, quest movement, faction clocks, and NPC
//! relationships.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// Categorized highlight lines extracted from one state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffHighlights {
    pub hp: Vec<String>,
    pub location: Vec<String>,
    pub inventory_added: Vec<String>,
    pub inventory_removed: Vec<String>,
    pub quests: Vec<String>,
    pub clocks: Vec<String>,
    pub relationships: Vec<String>,
    pub other: Vec<String>,
}

fn string_set(value: Option<&Value>) -> BTreeSet<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().map(render).collect())
        .unwrap_or_default()
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Sub-map of `flags` holding clocks or relationships.
fn flags_map<'a>(state: &'a Value, key: &str) -> Option<&'a Map<String, Value>> {
    state.get("flags")?.get(key)?.as_object()
}

fn diff_flag_maps(
    before: &Value,
    after: &Value,
    key: &str,
    mut format: impl FnMut(&str, &str, &str) -> String,
    out: &mut Vec<String>,
) {
    let empty = Map::new();
    let before_map = flags_map(before, key).unwrap_or(&empty);
    let after_map = flags_map(after, key).unwrap_or(&empty);
    let mut names: Vec<&String> = before_map.keys().chain(after_map.keys()).collect();
    names.sort();
    names.dedup();
    for name in names {
        let old = before_map.get(name);
        let new = after_map.get(name);
        if old != new {
            let old = old.map(render).unwrap_or_else(|| "?".to_string());
            let new = new.map(render).unwrap_or_else(|| "?".to_string());
            out.push(format(name, &old, &new));
        }
    }
}

/// Reduce a diff into categorized highlights.
pub fn summarize(diff: &[String], before: &Value, after: &Value) -> DiffHighlights {
    let mut highlights = DiffHighlights::default();

    let before_hp = before.get("hp").and_then(|v| v.as_i64());
    let after_hp = after.get("hp").and_then(|v| v.as_i64());
    if let (Some(b), Some(a)) = (before_hp, after_hp) {
        if b != a {
            let delta = a - b;
            highlights.hp.push(format!("HP {b} -> {a} ({delta:+})"));
        }
    }

    let before_location = before.get("location").and_then(|v| v.as_str());
    let after_location = after.get("location").and_then(|v| v.as_str());
    if before_location != after_location {
        highlights.location.push(format!(
            "Location shifts from {} to {}",
            before_location.unwrap_or("unknown"),
            after_location.unwrap_or("unknown")
        ));
    }

    let before_items = string_set(before.get("inventory"));
    let after_items = string_set(after.get("inventory"));
    let added: Vec<String> = after_items.difference(&before_items).cloned().collect();
    let removed: Vec<String> = before_items.difference(&after_items).cloned().collect();
    if !added.is_empty() {
        highlights
            .inventory_added
            .push(format!("Picked up: {}", added.join(", ")));
    }
    if !removed.is_empty() {
        highlights
            .inventory_removed
            .push(format!("Lost: {}", removed.join(", ")));
    }

    diff_flag_maps(
        before,
        after,
        "clocks",
        |name, old, new| format!("Clock '{name}' {old} -> {new}"),
        &mut highlights.clocks,
    );
    diff_flag_maps(
        before,
        after,
        "relationships",
        |name, old, new| format!("Relationship with {name}: {old} -> {new}"),
        &mut highlights.relationships,
    );

    // Route raw diff lines by keyword; first match wins.
    for line in diff {
        let lower = line.to_lowercase();
        let bucket = if lower.contains("hp") {
            &mut highlights.hp
        } else if lower.contains("location") {
            &mut highlights.location
        } else if lower.contains("inventory") {
            &mut highlights.inventory_added
        } else if lower.contains("quest") {
            &mut highlights.quests
        } else if lower.contains("clock") {
            &mut highlights.clocks
        } else if lower.contains("relationship") {
            &mut highlights.relationships
        } else {
            &mut highlights.other
        };
        bucket.push(line.clone());
    }

    highlights
}

/// Construct a consequence echo anchored in recent state changes; a
/// caller-provided echo always wins.
pub fn derive_consequence_echo(
    provided: Option<&str>,
    highlights: &DiffHighlights,
    narration: &str,
    diff: &[String],
) -> String {
    if let Some(echo) = provided {
        let trimmed = echo.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut segments: Vec<String> = Vec::new();
    if let Some(first) = highlights.hp.first() {
        segments.push(first.clone());
    }
    if let Some(first) = highlights.location.first() {
        segments.push(first.clone());
    }
    let inventory_bits: Vec<String> = highlights
        .inventory_added
        .iter()
        .chain(highlights.inventory_removed.iter())
        .take(2)
        .cloned()
        .collect();
    if !inventory_bits.is_empty() {
        segments.push(inventory_bits.join("; "));
    }
    for bucket in [
        &highlights.quests,
        &highlights.clocks,
        &highlights.relationships,
    ] {
        if let Some(first) = bucket.first() {
            segments.push(first.clone());
        }
    }

    if segments.is_empty() {
        if let Some(first) = diff.first() {
            segments.push(first.clone());
        }
    }
    if segments.is_empty() {
        let leading = narration.split('.').next().unwrap_or("").trim();
        if !leading.is_empty() {
            segments.push(leading.to_string());
        }
    }

    if segments.is_empty() {
        "A new consequence unfolds.".to_string()
    } else {
        segments.join("; ")
    }
}
