//! Ad-hoc roll service.
//!
//! Performs a d20 ability or skill check outside of a turn: under the
//! session lock it bumps the entropy cursor by one, appends a transcript
//! line, and attaches the roll to the current turn's record when one
//! exists. A pending preview is invalidated as a side effect, because
//! the state write changes the base hash it witnessed.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::storage::SharedStorage;

use super::dice::{check_d20, Advantage};
use super::entropy::ensure_available;
use super::error::EngineResult;
use super::events::{LogDelta, RollsDelta, UpdateBus, UpdateEvent};
use super::lock::require_lock;

/// Skill-to-governing-ability table (SRD 5e).
const SKILL_TO_ABILITY: [(&str, &str); 18] = [
    ("athletics", "STR"),
    ("acrobatics", "DEX"),
    ("sleight_of_hand", "DEX"),
    ("stealth", "DEX"),
    ("arcana", "INT"),
    ("history", "INT"),
    ("investigation", "INT"),
    ("nature", "INT"),
    ("religion", "INT"),
    ("animal_handling", "WIS"),
    ("insight", "WIS"),
    ("medicine", "WIS"),
    ("perception", "WIS"),
    ("survival", "WIS"),
    ("deception", "CHA"),
    ("intimidation", "CHA"),
    ("performance", "CHA"),
    ("persuasion", "CHA"),
];

/// An on-demand roll request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollRequest {
    /// "check", "save", "initiative", ...
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub ability: Option<String>,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub advantage: Advantage,
    #[serde(default)]
    pub dc: Option<i64>,
    #[serde(default)]
    pub lock_owner: Option<String>,
}

fn default_kind() -> String {
    "check".to_string()
}

/// The resolved roll as returned to the caller and echoed to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollOutcome {
    pub d20: Vec<u32>,
    pub total: i64,
    pub breakdown: String,
    /// Transcript phrase, e.g. `I roll Stealth: 17 +3 (DEX) = 20`.
    pub text: String,
}

#[derive(Clone)]
pub struct RollService {
    storage: SharedStorage,
    bus: UpdateBus,
}

impl RollService {
    pub fn new(storage: SharedStorage, bus: UpdateBus) -> Self {
        Self { storage, bus }
    }

    pub async fn perform(&self, slug: &str, request: RollRequest) -> EngineResult<RollOutcome> {
        let lock = self.storage.get_lock(slug).await?;
        require_lock(lock.as_ref(), request.lock_owner.as_deref())?;

        let mut state = self.storage.load_state(slug).await?;
        let character = self.storage.load_character(slug).await.unwrap_or(json!({}));
        let state_value = state.to_value()?;

        let next_index = state.log_index + 1;
        ensure_available(self.storage.entropy_length().await?, next_index)?;
        let entry = self.storage.load_entropy(next_index).await?;

        let (used, base) = check_d20(&entry, request.advantage)?;

        let ability = request
            .ability
            .clone()
            .or_else(|| {
                request
                    .skill
                    .as_deref()
                    .and_then(skill_to_ability)
                    .map(String::from)
            })
            .or_else(|| (request.kind == "initiative").then(|| "DEX".to_string()));

        let ability_score = ability.as_deref().and_then(|ability| {
            ability_score_from(&state_value, ability).or_else(|| ability_score_from(&character, ability))
        });
        let ability_mod = ability_modifier(ability_score);

        let prof_bonus = match &request.skill {
            Some(skill) if is_skill_proficient(&character, skill) => {
                let level = character
                    .get("level")
                    .and_then(|v| v.as_u64())
                    .or(state.level.map(u64::from));
                proficiency_bonus(level)
            }
            _ => 0,
        };

        let total = base as i64 + ability_mod + prof_bonus;

        let mut breakdown = base.to_string();
        if let Some(ability) = &ability {
            breakdown.push_str(&format!(" {ability_mod:+} ({ability})"));
        }
        if prof_bonus != 0 {
            breakdown.push_str(&format!(" +{prof_bonus} (PROF)"));
        }

        let label = display_label(&request);
        let text = format!("I roll {label}: {breakdown} = {total}");

        state.log_index = next_index;
        self.storage.save_state(slug, &state).await?;
        let position = self
            .storage
            .append_transcript(slug, std::slice::from_ref(&text))
            .await?;

        let roll_payload = json!({
            "kind": request.kind,
            "ability": ability,
            "skill": request.skill,
            "advantage": request.advantage,
            "dc": request.dc,
            "total": total,
            "d20": used,
            "breakdown": breakdown,
            "text": text,
            "entropy_indices": [next_index],
        });
        self.storage
            .append_rolls_to_turn(slug, state.turn, &roll_payload)
            .await?;
        info!(slug, index = next_index, total, "ad-hoc roll resolved");

        self.bus
            .publish(
                slug,
                UpdateEvent {
                    transcript: Some(LogDelta {
                        lines: vec![text.clone()],
                        position,
                    }),
                    changelog: None,
                    rolls: Some(RollsDelta {
                        turn: state.turn,
                        items: vec![roll_payload],
                    }),
                    turn: state.turn,
                },
            )
            .await;

        Ok(RollOutcome {
            d20: used,
            total,
            breakdown,
            text,
        })
    }
}

pub fn normalize_skill_name(skill: &str) -> String {
    skill.trim().to_lowercase().replace(' ', "_")
}

pub fn skill_to_ability(skill: &str) -> Option<&'static str> {
    let normalized = normalize_skill_name(skill);
    SKILL_TO_ABILITY
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, ability)| *ability)
}

/// Standard modifier: floor((score - 10) / 2); unknown scores add 0.
pub fn ability_modifier(score: Option<i64>) -> i64 {
    match score {
        Some(score) => (score - 10).div_euclid(2),
        None => 0,
    }
}

/// Proficiency scales every four levels, floor 2.
pub fn proficiency_bonus(level: Option<u64>) -> i64 {
    match level {
        Some(level) if level >= 1 => 2 + ((level - 1) / 4) as i64,
        _ => 2,
    }
}

fn ability_score_from(payload: &serde_json::Value, ability: &str) -> Option<i64> {
    let abilities = payload.get("abilities")?.as_object()?;
    let lower = ability.to_lowercase();
    abilities
        .get(&lower)
        .or_else(|| abilities.get(&format!("{lower}_")))
        .or_else(|| abilities.get(&ability.to_uppercase()))
        .or_else(|| abilities.get(ability))
        .and_then(|v| v.as_i64())
}

fn is_skill_proficient(character: &serde_json::Value, skill: &str) -> bool {
    let target = normalize_skill_name(skill);
    character
        .get("proficiencies")
        .and_then(|p| p.get("skills"))
        .and_then(|s| s.as_array())
        .map(|skills| {
            skills
                .iter()
                .filter_map(|s| s.as_str())
                .any(|s| normalize_skill_name(s) == target)
        })
        .unwrap_or(false)
}

fn display_label(request: &RollRequest) -> String {
    if let Some(skill) = &request.skill {
        return title_case(&normalize_skill_name(skill).replace('_', " "));
    }
    if let Some(ability) = &request.ability {
        return ability.clone();
    }
    title_case(&request.kind.replace('_', " "))
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skill_to_ability() {
        assert_eq!(skill_to_ability("Stealth"), Some("DEX"));
        assert_eq!(skill_to_ability("sleight of hand"), Some("DEX"));
        assert_eq!(skill_to_ability("basket weaving"), None);
    }

    #[test]
    fn test_ability_modifier_floors() {
        assert_eq!(ability_modifier(Some(10)), 0);
        assert_eq!(ability_modifier(Some(15)), 2);
        assert_eq!(ability_modifier(Some(8)), -1);
        assert_eq!(ability_modifier(Some(7)), -2);
        assert_eq!(ability_modifier(None), 0);
    }

    #[test]
    fn test_proficiency_bonus_tiers() {
        assert_eq!(proficiency_bonus(None), 2);
        assert_eq!(proficiency_bonus(Some(1)), 2);
        assert_eq!(proficiency_bonus(Some(4)), 2);
        assert_eq!(proficiency_bonus(Some(5)), 3);
        assert_eq!(proficiency_bonus(Some(9)), 4);
        assert_eq!(proficiency_bonus(Some(17)), 6);
    }

    #[test]
    fn test_is_skill_proficient() {
        let character = json!({
            "proficiencies": {"skills": ["Stealth", "Sleight of Hand"]}
        });
        assert!(is_skill_proficient(&character, "stealth"));
        assert!(is_skill_proficient(&character, "sleight_of_hand"));
        assert!(!is_skill_proficient(&character, "arcana"));
        assert!(!is_skill_proficient(&json!({}), "stealth"));
    }

    #[test]
    fn test_display_label() {
        let request = RollRequest {
            kind: "check".into(),
            ability: None,
            skill: Some("sleight of hand".into()),
            advantage: Advantage::Normal,
            dc: None,
            lock_owner: None,
        };
        assert_eq!(display_label(&request), "Sleight Of Hand");

        let request = RollRequest {
            kind: "initiative".into(),
            ability: None,
            skill: None,
            advantage: Advantage::Normal,
            dc: None,
            lock_owner: None,
        };
        assert_eq!(display_label(&request), "Initiative");
    }

    #[test]
    fn test_ability_score_lookup_variants() {
        let payload = json!({"abilities": {"dex": 14, "STR": 8, "int_": 12}});
        assert_eq!(ability_score_from(&payload, "DEX"), Some(14));
        assert_eq!(ability_score_from(&payload, "STR"), Some(8));
        assert_eq!(ability_score_from(&payload, "INT"), Some(12));
        assert_eq!(ability_score_from(&payload, "CHA"), None);
    }
}
