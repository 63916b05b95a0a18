//! DM narration contract.
//!
//! The narration producer returns a JSON document; everything in it is
//! untrusted. Sanitization enforces the choice contract (2-4 distinct
//! options, no placeholder actions, risk spread) and a deterministic
//! fallback stands in whenever the producer is unreachable or keeps
//! returning non-JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::highlights;
use super::llm::LlmClient;

/// Choice intents the UI understands.
pub const ALLOWED_INTENTS: [&str; 7] = [
    "talk",
    "sneak",
    "fight",
    "magic",
    "investigate",
    "travel",
    "other",
];

const ALLOWED_RISKS: [&str; 3] = ["low", "medium", "high"];

/// Placeholder actions that add nothing to play.
const BANNED_CHOICE_WORDS: [&str; 4] = ["continue", "do nothing", "wait", "skip"];

/// One option offered to the player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmChoice {
    pub id: String,
    pub text: String,
    pub intent_tag: String,
    pub risk: String,
}

/// A clue or rumor surfaced this turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryItem {
    pub title: String,
    pub text: String,
}

/// Sanitized narration for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmNarration {
    pub narration: String,
    pub recap: String,
    pub stakes: String,
    pub choices: Vec<DmChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_added: Option<DiscoveryItem>,
    pub consequence_echo: String,
    #[serde(default)]
    pub choices_fallback: bool,
}

/// Persisted per committed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: u64,
    pub player_intent: String,
    pub diff: Vec<String>,
    pub consequence_echo: String,
    pub dm: DmNarration,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolls: Option<Vec<Value>>,
}

/// Pull a JSON object out of raw model output, tolerating fencing and
/// prose around the body.
pub fn parse_dm_json(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn default_choices(state: &Value) -> Vec<DmChoice> {
    let location = state
        .get("location")
        .and_then(|v| v.as_str())
        .unwrap_or("this place");
    vec![
        DmChoice {
            id: "A".into(),
            text: format!("Ask locals about {location}"),
            intent_tag: "talk".into(),
            risk: "low".into(),
        },
        DmChoice {
            id: "B".into(),
            text: "Probe quietly for weak spots".into(),
            intent_tag: "sneak".into(),
            risk: "medium".into(),
        },
        DmChoice {
            id: "C".into(),
            text: "Force the issue with bold action".into(),
            intent_tag: "fight".into(),
            risk: "high".into(),
        },
    ]
}

/// Enforce the choice contract; returns the cleaned list and whether any
/// fallback material was injected.
fn sanitize_choices(raw_choices: &[Value], state: &Value) -> (Vec<DmChoice>, bool) {
    let mut sanitized: Vec<DmChoice> = Vec::new();
    let mut seen_texts: Vec<String> = Vec::new();
    let mut fallback_used = false;
    let fallback_choices = default_choices(state);

    for raw in raw_choices {
        let Some(obj) = raw.as_object() else {
            fallback_used = true;
            continue;
        };
        let text = obj
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        let lowered = text.to_lowercase();
        if text.is_empty() || BANNED_CHOICE_WORDS.iter().any(|bad| lowered.contains(bad)) {
            fallback_used = true;
            continue;
        }
        if seen_texts.contains(&lowered) {
            fallback_used = true;
            continue;
        }
        seen_texts.push(lowered);

        let intent_tag = obj
            .get("intent_tag")
            .and_then(|v| v.as_str())
            .filter(|tag| ALLOWED_INTENTS.contains(tag))
            .unwrap_or("other")
            .to_string();
        let risk = obj
            .get("risk")
            .and_then(|v| v.as_str())
            .filter(|r| ALLOWED_RISKS.contains(r))
            .unwrap_or("medium")
            .to_string();
        let id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| {
                char::from(b'A' + sanitized.len() as u8).to_string()
            });
        sanitized.push(DmChoice {
            id,
            text,
            intent_tag,
            risk,
        });
    }

    if sanitized.len() < 2 {
        fallback_used = true;
        let existing: Vec<String> = sanitized.iter().map(|c| c.id.clone()).collect();
        for fallback in &fallback_choices {
            if existing.contains(&fallback.id) {
                continue;
            }
            sanitized.push(fallback.clone());
            if sanitized.len() >= 3 {
                break;
            }
        }
    }
    if sanitized.len() > 4 {
        fallback_used = true;
        sanitized.truncate(4);
    }

    // Keep at least one safe and one risky option on the table.
    let has_risk = |choices: &[DmChoice], risk: &str| choices.iter().any(|c| c.risk == risk);
    let have_low = has_risk(&sanitized, "low");
    let have_high = has_risk(&sanitized, "high");
    if !have_low || !have_high {
        fallback_used = true;
        if !have_low {
            sanitized.push(fallback_choices[0].clone());
        }
        if !have_high {
            sanitized.push(fallback_choices[2].clone());
        }
        sanitized.truncate(4);
    }

    (sanitized, fallback_used)
}

/// Sanitize a parsed producer payload into the narration contract.
pub fn sanitize_payload(
    payload: &Value,
    state: &Value,
    before_state: &Value,
    player_intent: &str,
    diff: &[String],
    include_discovery: bool,
) -> DmNarration {
    let hl = highlights::summarize(diff, before_state, state);

    let field = |key: &str| -> String {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string()
    };

    let mut narration = field("narration");
    let mut recap = field("recap");
    let mut stakes = field("stakes");
    if narration.is_empty() {
        let detail = if diff.is_empty() {
            "Tension lingers.".to_string()
        } else {
            diff.join(" ")
        };
        narration = format!("The scene shifts after {player_intent}. {detail}");
    }
    if recap.is_empty() {
        recap = format!(
            "Turn {} recap at {}.",
            state.get("turn").and_then(|v| v.as_u64()).unwrap_or(0),
            state
                .get("location")
                .and_then(|v| v.as_str())
                .unwrap_or("the field")
        );
    }
    if stakes.is_empty() {
        stakes = "Each option carries a cost; failure introduces new pressure.".to_string();
    }

    let raw_choices = payload
        .get("choices")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let (choices, choices_fallback) = sanitize_choices(&raw_choices, state);

    let mut discovery_added: Option<DiscoveryItem> = payload
        .get("discovery_added")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    if include_discovery && discovery_added.is_none() {
        discovery_added = Some(DiscoveryItem {
            title: format!(
                "Lead near {}",
                state.get("location").and_then(|v| v.as_str()).unwrap_or("here")
            ),
            text: "A clue surfaces, hinting at a hidden path or ally.".to_string(),
        });
    }

    let consequence_echo = highlights::derive_consequence_echo(
        payload.get("consequence_echo").and_then(|v| v.as_str()),
        &hl,
        &narration,
        diff,
    );

    DmNarration {
        narration,
        recap,
        stakes,
        choices,
        discovery_added,
        consequence_echo,
        choices_fallback: choices_fallback
            || payload
                .get("choices_fallback")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
    }
}

/// Deterministic narration used when the producer is unavailable.
pub fn fallback_narration(
    state: &Value,
    before_state: &Value,
    player_intent: &str,
    diff: &[String],
    include_discovery: bool,
) -> DmNarration {
    let location = state
        .get("location")
        .and_then(|v| v.as_str())
        .unwrap_or("the current area");
    let turn = state.get("turn").and_then(|v| v.as_u64()).unwrap_or(0);
    let character = state
        .get("character")
        .and_then(|v| v.as_str())
        .unwrap_or("The hero");

    let changes = if diff.is_empty() {
        "No major state shifts recorded.".to_string()
    } else {
        diff.join(" ")
    };
    let narration = format!("After choosing '{player_intent}', the scene adjusts: {changes}");
    let hl = highlights::summarize(diff, before_state, state);
    let echo = highlights::derive_consequence_echo(None, &hl, &narration, diff);

    DmNarration {
        narration,
        recap: format!("Turn {turn}: {character} pushes onward at {location}."),
        stakes: if diff.is_empty() {
            "Small shifts, but pressure builds.".to_string()
        } else {
            "Consequences ripple from each move; risk what you value to advance.".to_string()
        },
        choices: default_choices(state),
        discovery_added: include_discovery.then(|| DiscoveryItem {
            title: format!("Rumor about {location}"),
            text: "A fresh rumor surfaces, hinting at something hidden nearby.".to_string(),
        }),
        consequence_echo: echo,
        choices_fallback: true,
    }
}

fn build_prompt(include_discovery: bool) -> String {
    let mut prompt = concat!(
        "You are the deterministic DM. Return ONLY valid JSON matching the schema.\n",
        "Schema: {\n",
        "  narration: string,\n",
        "  recap: string,\n",
        "  stakes: string (1-2 sentences),\n",
        "  choices: array of 2-4 items with fields {id: A/B/C/D, text, ",
        "intent_tag: talk|sneak|fight|magic|investigate|travel|other, risk: low|medium|high},\n",
        "  discovery_added: optional {title, text},\n",
        "  consequence_echo: optional string summarizing the consequence in 1 line\n",
        "}.\n",
        "Rules: concise, grounded in provided state; keep outputs safe; do not add dice.\n",
        "Choice contract: Return 2-4 DISTINCT options. Avoid placeholders like 'continue' or 'do nothing'.\n",
        "When possible, include: one safe/low-risk option, one risky/high-stakes option, one clever/indirect option.",
    )
    .to_string();
    if include_discovery {
        prompt.push_str(" Always include discovery_added describing a new clue or rumor this turn.");
    }
    prompt
}

/// Produce narration for a committed turn: two producer attempts with a
/// JSON-repair nudge, then the deterministic fallback.
pub async fn generate(
    llm: &LlmClient,
    slug: &str,
    state: &Value,
    before_state: &Value,
    player_intent: &str,
    diff: &[String],
    include_discovery: bool,
) -> (DmNarration, Option<std::collections::HashMap<String, u64>>) {
    if !llm.is_configured() {
        return (
            fallback_narration(state, before_state, player_intent, diff, include_discovery),
            None,
        );
    }

    let context = serde_json::json!({
        "session": slug,
        "state": state,
        "prior_state": before_state,
        "player_intent": player_intent,
        "diff": diff,
    });

    let mut prompt = build_prompt(include_discovery);
    let mut last_usage = None;
    for attempt in 0..2 {
        match llm.chat(&prompt, &context).await {
            Ok(reply) => {
                last_usage = reply.usage.clone();
                if let Some(parsed) = parse_dm_json(&reply.content) {
                    return (
                        sanitize_payload(
                            &parsed,
                            state,
                            before_state,
                            player_intent,
                            diff,
                            include_discovery,
                        ),
                        last_usage,
                    );
                }
                warn!(slug, attempt, "narration producer returned non-JSON");
            }
            Err(e) => {
                warn!(slug, attempt, error = %e, "narration producer call failed");
            }
        }
        prompt = concat!(
            "Previous response was invalid JSON. Respond again with ONLY the JSON body per schema.",
            " Ensure choices have id, text, intent_tag, and risk."
        )
        .to_string();
    }

    (
        fallback_narration(state, before_state, player_intent, diff, include_discovery),
        last_usage,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> Value {
        json!({"character": "rogue", "turn": 4, "location": "the old mill", "hp": 8})
    }

    #[test]
    fn test_parse_dm_json_variants() {
        assert!(parse_dm_json(r#"{"narration": "x"}"#).is_some());
        assert!(parse_dm_json("Here you go:\n```json\n{\"narration\": \"x\"}\n```").is_some());
        assert!(parse_dm_json("no json here").is_none());
        assert!(parse_dm_json("[1, 2]").is_none());
    }

    #[test]
    fn test_sanitize_fills_missing_sections() {
        let dm = sanitize_payload(
            &json!({"choices": []}),
            &state(),
            &state(),
            "sneak in",
            &["hp: 9 -> 8".to_string()],
            false,
        );
        assert!(dm.narration.contains("sneak in"));
        assert!(dm.recap.starts_with("Turn 4"));
        assert!(dm.choices_fallback);
        assert!(dm.choices.len() >= 2 && dm.choices.len() <= 4);
    }

    #[test]
    fn test_sanitize_drops_banned_and_duplicate_choices() {
        let payload = json!({
            "narration": "n", "recap": "r", "stakes": "s",
            "choices": [
                {"id": "A", "text": "Do nothing for now", "intent_tag": "other", "risk": "low"},
                {"id": "B", "text": "Climb the wall", "intent_tag": "travel", "risk": "high"},
                {"id": "C", "text": "Climb the wall", "intent_tag": "travel", "risk": "high"},
                {"id": "D", "text": "Bribe the guard", "intent_tag": "talk", "risk": "low"},
            ]
        });
        let dm = sanitize_payload(&payload, &state(), &state(), "act", &[], false);
        assert!(dm.choices_fallback);
        let texts: Vec<&str> = dm.choices.iter().map(|c| c.text.as_str()).collect();
        assert!(!texts.iter().any(|t| t.to_lowercase().contains("nothing")));
        assert_eq!(
            texts.iter().filter(|&&t| t == "Climb the wall").count(),
            1
        );
    }

    #[test]
    fn test_sanitize_enforces_risk_spread() {
        let payload = json!({
            "narration": "n", "recap": "r", "stakes": "s",
            "choices": [
                {"id": "A", "text": "Talk it out", "intent_tag": "talk", "risk": "medium"},
                {"id": "B", "text": "Slip past", "intent_tag": "sneak", "risk": "medium"},
            ]
        });
        let dm = sanitize_payload(&payload, &state(), &state(), "act", &[], false);
        let risks: Vec<&str> = dm.choices.iter().map(|c| c.risk.as_str()).collect();
        assert!(risks.contains(&"low"));
        assert!(risks.contains(&"high"));
        assert!(dm.choices.len() <= 4);
    }

    #[test]
    fn test_discovery_injected_when_requested() {
        let dm = sanitize_payload(&json!({}), &state(), &state(), "look", &[], true);
        let discovery = dm.discovery_added.expect("discovery requested");
        assert!(discovery.title.contains("the old mill"));

        let dm = sanitize_payload(&json!({}), &state(), &state(), "look", &[], false);
        assert!(dm.discovery_added.is_none());
    }

    #[test]
    fn test_fallback_is_deterministic() {
        let a = fallback_narration(&state(), &state(), "press on", &[], false);
        let b = fallback_narration(&state(), &state(), "press on", &[], false);
        assert_eq!(a.narration, b.narration);
        assert_eq!(a.choices, b.choices);
        assert!(a.choices_fallback);
    }
}
