//! Commit-and-narrate flow with the deterministic fallback narrator:
//! turn records, discovery persistence, and roll attachment.

use serde_json::json;

use crate::core::dice::Advantage;
use crate::core::roll::RollRequest;
use crate::core::turn::PreviewRequest;
use crate::storage::DocKind;
use crate::tests::common::fixtures::{file_backend, locked_session};

#[tokio::test]
async fn test_commit_and_narrate_persists_turn_record_and_discovery() {
    let backend = file_backend().await;
    locked_session(&backend, "tale", "alice").await;
    let engine = backend.engine();
    let llm = backend.llm();

    let preview = engine
        .preview(
            "tale",
            PreviewRequest {
                response: "I follow the tracks north.".into(),
                state_patch: json!({"location": "the north woods", "hp": 8}),
                changelog_entry: Some(json!({"summary": "Followed tracks"})),
                dice_expressions: vec!["1d20".into()],
                lock_owner: Some("alice".into()),
                ..Default::default()
            },
        )
        .await
        .expect("preview");

    let outcome = engine
        .commit_and_narrate(&llm, "tale", &preview.id, Some("alice"), "follow the tracks")
        .await
        .expect("commit and narrate");

    assert_eq!(outcome.commit.state.turn, 1);
    assert!(outcome.dm.choices_fallback, "no LLM configured");
    assert!(outcome.dm.choices.len() >= 2 && outcome.dm.choices.len() <= 4);
    assert!(!outcome.dm.consequence_echo.is_empty());
    assert!(outcome
        .turn_record
        .diff
        .iter()
        .any(|line| line.contains("location")));

    // The record landed under (session, turn).
    let record = backend
        .storage
        .load_turn_record("tale", 1)
        .await
        .expect("turn record");
    assert_eq!(record["player_intent"], json!("follow the tracks"));
    assert_eq!(record["turn"], json!(1));
    assert_eq!(record["rolls"].as_array().map(Vec::len), Some(1));

    // First-ever discovery is due, so the fallback carried one and it
    // was persisted.
    let discoveries = backend
        .storage
        .load_doc("tale", DocKind::Discoveries)
        .await
        .expect("discoveries");
    assert_eq!(discoveries.as_array().map(Vec::len), Some(1));
    let last = backend
        .storage
        .load_doc("tale", DocKind::LastDiscovery)
        .await
        .expect("last discovery");
    assert_eq!(last["turn"], json!(1));
}

#[tokio::test]
async fn test_discovery_interval_suppresses_back_to_back_discoveries() {
    let backend = file_backend().await;
    locked_session(&backend, "quiet", "alice").await;
    let engine = backend.engine();
    let llm = backend.llm();

    for turn in 1..=2u64 {
        let preview = engine
            .preview(
                "quiet",
                PreviewRequest {
                    response: format!("step {turn}"),
                    state_patch: json!({}),
                    lock_owner: Some("alice".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("preview");
        engine
            .commit_and_narrate(&llm, "quiet", &preview.id, Some("alice"), "advance")
            .await
            .expect("narrate");
    }

    // Turn 1 recorded a discovery; turn 2 falls inside the interval.
    let discoveries = backend
        .storage
        .load_doc("quiet", DocKind::Discoveries)
        .await
        .expect("discoveries");
    assert_eq!(discoveries.as_array().map(Vec::len), Some(1));
    let last = backend
        .storage
        .load_doc("quiet", DocKind::LastDiscovery)
        .await
        .expect("last discovery");
    assert_eq!(last["turn"], json!(1));
}

#[tokio::test]
async fn test_roll_after_narrate_attaches_to_turn_record() {
    let backend = file_backend().await;
    locked_session(&backend, "attach", "alice").await;
    let engine = backend.engine();
    let llm = backend.llm();

    let preview = engine
        .preview(
            "attach",
            PreviewRequest {
                response: "I enter the hall.".into(),
                state_patch: json!({"location": "the hall"}),
                lock_owner: Some("alice".into()),
                ..Default::default()
            },
        )
        .await
        .expect("preview");
    engine
        .commit_and_narrate(&llm, "attach", &preview.id, Some("alice"), "enter")
        .await
        .expect("narrate");

    backend
        .rolls()
        .perform(
            "attach",
            RollRequest {
                kind: "check".into(),
                ability: None,
                skill: Some("stealth".into()),
                advantage: Advantage::Disadvantage,
                dc: None,
                lock_owner: Some("alice".into()),
            },
        )
        .await
        .expect("roll");

    let record = backend
        .storage
        .load_turn_record("attach", 1)
        .await
        .expect("record");
    let rolls = record["rolls"].as_array().expect("rolls array");
    assert_eq!(rolls.len(), 1);
    assert_eq!(rolls[0]["d20"], json!([10, 4]));
    // Disadvantage takes the lower die: 4 + 2 (DEX) + 2 (PROF).
    assert_eq!(rolls[0]["total"], json!(8));
    assert_eq!(rolls[0]["entropy_indices"], json!([1]));
}
