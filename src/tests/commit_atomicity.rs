//! Commit failure atomicity (filesystem backend).
//!
//! Forces a storage failure partway through the commit write set and
//! checks that observers see either the full commit or none of it,
//! never a mixed state.

use std::fs;

use serde_json::json;

use crate::core::turn::PreviewRequest;
use crate::tests::common::fixtures::{file_backend, locked_session};

#[tokio::test]
async fn test_failed_changelog_append_rolls_back_state_and_transcript() {
    let backend = file_backend().await;
    locked_session(&backend, "s6", "alice").await;
    let engine = backend.engine();

    let preview = engine
        .preview(
            "s6",
            PreviewRequest {
                response: "I push the door.".into(),
                state_patch: json!({"location": "the vault"}),
                transcript_entry: Some("Player pushes the door.".into()),
                changelog_entry: Some(json!({"summary": "Door pushed"})),
                dice_expressions: vec!["1d20".into()],
                lock_owner: Some("alice".into()),
            },
        )
        .await
        .expect("preview");

    // Sabotage: the changelog path becomes un-appendable after the
    // state write and transcript append will already have happened.
    let session_dir = backend.data_root().join("sessions").join("s6");
    let changelog = session_dir.join("changelog.md");
    let original = fs::read_to_string(&changelog).expect("read changelog");
    fs::remove_file(&changelog).expect("remove changelog");
    fs::create_dir(&changelog).expect("block changelog path");

    let err = engine
        .commit("s6", &preview.id, Some("alice"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "Internal");

    // Repair the path, then verify nothing of the commit is visible.
    fs::remove_dir(&changelog).expect("unblock changelog path");
    fs::write(&changelog, &original).expect("restore changelog");

    let state = backend.storage.load_state("s6").await.expect("state");
    assert_eq!(state.turn, 0, "state write must be reversed");
    assert_eq!(state.log_index, 0);
    assert_eq!(state.location, "");

    let counts = backend.storage.log_counts("s6").await.expect("counts");
    assert_eq!(counts.transcript, 0, "transcript append must be reversed");
    assert_eq!(counts.changelog, 1, "only the initialization line");

    // The preview survives a failed commit and can be retried.
    let outcome = engine
        .commit("s6", &preview.id, Some("alice"))
        .await
        .expect("retry succeeds after repair");
    assert_eq!(outcome.state.turn, 1);
    assert_eq!(outcome.state.location, "the vault");
}
