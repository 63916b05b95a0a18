//! Lock manager tests: claim atomicity under a burst of concurrent
//! claimants, TTL expiry, refresh, and release ownership.

use std::sync::Arc;

use crate::tests::common::fixtures::{both_backends, file_backend};

#[tokio::test]
async fn test_concurrent_claim_burst_has_one_winner() {
    for backend in both_backends().await {
        backend
            .storage
            .create_session("burst", "example-rogue")
            .await
            .expect("create");

        let storage = Arc::clone(&backend.storage);
        let mut handles = Vec::new();
        for i in 0..8 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                storage.claim_lock("burst", &format!("owner-{i}"), 300).await
            }));
        }

        let mut winners = 0;
        let mut held_errors = 0;
        for handle in handles {
            match handle.await.expect("task") {
                Ok(_) => winners += 1,
                Err(e) if e.kind() == "LockHeld" => held_errors += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1, "exactly one claimant wins");
        assert_eq!(held_errors, 7);
    }
}

#[tokio::test]
async fn test_claim_refresh_and_expiry() {
    for backend in both_backends().await {
        backend
            .storage
            .create_session("lease", "example-rogue")
            .await
            .expect("create");

        backend
            .storage
            .claim_lock("lease", "alice", 300)
            .await
            .expect("initial claim");
        // Same owner refreshes.
        backend
            .storage
            .claim_lock("lease", "alice", 300)
            .await
            .expect("refresh");
        // Different owner is rejected while the lease is live.
        let err = backend
            .storage
            .claim_lock("lease", "bob", 300)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "LockHeld");

        // A zero-ttl lease expires immediately; the next claimant wins.
        backend
            .storage
            .release_lock("lease", Some("alice"))
            .await
            .expect("release");
        backend
            .storage
            .claim_lock("lease", "alice", 0)
            .await
            .expect("claim with zero ttl");
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let info = backend
            .storage
            .claim_lock("lease", "bob", 300)
            .await
            .expect("claim over expired lease");
        assert_eq!(info.owner, "bob");
    }
}

#[tokio::test]
async fn test_release_owner_rules() {
    let backend = file_backend().await;
    backend
        .storage
        .create_session("rel", "example-rogue")
        .await
        .expect("create");

    backend
        .storage
        .claim_lock("rel", "alice", 300)
        .await
        .expect("claim");

    let err = backend
        .storage
        .release_lock("rel", Some("bob"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "LockOwnerMismatch");

    // Omitted owner is the operator override.
    backend
        .storage
        .release_lock("rel", None)
        .await
        .expect("override release");
    assert!(backend
        .storage
        .get_lock("rel")
        .await
        .expect("get lock")
        .is_none());

    // Releasing an unheld lock is fine.
    backend
        .storage
        .release_lock("rel", Some("alice"))
        .await
        .expect("idempotent release");
}
