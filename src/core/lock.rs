//! Per-session lock lease.
//!
//! One lock per session slug: owner, TTL, acquisition time. Expiry is
//! passive; the next claimant observes it. The claim/require decision
//! logic lives here so both storage backends enforce identical
//! semantics; the backends supply the atomic create primitive
//! (`create_new` on disk, conditional insert in SQL).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    /// Lease length in seconds.
    pub ttl: u64,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(owner: impl Into<String>, ttl: u64) -> Self {
        Self {
            owner: owner.into(),
            ttl,
            acquired_at: Utc::now(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + Duration::seconds(self.ttl as i64)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Outcome of evaluating a claim against the current lock state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    /// No usable lock exists; the backend must create one atomically.
    CreateNew,
    /// The claimant already owns the lock; refresh `acquired_at`/`ttl`.
    Refresh,
    /// An expired lease is in the way; replace it.
    ReplaceExpired,
}

/// Decide a claim: free, expired, or self-owned locks are claimable;
/// anything else is `LockHeld`.
pub fn decide_claim(
    existing: Option<&LockInfo>,
    owner: &str,
    now: DateTime<Utc>,
) -> EngineResult<ClaimDecision> {
    match existing {
        None => Ok(ClaimDecision::CreateNew),
        Some(lock) if lock.owner == owner => Ok(ClaimDecision::Refresh),
        Some(lock) if lock.is_expired_at(now) => Ok(ClaimDecision::ReplaceExpired),
        Some(lock) => Err(EngineError::LockHeld {
            owner: lock.owner.clone(),
        }),
    }
}

/// Validate a release: the owner must match, or be omitted (operator
/// override).
pub fn validate_release(existing: Option<&LockInfo>, owner: Option<&str>) -> EngineResult<()> {
    match (existing, owner) {
        (None, _) => Ok(()),
        (Some(_), None) => Ok(()),
        (Some(lock), Some(owner)) if lock.owner == owner => Ok(()),
        (Some(_), Some(_)) => Err(EngineError::LockOwnerMismatch),
    }
}

/// Require an active lease held by `owner` (or by anyone when `owner` is
/// `None`, for flows where the caller inherits whatever writer is
/// active). A missing or expired lock always fails.
pub fn require_lock(existing: Option<&LockInfo>, owner: Option<&str>) -> EngineResult<()> {
    let lock = existing.ok_or(EngineError::LockRequired)?;
    if lock.is_expired() {
        return Err(EngineError::LockRequired);
    }
    match owner {
        Some(owner) if lock.owner != owner => Err(EngineError::LockRequired),
        _ => Ok(()),
    }
}
