//! Collaborator traits for the import pipeline.
//!
//! The orchestrator and reconciler only ever talk to storage through these
//! traits, so backends are pluggable (SQLite in the application crate, the
//! in-memory implementations in [`memory`] for tests).
//!
//! | Trait | Role |
//! |-------|------|
//! | [`Catalog`] | Read-only chart/song lookup |
//! | [`ScoreStore`] | Committed scores, keyed by dedup key |
//! | [`PersonalBestMerge`] | Downstream PB index update |
//! | [`Blacklist`] | Dedup keys that must never be committed |
//! | [`OrphanStore`] | Records waiting for catalog data |
//! | [`UserLocks`] | Per-user single-flight guard with TTL |
//!
//! All methods return `anyhow::Result`; an `Err` means the backend itself
//! failed, never that a lookup came up empty.

pub mod memory;

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Chart, ChartQuery, Game, Score, Song, UserId};

/// Reference catalog lookup. Absent entries are `Ok(None)`.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn find_chart(&self, query: &ChartQuery) -> Result<Option<Chart>>;

    async fn find_song(&self, game: Game, song_id: i64) -> Result<Option<Song>>;
}

/// Committed scores.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Insert a score. Returns `false` (and changes nothing) when a score
    /// with the same `score_id` already exists.
    async fn insert_score(&self, score: &Score) -> Result<bool>;

    async fn score_exists(&self, score_id: &str) -> Result<bool>;
}

/// Personal-best index maintained alongside committed scores.
#[async_trait]
pub trait PersonalBestMerge: Send + Sync {
    async fn apply(&self, score: &Score) -> Result<()>;
}

#[async_trait]
pub trait Blacklist: Send + Sync {
    async fn contains(&self, score_id: &str) -> Result<bool>;
}

#[async_trait]
impl Blacklist for HashSet<String> {
    async fn contains(&self, score_id: &str) -> Result<bool> {
        Ok(HashSet::contains(self, score_id))
    }
}

/// A record held back because its chart or song was missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanRecord {
    pub orphan_id: String,
    pub user_id: UserId,
    pub import_type: String,
    pub raw: Value,
    pub context: Value,
    pub first_seen: i64,
    pub retry_count: u32,
    pub last_attempt_at: Option<i64>,
    /// Retry ceiling reached; kept for inspection, skipped by sweeps.
    pub exhausted: bool,
    pub last_error: Option<String>,
}

impl OrphanRecord {
    pub fn new(user_id: UserId, import_type: &str, raw: Value, context: Value, now: i64) -> Self {
        Self {
            orphan_id: crate::dedup::orphan_id(user_id, import_type, &raw, &context),
            user_id,
            import_type: import_type.to_string(),
            raw,
            context,
            first_seen: now,
            retry_count: 0,
            last_attempt_at: None,
            exhausted: false,
            last_error: None,
        }
    }
}

#[async_trait]
pub trait OrphanStore: Send + Sync {
    /// Insert an orphan. Returns `false` when one with the same
    /// `orphan_id` is already stored; the stored copy is left untouched.
    async fn store(&self, orphan: &OrphanRecord) -> Result<bool>;

    /// List orphans, optionally for one user, oldest first.
    async fn list(&self, user_id: Option<UserId>) -> Result<Vec<OrphanRecord>>;

    /// Users with at least one orphan that is not exhausted.
    async fn users_with_orphans(&self) -> Result<Vec<UserId>>;

    async fn remove(&self, orphan_id: &str) -> Result<bool>;

    /// Record a failed retry: bumps `retry_count`, stamps
    /// `last_attempt_at` and stores the error, if any.
    async fn record_attempt(
        &self,
        orphan_id: &str,
        at: i64,
        error: Option<&str>,
        exhausted: bool,
    ) -> Result<()>;

    /// Delete exhausted orphans. Returns how many were removed.
    async fn purge_exhausted(&self, user_id: Option<UserId>) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Import,
    Reconcile,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::Import => "import",
            LockKind::Reconcile => "reconcile",
        }
    }
}

/// Proof of holding a user lock. Only the holder of the token can refresh
/// or release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub user_id: UserId,
    pub kind: LockKind,
    pub token: String,
    pub expires_at: i64,
}

/// Per-user, per-kind mutual exclusion with expiry.
///
/// A lock whose `expires_at` has passed is free: the next
/// [`try_acquire`](UserLocks::try_acquire) takes it over, and the previous
/// holder's refresh and release become no-ops.
#[async_trait]
pub trait UserLocks: Send + Sync {
    /// Acquire the lock, or `Ok(None)` if a live lock is held.
    async fn try_acquire(
        &self,
        user_id: UserId,
        kind: LockKind,
        ttl: Duration,
    ) -> Result<Option<LockToken>>;

    /// Extend a held lock. Returns `false` if the lock was lost.
    async fn refresh(&self, token: &LockToken, ttl: Duration) -> Result<bool>;

    /// Release a held lock. Returns `false` if it was no longer ours.
    async fn release(&self, token: &LockToken) -> Result<bool>;

    /// Delete locks that expired at or before `now`.
    async fn sweep_expired(&self, now: i64) -> Result<u64>;

    /// Delete every lock, live or not.
    async fn clear_all(&self) -> Result<u64>;
}

/// Expiry timestamp `ttl` from `now`, in epoch milliseconds.
pub fn expiry(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
}
