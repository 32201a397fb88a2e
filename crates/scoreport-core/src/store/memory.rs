//! In-memory implementations of every collaborator trait, for tests and
//! embedding.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. [`MemoryBackend`]
//! bundles one of each and builds a [`Pipeline`] over them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::convert::ConverterRegistry;
use crate::models::{now_ms, Chart, ChartQuery, Game, PersonalBest, Score, Song, UserId};
use crate::pipeline::Pipeline;

use super::{
    expiry, Blacklist, Catalog, LockKind, LockToken, OrphanRecord, OrphanStore,
    PersonalBestMerge, ScoreStore, UserLocks,
};

// ═══════════════════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════════════════

pub struct InMemoryCatalog {
    songs: RwLock<HashMap<(Game, i64), Song>>,
    charts: RwLock<Vec<Chart>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            songs: RwLock::new(HashMap::new()),
            charts: RwLock::new(Vec::new()),
        }
    }

    pub fn add_song(&self, song: Song) {
        self.songs.write().unwrap().insert((song.game, song.id), song);
    }

    /// Add or replace a chart (keyed by `chart_id`).
    pub fn add_chart(&self, chart: Chart) {
        let mut charts = self.charts.write().unwrap();
        charts.retain(|c| c.chart_id != chart.chart_id);
        charts.push(chart);
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn find_chart(&self, query: &ChartQuery) -> Result<Option<Chart>> {
        let charts = self.charts.read().unwrap();
        Ok(charts.iter().find(|c| query.matches(c)).cloned())
    }

    async fn find_song(&self, game: Game, song_id: i64) -> Result<Option<Song>> {
        Ok(self.songs.read().unwrap().get(&(game, song_id)).cloned())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Scores and personal bests
// ═══════════════════════════════════════════════════════════════════════

pub struct InMemoryScoreStore {
    scores: RwLock<BTreeMap<String, Score>>,
    pbs: RwLock<HashMap<(UserId, String), PersonalBest>>,
}

impl InMemoryScoreStore {
    pub fn new() -> Self {
        Self {
            scores: RwLock::new(BTreeMap::new()),
            pbs: RwLock::new(HashMap::new()),
        }
    }

    pub fn scores(&self) -> Vec<Score> {
        self.scores.read().unwrap().values().cloned().collect()
    }

    pub fn personal_best(&self, user_id: UserId, chart_id: &str) -> Option<PersonalBest> {
        self.pbs
            .read()
            .unwrap()
            .get(&(user_id, chart_id.to_string()))
            .cloned()
    }
}

impl Default for InMemoryScoreStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScoreStore for InMemoryScoreStore {
    async fn insert_score(&self, score: &Score) -> Result<bool> {
        let mut scores = self.scores.write().unwrap();
        if scores.contains_key(&score.score_id) {
            return Ok(false);
        }
        scores.insert(score.score_id.clone(), score.clone());
        Ok(true)
    }

    async fn score_exists(&self, score_id: &str) -> Result<bool> {
        Ok(self.scores.read().unwrap().contains_key(score_id))
    }
}

#[async_trait]
impl PersonalBestMerge for InMemoryScoreStore {
    async fn apply(&self, score: &Score) -> Result<()> {
        let mut pbs = self.pbs.write().unwrap();
        let key = (score.user_id, score.chart_id.clone());
        let merged = PersonalBest::merge(pbs.remove(&key), score, now_ms());
        pbs.insert(key, merged);
        Ok(())
    }
}

pub struct InMemoryBlacklist {
    ids: RwLock<HashSet<String>>,
}

impl InMemoryBlacklist {
    pub fn new() -> Self {
        Self {
            ids: RwLock::new(HashSet::new()),
        }
    }

    pub fn add(&self, score_id: &str) {
        self.ids.write().unwrap().insert(score_id.to_string());
    }
}

impl Default for InMemoryBlacklist {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Blacklist for InMemoryBlacklist {
    async fn contains(&self, score_id: &str) -> Result<bool> {
        Ok(self.ids.read().unwrap().contains(score_id))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Orphans
// ═══════════════════════════════════════════════════════════════════════

pub struct InMemoryOrphanStore {
    orphans: RwLock<Vec<OrphanRecord>>,
}

impl InMemoryOrphanStore {
    pub fn new() -> Self {
        Self {
            orphans: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.orphans.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryOrphanStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrphanStore for InMemoryOrphanStore {
    async fn store(&self, orphan: &OrphanRecord) -> Result<bool> {
        let mut orphans = self.orphans.write().unwrap();
        if orphans.iter().any(|o| o.orphan_id == orphan.orphan_id) {
            return Ok(false);
        }
        orphans.push(orphan.clone());
        Ok(true)
    }

    async fn list(&self, user_id: Option<UserId>) -> Result<Vec<OrphanRecord>> {
        let orphans = self.orphans.read().unwrap();
        let mut out: Vec<OrphanRecord> = orphans
            .iter()
            .filter(|o| user_id.map_or(true, |u| o.user_id == u))
            .cloned()
            .collect();
        out.sort_by_key(|o| o.first_seen);
        Ok(out)
    }

    async fn users_with_orphans(&self) -> Result<Vec<UserId>> {
        let orphans = self.orphans.read().unwrap();
        let mut users: Vec<UserId> = orphans
            .iter()
            .filter(|o| !o.exhausted)
            .map(|o| o.user_id)
            .collect();
        users.sort_unstable();
        users.dedup();
        Ok(users)
    }

    async fn remove(&self, orphan_id: &str) -> Result<bool> {
        let mut orphans = self.orphans.write().unwrap();
        let before = orphans.len();
        orphans.retain(|o| o.orphan_id != orphan_id);
        Ok(orphans.len() != before)
    }

    async fn record_attempt(
        &self,
        orphan_id: &str,
        at: i64,
        error: Option<&str>,
        exhausted: bool,
    ) -> Result<()> {
        let mut orphans = self.orphans.write().unwrap();
        if let Some(o) = orphans.iter_mut().find(|o| o.orphan_id == orphan_id) {
            o.retry_count += 1;
            o.last_attempt_at = Some(at);
            o.last_error = error.map(str::to_string);
            o.exhausted = exhausted;
        }
        Ok(())
    }

    async fn purge_exhausted(&self, user_id: Option<UserId>) -> Result<u64> {
        let mut orphans = self.orphans.write().unwrap();
        let before = orphans.len();
        orphans.retain(|o| !(o.exhausted && user_id.map_or(true, |u| o.user_id == u)));
        Ok((before - orphans.len()) as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Locks
// ═══════════════════════════════════════════════════════════════════════

pub struct InMemoryLocks {
    locks: RwLock<HashMap<(UserId, LockKind), LockToken>>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_held(&self, user_id: UserId, kind: LockKind) -> bool {
        self.locks
            .read()
            .unwrap()
            .get(&(user_id, kind))
            .map_or(false, |l| l.expires_at > now_ms())
    }
}

impl Default for InMemoryLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserLocks for InMemoryLocks {
    async fn try_acquire(
        &self,
        user_id: UserId,
        kind: LockKind,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        let now = now_ms();
        let mut locks = self.locks.write().unwrap();
        if let Some(existing) = locks.get(&(user_id, kind)) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        let token = LockToken {
            user_id,
            kind,
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: expiry(now, ttl),
        };
        locks.insert((user_id, kind), token.clone());
        Ok(Some(token))
    }

    async fn refresh(&self, token: &LockToken, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.write().unwrap();
        match locks.get_mut(&(token.user_id, token.kind)) {
            Some(held) if held.token == token.token => {
                held.expires_at = expiry(now_ms(), ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, token: &LockToken) -> Result<bool> {
        let mut locks = self.locks.write().unwrap();
        let key = (token.user_id, token.kind);
        match locks.get(&key) {
            Some(held) if held.token == token.token => {
                locks.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sweep_expired(&self, now: i64) -> Result<u64> {
        let mut locks = self.locks.write().unwrap();
        let before = locks.len();
        locks.retain(|_, l| l.expires_at > now);
        Ok((before - locks.len()) as u64)
    }

    async fn clear_all(&self) -> Result<u64> {
        let mut locks = self.locks.write().unwrap();
        let n = locks.len() as u64;
        locks.clear();
        Ok(n)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Bundle
// ═══════════════════════════════════════════════════════════════════════

/// One of each in-memory collaborator, shared via `Arc` so tests can
/// inspect state after handing a [`Pipeline`] to the drivers.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub catalog: Arc<InMemoryCatalog>,
    pub scores: Arc<InMemoryScoreStore>,
    pub orphans: Arc<InMemoryOrphanStore>,
    pub locks: Arc<InMemoryLocks>,
    pub blacklist: Arc<InMemoryBlacklist>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(&self, converters: ConverterRegistry) -> Pipeline {
        Pipeline {
            catalog: self.catalog.clone(),
            scores: self.scores.clone(),
            personal_bests: self.scores.clone(),
            orphans: self.orphans.clone(),
            locks: self.locks.clone(),
            blacklist: self.blacklist.clone(),
            converters: Arc::new(converters),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::chart_spa;
    use crate::models::Playtype;

    #[tokio::test]
    async fn test_catalog_hash_lookup() {
        let catalog = InMemoryCatalog::new();
        let mut chart = chart_spa();
        chart.hash_sha256 = Some("abc".to_string());
        catalog.add_chart(chart.clone());

        let hit = ChartQuery::Hash {
            game: Game::Iidx,
            sha256: "abc".to_string(),
        };
        assert_eq!(catalog.find_chart(&hit).await.unwrap(), Some(chart));

        let miss = ChartQuery::InGame {
            game: Game::Iidx,
            in_game_id: 1000,
            playtype: Playtype::DP,
            difficulty: crate::models::Difficulty::Another,
            version: None,
        };
        assert!(catalog.find_chart(&miss).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_store_is_idempotent() {
        let store = InMemoryOrphanStore::new();
        let raw = serde_json::json!({"entry_id": 1});
        let ctx = serde_json::json!({});
        let first = OrphanRecord::new(1, "ir/fervidex", raw.clone(), ctx.clone(), 10);
        let again = OrphanRecord::new(1, "ir/fervidex", raw, ctx, 20);

        assert!(store.store(&first).await.unwrap());
        assert!(!store.store(&again).await.unwrap());
        let listed = store.list(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].first_seen, 10);
    }

    #[tokio::test]
    async fn test_record_attempt_and_purge() {
        let store = InMemoryOrphanStore::new();
        let orphan = OrphanRecord::new(3, "t", serde_json::json!(1), serde_json::json!({}), 0);
        store.store(&orphan).await.unwrap();

        store
            .record_attempt(&orphan.orphan_id, 5, Some("still missing"), true)
            .await
            .unwrap();
        let listed = store.list(Some(3)).await.unwrap();
        assert_eq!(listed[0].retry_count, 1);
        assert_eq!(listed[0].last_attempt_at, Some(5));
        assert!(listed[0].exhausted);
        assert!(store.users_with_orphans().await.unwrap().is_empty());

        assert_eq!(store.purge_exhausted(None).await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_lock_conflict_and_token_scoped_release() {
        let locks = InMemoryLocks::new();
        let ttl = Duration::from_secs(60);
        let held = locks.try_acquire(1, LockKind::Import, ttl).await.unwrap().unwrap();
        assert!(locks.try_acquire(1, LockKind::Import, ttl).await.unwrap().is_none());
        // Other kinds and other users do not contend.
        assert!(locks.try_acquire(1, LockKind::Reconcile, ttl).await.unwrap().is_some());
        assert!(locks.try_acquire(2, LockKind::Import, ttl).await.unwrap().is_some());

        let mut forged = held.clone();
        forged.token = "not-ours".to_string();
        assert!(!locks.release(&forged).await.unwrap());
        assert!(locks.release(&held).await.unwrap());
        assert!(!locks.is_held(1, LockKind::Import));
    }

    #[tokio::test]
    async fn test_expired_lock_is_stolen() {
        let locks = InMemoryLocks::new();
        let stale = locks
            .try_acquire(1, LockKind::Import, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let fresh = locks
            .try_acquire(1, LockKind::Import, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stale.token, fresh.token);

        // The previous holder can neither refresh nor release the new lock.
        assert!(!locks.refresh(&stale, Duration::from_secs(60)).await.unwrap());
        assert!(!locks.release(&stale).await.unwrap());
        assert!(locks.is_held(1, LockKind::Import));
    }

    #[tokio::test]
    async fn test_sweep_expired_locks() {
        let locks = InMemoryLocks::new();
        locks.try_acquire(1, LockKind::Import, Duration::ZERO).await.unwrap();
        locks
            .try_acquire(2, LockKind::Import, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(locks.sweep_expired(now_ms()).await.unwrap(), 1);
        assert_eq!(locks.clear_all().await.unwrap(), 1);
    }
}
