//! Orphan reconciliation: re-run stored orphans through their converter
//! once catalog data may have arrived.
//!
//! | Result of the retry | Action | Counter |
//! |---------------------|--------|---------|
//! | converts, commits (or was already committed) | remove orphan | `success` |
//! | converts, dedup key blacklisted | remove orphan, no commit | `removed` |
//! | still not found | keep, count the attempt | (none) |
//! | any other failure | keep, count the attempt | `failed` |
//! | catalog backend error | keep, attempt not counted | `failed` |
//! | attempted within the backoff window | skip | `deferred` |
//! | retry ceiling reached | keep, mark exhausted | `retired` |
//!
//! Reconciliation for one user holds that user's `reconcile` lock, so a
//! scheduled sweep and an on-demand run never retry the same orphan at the
//! same time. The lock is refreshed every `heartbeat_every` retried orphans;
//! if it was taken over, the sweep stops with [`ReconcileError::LockLost`].
//! It does not take the `import` lock: it only adds committed scores and
//! removes orphans.

use std::ops::AddAssign;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::failure::{log_failure, FailureSite};
use crate::models::{now_ms, Score, UserId};
use crate::pipeline::{CommitResult, Pipeline};
use crate::store::{Blacklist, LockKind, LockToken, OrphanRecord};

#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Attempts after which an orphan is marked exhausted. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
    /// Minimum time between two attempts on the same orphan.
    pub backoff: Duration,
    pub lock_ttl: Duration,
    /// Retried orphans between reconcile lock heartbeats.
    pub heartbeat_every: usize,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::ZERO,
            lock_ttl: Duration::from_secs(600),
            heartbeat_every: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    /// Orphans actually retried (neither deferred nor already exhausted).
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub removed: u64,
    pub retired: u64,
    pub deferred: u64,
}

impl AddAssign for ReconcileOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.processed += rhs.processed;
        self.success += rhs.success;
        self.failed += rhs.failed;
        self.removed += rhs.removed;
        self.retired += rhs.retired;
        self.deferred += rhs.deferred;
    }
}

/// Result of [`Reconciler::reconcile_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub users: Vec<(UserId, ReconcileOutcome)>,
    /// Users skipped because another reconciliation held their lock, or
    /// took it over mid-sweep.
    pub busy_users: Vec<UserId>,
    pub total: ReconcileOutcome,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("a reconciliation is already running for user {0}")]
    Busy(UserId),
    #[error("reconcile lock for user {} was lost after {} orphans", .user_id, .outcome.processed)]
    LockLost {
        user_id: UserId,
        /// What the sweep did before it stopped.
        outcome: ReconcileOutcome,
    },
    #[error("orphan store unavailable")]
    Store(#[source] anyhow::Error),
}

enum Attempt {
    Resolved,
    Blacklisted,
    StillMissing(String),
    Failed(String),
    CatalogUnavailable,
}

pub struct Reconciler {
    pipeline: Pipeline,
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(pipeline: Pipeline, policy: ReconcilePolicy) -> Self {
        Self { pipeline, policy }
    }

    /// Retry every pending orphan of one user.
    ///
    /// Failures of individual orphans are tallied in the outcome, never
    /// returned.
    pub async fn reconcile_user(
        &self,
        user_id: UserId,
        blacklist: &dyn Blacklist,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let token = self
            .pipeline
            .locks
            .try_acquire(user_id, LockKind::Reconcile, self.policy.lock_ttl)
            .await
            .map_err(ReconcileError::Store)?
            .ok_or(ReconcileError::Busy(user_id))?;

        let result = self.sweep_user(&token, blacklist).await;

        match self.pipeline.locks.release(&token).await {
            Ok(true) => {}
            Ok(false) => warn!(user_id, "Reconcile lock was no longer held at release"),
            Err(e) => error!(user_id, error = %format!("{:#}", e), "Failed to release reconcile lock"),
        }
        result
    }

    /// Reconcile every user with pending orphans, skipping users whose
    /// reconciliation is already running.
    pub async fn reconcile_all(
        &self,
        blacklist: &dyn Blacklist,
    ) -> Result<SweepReport, ReconcileError> {
        let users = self
            .pipeline
            .orphans
            .users_with_orphans()
            .await
            .map_err(ReconcileError::Store)?;

        let mut report = SweepReport::default();
        for user_id in users {
            match self.reconcile_user(user_id, blacklist).await {
                Ok(outcome) => {
                    report.total += outcome;
                    report.users.push((user_id, outcome));
                }
                Err(ReconcileError::Busy(user_id)) => {
                    debug!(user_id, "Reconciliation already running, skipping user");
                    report.busy_users.push(user_id);
                }
                Err(ReconcileError::LockLost { user_id, outcome }) => {
                    report.total += outcome;
                    report.busy_users.push(user_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    async fn sweep_user(
        &self,
        token: &LockToken,
        blacklist: &dyn Blacklist,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let user_id = token.user_id;
        let orphans = self
            .pipeline
            .orphans
            .list(Some(user_id))
            .await
            .map_err(ReconcileError::Store)?;

        let now = now_ms();
        let backoff_ms = self.policy.backoff.as_millis().min(i64::MAX as u128) as i64;
        let mut outcome = ReconcileOutcome::default();

        for orphan in &orphans {
            if orphan.exhausted {
                outcome.retired += 1;
                continue;
            }
            if let Some(last) = orphan.last_attempt_at {
                if now.saturating_sub(last) < backoff_ms {
                    outcome.deferred += 1;
                    continue;
                }
            }
            if outcome.processed > 0
                && outcome.processed % self.policy.heartbeat_every.max(1) as u64 == 0
                && !self.heartbeat(token).await
            {
                return Err(ReconcileError::LockLost { user_id, outcome });
            }
            outcome.processed += 1;

            match self.attempt(orphan, blacklist).await {
                Attempt::Resolved => {
                    if self.remove(orphan).await {
                        outcome.success += 1;
                    } else {
                        outcome.failed += 1;
                    }
                }
                Attempt::Blacklisted => {
                    if self.remove(orphan).await {
                        outcome.removed += 1;
                    } else {
                        outcome.failed += 1;
                    }
                }
                Attempt::StillMissing(message) => {
                    if self.record_attempt(orphan, &message).await {
                        outcome.retired += 1;
                    }
                }
                Attempt::Failed(message) => {
                    outcome.failed += 1;
                    if self.record_attempt(orphan, &message).await {
                        outcome.retired += 1;
                    }
                }
                Attempt::CatalogUnavailable => outcome.failed += 1,
            }
        }

        info!(
            user_id,
            processed = outcome.processed,
            success = outcome.success,
            failed = outcome.failed,
            removed = outcome.removed,
            retired = outcome.retired,
            deferred = outcome.deferred,
            "Reconciled orphans"
        );
        Ok(outcome)
    }

    /// Refresh the reconcile lock. False once it is no longer ours.
    async fn heartbeat(&self, token: &LockToken) -> bool {
        match self.pipeline.locks.refresh(token, self.policy.lock_ttl).await {
            Ok(true) => true,
            Ok(false) => {
                error!(user_id = token.user_id, "Reconcile lock was taken over mid-sweep");
                false
            }
            Err(e) => {
                error!(user_id = token.user_id, error = %format!("{:#}", e), "Failed to refresh reconcile lock");
                false
            }
        }
    }

    async fn attempt(&self, orphan: &OrphanRecord, blacklist: &dyn Blacklist) -> Attempt {
        let Some(converter) = self.pipeline.converters.find(&orphan.import_type) else {
            let message = format!("no converter registered for import type '{}'", orphan.import_type);
            error!(orphan_id = %orphan.orphan_id, user_id = orphan.user_id, "{}", message);
            return Attempt::Failed(message);
        };

        let converted = match self
            .pipeline
            .convert(converter, &orphan.raw, &orphan.context)
            .await
        {
            Err(e) => {
                error!(
                    orphan_id = %orphan.orphan_id,
                    user_id = orphan.user_id,
                    error = %format!("{:#}", e),
                    "Catalog unavailable, orphan left untouched"
                );
                return Attempt::CatalogUnavailable;
            }
            Ok(Ok(converted)) => converted,
            Ok(Err(failure)) => {
                log_failure(
                    &failure,
                    FailureSite {
                        user_id: orphan.user_id,
                        import_type: &orphan.import_type,
                        record_index: None,
                        raw: &orphan.raw,
                        context: &orphan.context,
                    },
                );
                let message = failure.message().to_string();
                return if failure.is_retryable() {
                    Attempt::StillMissing(message)
                } else {
                    Attempt::Failed(message)
                };
            }
        };

        let score = Score::from_converted(orphan.user_id, &converted, now_ms());
        match self.pipeline.commit(&score, blacklist).await {
            Ok(CommitResult::Committed) | Ok(CommitResult::Duplicate) => {
                info!(
                    orphan_id = %orphan.orphan_id,
                    score_id = %score.score_id,
                    user_id = orphan.user_id,
                    "Orphan resolved"
                );
                Attempt::Resolved
            }
            Ok(CommitResult::Blacklisted) => {
                info!(
                    orphan_id = %orphan.orphan_id,
                    score_id = %score.score_id,
                    user_id = orphan.user_id,
                    "Orphan matches blacklist, discarding"
                );
                Attempt::Blacklisted
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(
                    orphan_id = %orphan.orphan_id,
                    score_id = %score.score_id,
                    user_id = orphan.user_id,
                    error = %message,
                    "Failed to commit reconciled orphan"
                );
                Attempt::Failed(message)
            }
        }
    }

    async fn remove(&self, orphan: &OrphanRecord) -> bool {
        match self.pipeline.orphans.remove(&orphan.orphan_id).await {
            Ok(_) => true,
            Err(e) => {
                error!(orphan_id = %orphan.orphan_id, error = %format!("{:#}", e), "Failed to remove orphan");
                false
            }
        }
    }

    /// Count a failed retry. Returns true when it exhausted the orphan.
    async fn record_attempt(&self, orphan: &OrphanRecord, message: &str) -> bool {
        let exhausted = self
            .policy
            .max_attempts
            .map_or(false, |max| orphan.retry_count + 1 >= max);
        if let Err(e) = self
            .pipeline
            .orphans
            .record_attempt(&orphan.orphan_id, now_ms(), Some(message), exhausted)
            .await
        {
            error!(orphan_id = %orphan.orphan_id, error = %format!("{:#}", e), "Failed to record orphan attempt");
            return false;
        }
        if exhausted {
            warn!(
                orphan_id = %orphan.orphan_id,
                user_id = orphan.user_id,
                attempts = orphan.retry_count + 1,
                "Orphan exhausted its retries"
            );
        }
        exhausted
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::convert::fixtures::{registry, TEST_IMPORT_TYPE};
    use crate::import::{ImportSettings, Orchestrator};
    use crate::models::fixtures::{chart_spa, song};
    use crate::models::{Chart, ChartQuery, Game, Song};
    use crate::progress::NoProgress;
    use crate::source::VecSource;
    use crate::store::memory::{InMemoryLocks, MemoryBackend};
    use crate::store::{Catalog, OrphanStore, UserLocks};

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.catalog.add_song(song());
        backend.catalog.add_chart(chart_spa());
        backend
    }

    fn missing_chart() -> Chart {
        let mut chart = chart_spa();
        chart.chart_id = "late-chart".to_string();
        chart.in_game_id = 2000;
        chart
    }

    async fn orphan_one(backend: &MemoryBackend, user_id: UserId, record: Value) {
        let orch = Orchestrator::new(backend.pipeline(registry()), ImportSettings::default());
        let mut src = VecSource::new(TEST_IMPORT_TYPE, json!({"service": "Test"}), vec![record]);
        let summary = orch.run(user_id, &mut src, &NoProgress).await.unwrap();
        assert_eq!(summary.orphaned, 1);
    }

    fn reconciler(backend: &MemoryBackend, policy: ReconcilePolicy) -> Reconciler {
        Reconciler::new(backend.pipeline(registry()), policy)
    }

    #[tokio::test]
    async fn test_orphan_converges_once_chart_arrives() {
        let backend = backend();
        orphan_one(&backend, 1, json!({"entry_id": 2000, "score": 10, "lamp": "FAILED"})).await;
        let rec = reconciler(&backend, ReconcilePolicy::default());
        let none = HashSet::new();

        let outcome = rec.reconcile_user(1, &none).await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.success, 0);
        assert_eq!(outcome.failed, 0);
        let pending = backend.orphans.list(Some(1)).await.unwrap();
        assert_eq!(pending[0].retry_count, 1);

        backend.catalog.add_chart(missing_chart());
        let outcome = rec.reconcile_user(1, &none).await.unwrap();
        assert_eq!(outcome.success, 1);
        assert!(backend.orphans.is_empty());
        assert_eq!(backend.scores.scores().len(), 1);
        assert!(backend.scores.personal_best(1, "late-chart").is_some());
        assert!(!backend.locks.is_held(1, LockKind::Reconcile));
    }

    #[tokio::test]
    async fn test_blacklisted_orphan_is_discarded() {
        let backend = backend();
        let record = json!({"entry_id": 2000, "score": 10, "lamp": "FAILED", "at": 7});
        orphan_one(&backend, 1, record).await;
        backend.catalog.add_chart(missing_chart());

        // Work out the dedup key the orphan will resolve to.
        let orphan = backend.orphans.list(Some(1)).await.unwrap().remove(0);
        let converted = registry()
            .find(TEST_IMPORT_TYPE)
            .unwrap()
            .convert_value(&orphan.raw, &orphan.context, backend.catalog.as_ref())
            .await
            .unwrap();
        let key = crate::dedup::score_id(1, &converted.chart, &converted.dry_score);
        let blacklist: HashSet<String> = [key].into_iter().collect();

        let outcome = reconciler(&backend, ReconcilePolicy::default())
            .reconcile_user(1, &blacklist)
            .await
            .unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.success, 0);
        assert!(backend.orphans.is_empty());
        assert!(backend.scores.scores().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_kept_and_counted() {
        let backend = backend();
        // Becomes invalid once its chart resolves: 9999 exceeds the max score.
        orphan_one(&backend, 1, json!({"entry_id": 2000, "score": 9999, "lamp": "FAILED"})).await;
        backend.catalog.add_chart(missing_chart());

        let outcome = reconciler(&backend, ReconcilePolicy::default())
            .reconcile_user(1, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(outcome.failed, 1);
        let kept = backend.orphans.list(Some(1)).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].last_error.as_deref().unwrap().starts_with("Invalid percent"));
    }

    #[tokio::test]
    async fn test_retry_ceiling_exhausts_orphan() {
        let backend = backend();
        orphan_one(&backend, 1, json!({"entry_id": 2000, "score": 10, "lamp": "FAILED"})).await;
        let policy = ReconcilePolicy {
            max_attempts: Some(2),
            ..Default::default()
        };
        let rec = reconciler(&backend, policy);
        let none = HashSet::new();

        assert_eq!(rec.reconcile_user(1, &none).await.unwrap().retired, 0);
        assert_eq!(rec.reconcile_user(1, &none).await.unwrap().retired, 1);

        // Exhausted orphans stay listed but are no longer retried.
        backend.catalog.add_chart(missing_chart());
        let outcome = rec.reconcile_user(1, &none).await.unwrap();
        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.retired, 1);
        assert_eq!(backend.orphans.len(), 1);
        assert!(backend.orphans.users_with_orphans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backoff_defers_recent_attempts() {
        let backend = backend();
        orphan_one(&backend, 1, json!({"entry_id": 2000, "score": 10, "lamp": "FAILED"})).await;
        let policy = ReconcilePolicy {
            backoff: Duration::from_secs(3600),
            ..Default::default()
        };
        let rec = reconciler(&backend, policy);
        let none = HashSet::new();

        assert_eq!(rec.reconcile_user(1, &none).await.unwrap().processed, 1);
        let second = rec.reconcile_user(1, &none).await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.deferred, 1);
    }

    #[tokio::test]
    async fn test_concurrent_reconcile_for_same_user_is_busy() {
        let backend = backend();
        orphan_one(&backend, 1, json!({"entry_id": 2000, "score": 10, "lamp": "FAILED"})).await;
        orphan_one(&backend, 2, json!({"entry_id": 2000, "score": 20, "lamp": "FAILED"})).await;
        let held = backend
            .locks
            .try_acquire(1, LockKind::Reconcile, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let rec = reconciler(&backend, ReconcilePolicy::default());
        let none = HashSet::new();
        assert!(matches!(
            rec.reconcile_user(1, &none).await,
            Err(ReconcileError::Busy(1))
        ));

        backend.catalog.add_chart(missing_chart());
        let report = rec.reconcile_all(&none).await.unwrap();
        assert_eq!(report.busy_users, vec![1]);
        assert_eq!(report.users.len(), 1);
        assert_eq!(report.total.success, 1);

        // An import lock does not block reconciliation.
        backend.locks.release(&held).await.unwrap();
        backend
            .locks
            .try_acquire(1, LockKind::Import, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(rec.reconcile_user(1, &none).await.unwrap().success, 1);
    }

    /// Blacklist whose first lookup simulates another reconciler taking
    /// over the user's lock.
    struct StealingBlacklist {
        locks: Arc<InMemoryLocks>,
        stolen: AtomicBool,
    }

    #[async_trait]
    impl Blacklist for StealingBlacklist {
        async fn contains(&self, _score_id: &str) -> anyhow::Result<bool> {
            if !self.stolen.swap(true, Ordering::SeqCst) {
                self.locks.clear_all().await?;
                self.locks
                    .try_acquire(1, LockKind::Reconcile, Duration::from_secs(60))
                    .await?;
            }
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_lost_reconcile_lock_stops_sweep() {
        let backend = backend();
        for score in [10, 20, 30] {
            orphan_one(&backend, 1, json!({"entry_id": 2000, "score": score, "lamp": "FAILED"}))
                .await;
        }
        backend.catalog.add_chart(missing_chart());
        let policy = ReconcilePolicy {
            heartbeat_every: 1,
            ..Default::default()
        };
        let thief = StealingBlacklist {
            locks: backend.locks.clone(),
            stolen: AtomicBool::new(false),
        };

        let err = reconciler(&backend, policy)
            .reconcile_user(1, &thief)
            .await
            .unwrap_err();
        match err {
            ReconcileError::LockLost { user_id, outcome } => {
                assert_eq!(user_id, 1);
                assert_eq!(outcome.processed, 1);
                assert_eq!(outcome.success, 1);
            }
            other => panic!("expected LockLost, got {:?}", other),
        }
        // The two orphans after the takeover were left to the new holder.
        assert_eq!(backend.orphans.len(), 2);
        assert!(backend.locks.is_held(1, LockKind::Reconcile));
    }

    struct UnreachableCatalog;

    #[async_trait]
    impl Catalog for UnreachableCatalog {
        async fn find_chart(&self, _query: &ChartQuery) -> anyhow::Result<Option<Chart>> {
            bail!("database is locked")
        }

        async fn find_song(&self, _game: Game, _song_id: i64) -> anyhow::Result<Option<Song>> {
            bail!("database is locked")
        }
    }

    #[tokio::test]
    async fn test_catalog_outage_does_not_spend_retries() {
        let backend = backend();
        orphan_one(&backend, 1, json!({"entry_id": 2000, "score": 10, "lamp": "FAILED"})).await;
        let mut pipeline = backend.pipeline(registry());
        pipeline.catalog = Arc::new(UnreachableCatalog);
        let policy = ReconcilePolicy {
            max_attempts: Some(1),
            ..Default::default()
        };

        let outcome = Reconciler::new(pipeline, policy)
            .reconcile_user(1, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.retired, 0);
        let kept = backend.orphans.list(Some(1)).await.unwrap();
        assert_eq!(kept[0].retry_count, 0);
        assert!(!kept[0].exhausted);
    }
}
