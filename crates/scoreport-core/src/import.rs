//! Import orchestrator: one user's import run, end to end.
//!
//! ```text
//! Idle ──▶ LockAcquired ──▶ Iterating ──▶ Summarizing ──▶ LockReleased(Done | Failed)
//!   │                          │ per record:
//!   │                          ├─ converted   → commit (+ PB merge)
//!   │                          ├─ invalid     → skip, log info
//!   │                          ├─ internal    → skip, log error
//!   │                          └─ not found   → orphan
//!   └─ conflict / unknown type / bad context: fail before locking
//! ```
//!
//! Records are handled strictly one at a time in source order. A failed
//! record never aborts the run; a failed commit, PB merge, orphan write,
//! source read, catalog read, or a lost lock does, and the error carries
//! the partial [`ImportSummary`]. A catalog error is never taken as a
//! verdict on the record: the record is neither skipped nor orphaned, and
//! re-running the import picks it up again. The user's import lock is released on every exit
//! path once it has been acquired.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::convert::ErasedConverter;
use crate::failure::{log_failure, Disposition, FailureKind, FailureSite};
use crate::models::{now_ms, Score, UserId};
use crate::pipeline::{CommitResult, Pipeline};
use crate::progress::{ImportEvent, ImportProgressReporter, RecordOutcome, RunState, RunStatus};
use crate::source::RecordSource;
use crate::store::{LockKind, LockToken, OrphanRecord};

#[derive(Debug, Clone)]
pub struct ImportSettings {
    /// How long an import lock stays valid without a heartbeat.
    pub lock_ttl: Duration,
    /// Records processed between lock heartbeats.
    pub heartbeat_every: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(600),
            heartbeat_every: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTiming {
    pub index: usize,
    pub outcome: String,
    pub elapsed_us: u64,
}

/// Aggregate result of one import run.
///
/// `skipped_invalid` counts both invalid and internal failures;
/// `internal_failures` is the internal share of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub user_id: UserId,
    pub import_type: String,
    pub status: RunStatus,
    pub attempted: u64,
    pub committed: u64,
    pub duplicates: u64,
    pub blacklisted: u64,
    pub skipped_invalid: u64,
    pub internal_failures: u64,
    pub orphaned: u64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub elapsed_ms: u64,
    pub score_ids: Vec<String>,
    pub timings: Vec<RecordTiming>,
}

impl ImportSummary {
    fn new(user_id: UserId, import_type: &str) -> Self {
        Self {
            user_id,
            import_type: import_type.to_string(),
            started_at: now_ms(),
            ..Default::default()
        }
    }

    fn record(&mut self, index: usize, outcome: &RecordOutcome, elapsed: Duration) {
        self.attempted += 1;
        match outcome {
            RecordOutcome::Committed { score_id } => {
                self.committed += 1;
                self.score_ids.push(score_id.clone());
            }
            RecordOutcome::Duplicate { .. } => self.duplicates += 1,
            RecordOutcome::Blacklisted { .. } => self.blacklisted += 1,
            RecordOutcome::SkippedInvalid { .. } => self.skipped_invalid += 1,
            RecordOutcome::SkippedInternal { .. } => {
                self.skipped_invalid += 1;
                self.internal_failures += 1;
            }
            RecordOutcome::Orphaned { .. } => self.orphaned += 1,
        }
        self.timings.push(RecordTiming {
            index,
            outcome: outcome.label().to_string(),
            elapsed_us: elapsed.as_micros().min(u64::MAX as u128) as u64,
        });
    }

    fn finish(&mut self, status: RunStatus, started: Instant) {
        self.status = status;
        self.finished_at = Some(now_ms());
        self.elapsed_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;
    }
}

/// Errors that end an import run.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("an import is already in progress for user {user_id}")]
    Conflict { user_id: UserId },

    #[error("no converter registered for import type '{0}'")]
    UnknownImportType(String),

    #[error("invalid import context for '{import_type}': {message}")]
    InvalidContext { import_type: String, message: String },

    #[error("failed to acquire import lock for user {user_id}")]
    Lock {
        user_id: UserId,
        #[source]
        source: anyhow::Error,
    },

    #[error("import lock for user {} was lost after {} records", .summary.user_id, .summary.attempted)]
    LockLost { summary: Box<ImportSummary> },

    #[error("record source failed after {} records", .summary.attempted)]
    Source {
        summary: Box<ImportSummary>,
        #[source]
        source: anyhow::Error,
    },

    #[error("catalog unavailable after {} records", .summary.attempted)]
    Catalog {
        summary: Box<ImportSummary>,
        #[source]
        source: anyhow::Error,
    },

    #[error("commit failed after {} records; score store and PB index may have diverged", .summary.attempted)]
    Commit {
        summary: Box<ImportSummary>,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to store orphan after {} records", .summary.attempted)]
    Orphan {
        summary: Box<ImportSummary>,
        #[source]
        source: anyhow::Error,
    },
}

impl ImportError {
    /// Partial summary of a run that failed after its lock was acquired.
    pub fn summary(&self) -> Option<&ImportSummary> {
        match self {
            ImportError::LockLost { summary }
            | ImportError::Source { summary, .. }
            | ImportError::Catalog { summary, .. }
            | ImportError::Commit { summary, .. }
            | ImportError::Orphan { summary, .. } => Some(&**summary),
            _ => None,
        }
    }
}

/// Run-fatal conditions observed while iterating.
enum Fatal {
    Source(anyhow::Error),
    Catalog(anyhow::Error),
    Commit(anyhow::Error),
    Orphan(anyhow::Error),
    LockLost,
}

pub struct Orchestrator {
    pipeline: Pipeline,
    settings: ImportSettings,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline, settings: ImportSettings) -> Self {
        Self { pipeline, settings }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run one import for `user_id` over every record of `source`.
    pub async fn run(
        &self,
        user_id: UserId,
        source: &mut dyn RecordSource,
        progress: &dyn ImportProgressReporter,
    ) -> Result<ImportSummary, ImportError> {
        progress.report(ImportEvent::StateChanged(RunState::Idle));
        let import_type = source.import_type().to_string();

        let converter = self
            .pipeline
            .converters
            .find(&import_type)
            .ok_or_else(|| ImportError::UnknownImportType(import_type.clone()))?;
        converter
            .validate_context(source.context())
            .map_err(|message| ImportError::InvalidContext {
                import_type: import_type.clone(),
                message,
            })?;

        let token = match self
            .pipeline
            .locks
            .try_acquire(user_id, LockKind::Import, self.settings.lock_ttl)
            .await
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!(user_id, import_type = %import_type, "Import already in progress");
                return Err(ImportError::Conflict { user_id });
            }
            Err(source) => return Err(ImportError::Lock { user_id, source }),
        };
        progress.report(ImportEvent::StateChanged(RunState::LockAcquired));
        info!(user_id, import_type = %import_type, "Import started");

        let started = Instant::now();
        let mut summary = ImportSummary::new(user_id, &import_type);
        let result = self
            .iterate(&token, converter, source, progress, &mut summary)
            .await;

        progress.report(ImportEvent::StateChanged(RunState::Summarizing));
        let status = if result.is_ok() {
            RunStatus::Done
        } else {
            RunStatus::Failed
        };
        summary.finish(status, started);

        match self.pipeline.locks.release(&token).await {
            Ok(true) => {}
            Ok(false) => warn!(user_id, "Import lock was no longer held at release"),
            Err(e) => error!(user_id, error = %format!("{:#}", e), "Failed to release import lock"),
        }
        progress.report(ImportEvent::StateChanged(RunState::LockReleased(status)));

        match result {
            Ok(()) => {
                info!(
                    user_id,
                    import_type = %import_type,
                    attempted = summary.attempted,
                    committed = summary.committed,
                    skipped_invalid = summary.skipped_invalid,
                    orphaned = summary.orphaned,
                    elapsed_ms = summary.elapsed_ms,
                    "Import finished"
                );
                progress.report(ImportEvent::Finished(summary.clone()));
                Ok(summary)
            }
            Err(fatal) => {
                progress.report(ImportEvent::Finished(summary.clone()));
                let cause = match &fatal {
                    Fatal::Source(e) | Fatal::Catalog(e) | Fatal::Commit(e) | Fatal::Orphan(e) => {
                        format!("{:#}", e)
                    }
                    Fatal::LockLost => "lock lost".to_string(),
                };
                let summary = Box::new(summary);
                let err = match fatal {
                    Fatal::Source(source) => ImportError::Source { summary, source },
                    Fatal::Catalog(source) => ImportError::Catalog { summary, source },
                    Fatal::Commit(source) => ImportError::Commit { summary, source },
                    Fatal::Orphan(source) => ImportError::Orphan { summary, source },
                    Fatal::LockLost => ImportError::LockLost { summary },
                };
                error!(
                    user_id,
                    import_type = %import_type,
                    error = %err,
                    cause = %cause,
                    "Import failed"
                );
                Err(err)
            }
        }
    }

    async fn iterate(
        &self,
        token: &LockToken,
        converter: &dyn ErasedConverter,
        source: &mut dyn RecordSource,
        progress: &dyn ImportProgressReporter,
        summary: &mut ImportSummary,
    ) -> Result<(), Fatal> {
        progress.report(ImportEvent::StateChanged(RunState::Iterating));
        let user_id = token.user_id;
        let import_type = source.import_type().to_string();
        let context = source.context().clone();
        let mut index = 0usize;

        loop {
            if index > 0 && index % self.settings.heartbeat_every.max(1) == 0 {
                self.heartbeat(token).await?;
            }

            let raw = match source.next_record().await.map_err(Fatal::Source)? {
                Some(raw) => raw,
                None => break,
            };

            let started = Instant::now();
            let outcome = self
                .handle_record(user_id, &import_type, index, converter, &raw, &context)
                .await?;
            summary.record(index, &outcome, started.elapsed());
            progress.report(ImportEvent::Record { index, outcome });
            index += 1;
        }
        Ok(())
    }

    async fn heartbeat(&self, token: &LockToken) -> Result<(), Fatal> {
        match self
            .pipeline
            .locks
            .refresh(token, self.settings.lock_ttl)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                error!(user_id = token.user_id, "Import lock was taken over mid-run");
                Err(Fatal::LockLost)
            }
            Err(e) => {
                error!(user_id = token.user_id, error = %format!("{:#}", e), "Failed to refresh import lock");
                Err(Fatal::LockLost)
            }
        }
    }

    async fn handle_record(
        &self,
        user_id: UserId,
        import_type: &str,
        index: usize,
        converter: &dyn ErasedConverter,
        raw: &serde_json::Value,
        context: &serde_json::Value,
    ) -> Result<RecordOutcome, Fatal> {
        let converted = self
            .pipeline
            .convert(converter, raw, context)
            .await
            .map_err(Fatal::Catalog)?;
        let failure = match converted {
            Ok(converted) => {
                let score = Score::from_converted(user_id, &converted, now_ms());
                let result = self
                    .pipeline
                    .commit(&score, self.pipeline.blacklist.as_ref())
                    .await
                    .map_err(Fatal::Commit)?;
                let score_id = score.score_id;
                return Ok(match result {
                    CommitResult::Committed => RecordOutcome::Committed { score_id },
                    CommitResult::Duplicate => RecordOutcome::Duplicate { score_id },
                    CommitResult::Blacklisted => RecordOutcome::Blacklisted { score_id },
                });
            }
            Err(failure) => failure,
        };

        log_failure(
            &failure,
            FailureSite {
                user_id,
                import_type,
                record_index: Some(index),
                raw,
                context,
            },
        );

        match failure.disposition() {
            Disposition::Orphan => {
                let orphan =
                    OrphanRecord::new(user_id, import_type, raw.clone(), context.clone(), now_ms());
                let new = self
                    .pipeline
                    .orphans
                    .store(&orphan)
                    .await
                    .map_err(Fatal::Orphan)?;
                Ok(RecordOutcome::Orphaned {
                    orphan_id: orphan.orphan_id,
                    new,
                })
            }
            Disposition::Skip => {
                let message = failure.message().to_string();
                Ok(match failure.kind() {
                    FailureKind::Internal => RecordOutcome::SkippedInternal { message },
                    _ => RecordOutcome::SkippedInvalid { message },
                })
            }
        }
    }
}
