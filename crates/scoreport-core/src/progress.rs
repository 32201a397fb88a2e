//! Import run states and progress events.
//!
//! The orchestrator reports every state transition and every per-record
//! outcome to an injected [`ImportProgressReporter`]. Rendering (stderr,
//! JSON lines) lives in the application crate.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::import::ImportSummary;

/// Overall status of an import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        }
    }
}

/// Orchestrator state machine:
///
/// ```text
/// Idle → LockAcquired → Iterating → Summarizing → LockReleased(Done | Failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "status", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    LockAcquired,
    Iterating,
    Summarizing,
    LockReleased(RunStatus),
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Committed { score_id: String },
    /// Already committed by an earlier run.
    Duplicate { score_id: String },
    Blacklisted { score_id: String },
    SkippedInvalid { message: String },
    SkippedInternal { message: String },
    /// `new` is false when the same orphan was already stored.
    Orphaned { orphan_id: String, new: bool },
}

impl RecordOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RecordOutcome::Committed { .. } => "committed",
            RecordOutcome::Duplicate { .. } => "duplicate",
            RecordOutcome::Blacklisted { .. } => "blacklisted",
            RecordOutcome::SkippedInvalid { .. } => "skipped_invalid",
            RecordOutcome::SkippedInternal { .. } => "skipped_internal",
            RecordOutcome::Orphaned { .. } => "orphaned",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ImportEvent {
    StateChanged(RunState),
    Record { index: usize, outcome: RecordOutcome },
    Finished(ImportSummary),
}

/// Receives import progress. Called inline from the orchestrator, so
/// implementations must not block.
pub trait ImportProgressReporter: Send + Sync {
    fn report(&self, event: ImportEvent);
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ImportProgressReporter for NoProgress {
    fn report(&self, _event: ImportEvent) {}
}

/// Collects every event; used to assert on state transitions.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ImportEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ImportEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<RunState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ImportEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

impl ImportProgressReporter for RecordingProgress {
    fn report(&self, event: ImportEvent) {
        self.events.lock().unwrap().push(event);
    }
}
