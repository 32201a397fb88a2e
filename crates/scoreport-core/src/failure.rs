//! Conversion failure taxonomy.
//!
//! Every record a converter rejects falls into exactly one of three kinds,
//! and the kind alone decides what happens to the record:
//!
//! | Kind | Fault | Disposition | Log level |
//! |------|-------|-------------|-----------|
//! | [`InvalidScore`](ConversionFailure::InvalidScore) | user data | discard | info |
//! | [`SongOrChartNotFound`](ConversionFailure::SongOrChartNotFound) | catalog lag | orphan, retry later | info |
//! | [`Internal`](ConversionFailure::Internal) | pipeline bug | discard | error |

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use crate::models::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionFailure {
    /// The record itself is malformed or out of its format's legal domain.
    #[error("invalid score: {0}")]
    InvalidScore(String),
    /// The record is well-formed but the catalog lacks its chart or song.
    #[error("song or chart not found: {0}")]
    SongOrChartNotFound(String),
    /// An assumption the pipeline relies on was violated.
    #[error("internal failure: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidScore,
    SongOrChartNotFound,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidScore => "invalid",
            FailureKind::SongOrChartNotFound => "not_found",
            FailureKind::Internal => "internal",
        }
    }
}

/// What the orchestrator does with a failed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Permanently discard; re-ingesting would fail identically.
    Skip,
    /// Persist as an orphan for a later reconciliation pass.
    Orphan,
}

impl ConversionFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConversionFailure::InvalidScore(_) => FailureKind::InvalidScore,
            ConversionFailure::SongOrChartNotFound(_) => FailureKind::SongOrChartNotFound,
            ConversionFailure::Internal(_) => FailureKind::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ConversionFailure::InvalidScore(m)
            | ConversionFailure::SongOrChartNotFound(m)
            | ConversionFailure::Internal(m) => m,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            ConversionFailure::SongOrChartNotFound(_) => Disposition::Orphan,
            ConversionFailure::InvalidScore(_) | ConversionFailure::Internal(_) => {
                Disposition::Skip
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Orphan
    }
}

/// Where a failure was observed, attached to its log line.
#[derive(Debug, Clone, Copy)]
pub struct FailureSite<'a> {
    pub user_id: UserId,
    pub import_type: &'a str,
    /// Position in the import run, or `None` during reconciliation.
    pub record_index: Option<usize>,
    pub raw: &'a Value,
    pub context: &'a Value,
}

/// Log a failure at the level its kind calls for, with the offending
/// record and context attached.
pub fn log_failure(failure: &ConversionFailure, site: FailureSite<'_>) {
    let raw = site.raw.to_string();
    let context = site.context.to_string();
    match failure.kind() {
        FailureKind::InvalidScore => info!(
            user_id = site.user_id,
            import_type = site.import_type,
            record_index = site.record_index,
            failure = "invalid",
            raw = %raw,
            context = %context,
            "Skipping invalid score: {}",
            failure.message()
        ),
        FailureKind::SongOrChartNotFound => info!(
            user_id = site.user_id,
            import_type = site.import_type,
            record_index = site.record_index,
            failure = "not_found",
            raw = %raw,
            context = %context,
            "Orphaning score: {}",
            failure.message()
        ),
        FailureKind::Internal => error!(
            user_id = site.user_id,
            import_type = site.import_type,
            record_index = site.record_index,
            failure = "internal",
            raw = %raw,
            context = %context,
            "Internal failure while converting score: {}",
            failure.message()
        ),
    }
}
