//! The collaborator bundle shared by the orchestrator and the reconciler,
//! and the convert and commit paths both of them use.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::convert::{ConverterRegistry, ErasedConverter};
use crate::failure::ConversionFailure;
use crate::models::{Chart, ChartQuery, Converted, Game, Score, Song};
use crate::store::{Blacklist, Catalog, OrphanStore, PersonalBestMerge, ScoreStore, UserLocks};

#[derive(Clone)]
pub struct Pipeline {
    pub catalog: Arc<dyn Catalog>,
    pub scores: Arc<dyn ScoreStore>,
    pub personal_bests: Arc<dyn PersonalBestMerge>,
    pub orphans: Arc<dyn OrphanStore>,
    pub locks: Arc<dyn UserLocks>,
    /// Blacklist consulted by imports. Reconciliation takes its own.
    pub blacklist: Arc<dyn Blacklist>,
    pub converters: Arc<ConverterRegistry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Committed,
    /// The dedup key was already committed; only the PB merge was redone.
    Duplicate,
    /// The dedup key is blacklisted; nothing was written.
    Blacklisted,
}

impl Pipeline {
    /// Run one record through `converter` against the catalog.
    ///
    /// The outer `Err` means the catalog backend failed during conversion.
    /// Whatever failure the converter derived from that error says nothing
    /// about the record, so callers must not skip or orphan it.
    pub async fn convert(
        &self,
        converter: &dyn ErasedConverter,
        raw: &Value,
        context: &Value,
    ) -> Result<Result<Converted, ConversionFailure>> {
        let catalog = ObservedCatalog::new(self.catalog.as_ref());
        let result = converter.convert_value(raw, context, &catalog).await;
        match (result, catalog.take_error()) {
            (Err(_), Some(error)) => Err(anyhow!("catalog lookup failed: {}", error)),
            (result, _) => Ok(result),
        }
    }

    /// Commit a converted score and fold it into the PB index.
    ///
    /// The PB merge also runs for duplicates: it is a max-merge, and it
    /// repairs a PB index left behind by an earlier run that committed the
    /// score but failed to merge it.
    ///
    /// Any `Err` means the score store and PB index may have diverged and
    /// must abort the caller's run.
    pub async fn commit(&self, score: &Score, blacklist: &dyn Blacklist) -> Result<CommitResult> {
        if blacklist
            .contains(&score.score_id)
            .await
            .with_context(|| format!("failed to check blacklist for {}", score.score_id))?
        {
            debug!(score_id = %score.score_id, "Score is blacklisted, not committing");
            return Ok(CommitResult::Blacklisted);
        }

        let inserted = self
            .scores
            .insert_score(score)
            .await
            .with_context(|| format!("failed to insert score {}", score.score_id))?;
        if !inserted {
            debug!(score_id = %score.score_id, "Score already committed");
        }

        self.personal_bests.apply(score).await.with_context(|| {
            format!(
                "failed to merge personal best for user {} on chart {}",
                score.user_id, score.chart_id
            )
        })?;
        Ok(if inserted {
            CommitResult::Committed
        } else {
            CommitResult::Duplicate
        })
    }
}

/// Catalog view that remembers the first backend error it passed through.
struct ObservedCatalog<'a> {
    inner: &'a dyn Catalog,
    error: Mutex<Option<String>>,
}

impl<'a> ObservedCatalog<'a> {
    fn new(inner: &'a dyn Catalog) -> Self {
        Self {
            inner,
            error: Mutex::new(None),
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            let mut error = self.error.lock().unwrap();
            if error.is_none() {
                *error = Some(format!("{:#}", e));
            }
        }
        result
    }

    fn take_error(&self) -> Option<String> {
        self.error.lock().unwrap().take()
    }
}

#[async_trait]
impl Catalog for ObservedCatalog<'_> {
    async fn find_chart(&self, query: &ChartQuery) -> Result<Option<Chart>> {
        self.observe(self.inner.find_chart(query).await)
    }

    async fn find_song(&self, game: Game, song_id: i64) -> Result<Option<Song>> {
        self.observe(self.inner.find_song(game, song_id).await)
    }
}
