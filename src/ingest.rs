//! Import runs against the SQLite backend.
//!
//! Wraps the core [`Orchestrator`] with what a deployment needs around it:
//! the record file is opened, the run is registered in the `imports` table
//! (status `running`), the orchestrator drives it, and the final status,
//! summary, and error are written back so `scoreport imports show` can
//! poll it. Runs execute inline ([`run_import`]) or on a tokio task
//! ([`spawn_import`]).

use std::error::Error;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use scoreport_core::import::{ImportError, ImportSummary, Orchestrator};
use scoreport_core::models::{now_ms, UserId};
use scoreport_core::progress::{ImportProgressReporter, RunStatus};

use crate::config::Config;
use crate::converters;
use crate::db;
use crate::sources::FileSource;
use crate::sqlite_store;

/// What to import, for whom.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub user_id: UserId,
    pub import_type: String,
    pub path: PathBuf,
    pub context: Value,
}

/// One row of the `imports` table.
#[derive(Debug, Clone, Serialize)]
pub struct ImportRun {
    pub import_id: String,
    pub user_id: UserId,
    pub import_type: String,
    pub source_sha256: Option<String>,
    pub status: RunStatus,
    pub summary: Option<ImportSummary>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Open a connection, run one import inline, and return its stored record.
///
/// A run that fails after it was registered is still `Ok`: its status is
/// `failed` and `error` says why.
pub async fn run_import(
    config: &Config,
    request: &ImportRequest,
    progress: &dyn ImportProgressReporter,
) -> Result<ImportRun> {
    let pool = db::connect(config).await?;
    let result = import_with_pool(&pool, config, request, progress).await;
    pool.close().await;
    result
}

/// Run one import inline on an existing pool.
pub async fn import_with_pool(
    pool: &SqlitePool,
    config: &Config,
    request: &ImportRequest,
    progress: &dyn ImportProgressReporter,
) -> Result<ImportRun> {
    let (import_id, mut source) = register(pool, request).await?;
    execute(pool, config, &import_id, request.user_id, &mut source, progress).await?;
    poll_import(pool, &import_id)
        .await?
        .with_context(|| format!("import {} vanished", import_id))
}

/// Register a run and execute it on a tokio task.
///
/// Returns as soon as the run is registered; the import ID is pollable
/// with [`poll_import`] from then on. File errors surface here, before
/// any task is spawned.
pub async fn spawn_import(
    pool: SqlitePool,
    config: Config,
    request: ImportRequest,
    progress: Box<dyn ImportProgressReporter>,
) -> Result<(String, JoinHandle<Result<()>>)> {
    let (import_id, mut source) = register(&pool, &request).await?;
    let task_id = import_id.clone();
    let handle = tokio::spawn(async move {
        execute(
            &pool,
            &config,
            &task_id,
            request.user_id,
            &mut source,
            progress.as_ref(),
        )
        .await
    });
    Ok((import_id, handle))
}

/// Stored record of an import run, if it exists.
pub async fn poll_import(pool: &SqlitePool, import_id: &str) -> Result<Option<ImportRun>> {
    let row = sqlx::query(
        "SELECT import_id, user_id, import_type, source_sha256, status, summary_json, error, \
         created_at, updated_at FROM imports WHERE import_id = ?",
    )
    .bind(import_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let status = match row.try_get::<String, _>("status")?.as_str() {
        "done" => RunStatus::Done,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Running,
    };
    let summary: Option<String> = row.try_get("summary_json")?;
    Ok(Some(ImportRun {
        import_id: row.try_get("import_id")?,
        user_id: row.try_get("user_id")?,
        import_type: row.try_get("import_type")?,
        source_sha256: row.try_get("source_sha256")?,
        status,
        summary: summary
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .context("corrupt summary_json")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

async fn register(pool: &SqlitePool, request: &ImportRequest) -> Result<(String, FileSource)> {
    let source = FileSource::open(&request.path, &request.import_type, request.context.clone())?;
    let import_id = Uuid::new_v4().to_string();
    let now = now_ms();

    sqlx::query(
        r#"
        INSERT INTO imports (import_id, user_id, import_type, source_sha256, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&import_id)
    .bind(request.user_id)
    .bind(&request.import_type)
    .bind(source.sha256())
    .bind(RunStatus::Running.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("Failed to register import run")?;

    info!(
        import_id = %import_id,
        user_id = request.user_id,
        import_type = %request.import_type,
        path = %request.path.display(),
        "Import registered"
    );
    Ok((import_id, source))
}

async fn execute(
    pool: &SqlitePool,
    config: &Config,
    import_id: &str,
    user_id: UserId,
    source: &mut FileSource,
    progress: &dyn ImportProgressReporter,
) -> Result<()> {
    let pipeline = sqlite_store::pipeline(pool, converters::builtin());
    let orchestrator = Orchestrator::new(pipeline, config.import_settings());

    let (status, summary, error_text) = match orchestrator.run(user_id, source, progress).await {
        Ok(summary) => (RunStatus::Done, Some(summary), None),
        Err(e) => {
            let text = error_chain(&e);
            error!(import_id = %import_id, user_id, error = %text, "Import failed");
            (RunStatus::Failed, e.summary().cloned(), Some(text))
        }
    };

    sqlx::query(
        "UPDATE imports SET status = ?, summary_json = ?, error = ?, updated_at = ? \
         WHERE import_id = ?",
    )
    .bind(status.as_str())
    .bind(summary.as_ref().map(serde_json::to_string).transpose()?)
    .bind(&error_text)
    .bind(now_ms())
    .bind(import_id)
    .execute(pool)
    .await
    .with_context(|| format!("Failed to record outcome of import {}", import_id))?;

    Ok(())
}

fn error_chain(e: &ImportError) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// Print a stored run in the CLI's summary format.
pub fn print_run(run: &ImportRun) {
    println!("import {}", run.import_type);
    println!("  import id: {}", run.import_id);
    println!("  user: {}", run.user_id);
    println!("  status: {}", run.status.as_str());
    if let Some(summary) = &run.summary {
        println!("  attempted: {}", summary.attempted);
        println!("  committed: {}", summary.committed);
        println!("  duplicates: {}", summary.duplicates);
        println!("  blacklisted: {}", summary.blacklisted);
        println!(
            "  skipped: {} ({} internal)",
            summary.skipped_invalid, summary.internal_failures
        );
        println!("  orphaned: {}", summary.orphaned);
        println!("  elapsed: {} ms", summary.elapsed_ms);
    }
    if let Some(error) = &run.error {
        println!("  error: {}", error);
    }
}
