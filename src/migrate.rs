//! Schema migrations. Every statement is idempotent, so `scoreport init`
//! can run any number of times.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    // Reference catalog (read-only to the pipeline)
    r#"
    CREATE TABLE IF NOT EXISTS songs (
        game TEXT NOT NULL,
        id INTEGER NOT NULL,
        title TEXT NOT NULL,
        artist TEXT NOT NULL,
        PRIMARY KEY (game, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS charts (
        chart_id TEXT PRIMARY KEY,
        song_id INTEGER NOT NULL,
        game TEXT NOT NULL,
        playtype TEXT NOT NULL,
        difficulty TEXT NOT NULL,
        in_game_id INTEGER NOT NULL,
        versions_json TEXT NOT NULL DEFAULT '[]',
        is_primary INTEGER NOT NULL DEFAULT 1,
        level TEXT NOT NULL,
        notecount INTEGER NOT NULL,
        hash_sha256 TEXT
    )
    "#,
    // Committed scores, keyed by dedup key
    r#"
    CREATE TABLE IF NOT EXISTS scores (
        score_id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        chart_id TEXT NOT NULL,
        song_id INTEGER NOT NULL,
        game TEXT NOT NULL,
        playtype TEXT NOT NULL,
        import_type TEXT NOT NULL,
        score INTEGER NOT NULL,
        lamp TEXT NOT NULL,
        time_achieved INTEGER,
        time_added INTEGER NOT NULL,
        score_json TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS personal_bests (
        user_id INTEGER NOT NULL,
        chart_id TEXT NOT NULL,
        best_score INTEGER NOT NULL,
        best_score_id TEXT NOT NULL,
        best_lamp TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (user_id, chart_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orphan_scores (
        orphan_id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        import_type TEXT NOT NULL,
        raw_json TEXT NOT NULL,
        context_json TEXT NOT NULL,
        first_seen INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_attempt_at INTEGER,
        exhausted INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS import_locks (
        user_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        token TEXT NOT NULL,
        acquired_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        PRIMARY KEY (user_id, kind)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS score_blacklist (
        score_id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        added_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS imports (
        import_id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        import_type TEXT NOT NULL,
        source_sha256 TEXT,
        status TEXT NOT NULL,
        summary_json TEXT,
        error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_charts_in_game ON charts(game, in_game_id, playtype, difficulty)",
    "CREATE INDEX IF NOT EXISTS idx_charts_hash ON charts(game, hash_sha256)",
    "CREATE INDEX IF NOT EXISTS idx_scores_user_chart ON scores(user_id, chart_id)",
    "CREATE INDEX IF NOT EXISTS idx_orphans_user ON orphan_scores(user_id, first_seen)",
    "CREATE INDEX IF NOT EXISTS idx_imports_user ON imports(user_id, created_at DESC)",
];

/// Apply the schema to an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}
