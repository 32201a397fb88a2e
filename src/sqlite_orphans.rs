//! SQLite-backed [`OrphanStore`]. Raw records and contexts are stored as
//! JSON text, exactly as the source delivered them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use scoreport_core::models::UserId;
use scoreport_core::store::{OrphanRecord, OrphanStore};

pub struct SqliteOrphanStore {
    pool: SqlitePool,
}

impl SqliteOrphanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn orphan_from_row(row: &SqliteRow) -> Result<OrphanRecord> {
    let orphan_id: String = row.try_get("orphan_id")?;
    let raw_json: String = row.try_get("raw_json")?;
    let context_json: String = row.try_get("context_json")?;
    Ok(OrphanRecord {
        raw: serde_json::from_str(&raw_json)
            .with_context(|| format!("corrupt raw_json for orphan {}", orphan_id))?,
        context: serde_json::from_str(&context_json)
            .with_context(|| format!("corrupt context_json for orphan {}", orphan_id))?,
        user_id: row.try_get("user_id")?,
        import_type: row.try_get("import_type")?,
        first_seen: row.try_get("first_seen")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        last_attempt_at: row.try_get("last_attempt_at")?,
        exhausted: row.try_get("exhausted")?,
        last_error: row.try_get("last_error")?,
        orphan_id,
    })
}

#[async_trait]
impl OrphanStore for SqliteOrphanStore {
    async fn store(&self, orphan: &OrphanRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO orphan_scores (orphan_id, user_id, import_type, raw_json, context_json,
                                       first_seen, retry_count, last_attempt_at, exhausted, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(orphan_id) DO NOTHING
            "#,
        )
        .bind(&orphan.orphan_id)
        .bind(orphan.user_id)
        .bind(&orphan.import_type)
        .bind(serde_json::to_string(&orphan.raw)?)
        .bind(serde_json::to_string(&orphan.context)?)
        .bind(orphan.first_seen)
        .bind(orphan.retry_count as i64)
        .bind(orphan.last_attempt_at)
        .bind(orphan.exhausted)
        .bind(&orphan.last_error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, user_id: Option<UserId>) -> Result<Vec<OrphanRecord>> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query(
                    "SELECT * FROM orphan_scores WHERE user_id = ? ORDER BY first_seen, orphan_id",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM orphan_scores ORDER BY first_seen, orphan_id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(orphan_from_row).collect()
    }

    async fn users_with_orphans(&self) -> Result<Vec<UserId>> {
        let users: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM orphan_scores WHERE exhausted = 0 ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn remove(&self, orphan_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM orphan_scores WHERE orphan_id = ?")
            .bind(orphan_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_attempt(
        &self,
        orphan_id: &str,
        at: i64,
        error: Option<&str>,
        exhausted: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orphan_scores
            SET retry_count = retry_count + 1, last_attempt_at = ?, last_error = ?, exhausted = ?
            WHERE orphan_id = ?
            "#,
        )
        .bind(at)
        .bind(error)
        .bind(exhausted)
        .bind(orphan_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_exhausted(&self, user_id: Option<UserId>) -> Result<u64> {
        let result = match user_id {
            Some(user_id) => {
                sqlx::query("DELETE FROM orphan_scores WHERE exhausted = 1 AND user_id = ?")
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM orphan_scores WHERE exhausted = 1")
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }
}
