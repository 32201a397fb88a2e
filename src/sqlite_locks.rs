//! SQLite-backed per-user locks.
//!
//! One row per `(user_id, kind)`. Acquisition is a single upsert that only
//! overwrites an existing row once it has expired, so two processes racing
//! for the same user cannot both win.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;

use scoreport_core::models::{now_ms, UserId};
use scoreport_core::store::{expiry, LockKind, LockToken, UserLocks};

pub struct SqliteLocks {
    pool: SqlitePool,
}

impl SqliteLocks {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserLocks for SqliteLocks {
    async fn try_acquire(
        &self,
        user_id: UserId,
        kind: LockKind,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        let now = now_ms();
        let token = LockToken {
            user_id,
            kind,
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: expiry(now, ttl),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO import_locks (user_id, kind, token, acquired_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, kind) DO UPDATE SET
                token = excluded.token,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE import_locks.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(&token.token)
        .bind(now)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then_some(token))
    }

    async fn refresh(&self, token: &LockToken, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE import_locks SET expires_at = ? WHERE user_id = ? AND kind = ? AND token = ?",
        )
        .bind(expiry(now_ms(), ttl))
        .bind(token.user_id)
        .bind(token.kind.as_str())
        .bind(&token.token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, token: &LockToken) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM import_locks WHERE user_id = ? AND kind = ? AND token = ?")
                .bind(token.user_id)
                .bind(token.kind.as_str())
                .bind(&token.token)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn sweep_expired(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM import_locks WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM import_locks")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
