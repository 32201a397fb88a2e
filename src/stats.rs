//! Database statistics and health overview.
//!
//! A quick summary of what the pipeline has produced: committed scores,
//! personal bests, pending and exhausted orphans, held locks, and import
//! runs by status. Used by `scoreport stats`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use scoreport_core::models::now_ms;

use crate::config::Config;
use crate::db;

/// Table counts reported by `scoreport stats`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub scores: i64,
    pub personal_bests: i64,
    pub orphans_pending: i64,
    pub orphans_exhausted: i64,
    pub locks_held: i64,
    pub locks_expired: i64,
    pub blacklisted: i64,
    /// `(status, count)`, most frequent first.
    pub imports: Vec<(String, i64)>,
}

pub async fn collect(pool: &SqlitePool) -> Result<Stats> {
    let now = now_ms();
    let locks_expired: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM import_locks WHERE expires_at <= ?")
            .bind(now)
            .fetch_one(pool)
            .await?;

    let import_rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM imports GROUP BY status ORDER BY n DESC, status",
    )
    .fetch_all(pool)
    .await?;
    let imports = import_rows
        .iter()
        .map(|row| Ok((row.try_get("status")?, row.try_get("n")?)))
        .collect::<Result<Vec<_>>>()?;

    let locks_total = count(pool, "SELECT COUNT(*) FROM import_locks").await?;

    Ok(Stats {
        scores: count(pool, "SELECT COUNT(*) FROM scores").await?,
        personal_bests: count(pool, "SELECT COUNT(*) FROM personal_bests").await?,
        orphans_pending: count(pool, "SELECT COUNT(*) FROM orphan_scores WHERE exhausted = 0").await?,
        orphans_exhausted: count(pool, "SELECT COUNT(*) FROM orphan_scores WHERE exhausted = 1").await?,
        locks_held: locks_total - locks_expired,
        locks_expired,
        blacklisted: count(pool, "SELECT COUNT(*) FROM score_blacklist").await?,
        imports,
    })
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
    Ok(n)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("scoreport database stats");
    println!("========================");
    println!();
    println!("  Database:        {}", config.db.path.display());
    println!("  Size:            {}", format_bytes(db_size));
    println!();
    println!("  Scores:          {}", stats.scores);
    println!("  Personal bests:  {}", stats.personal_bests);
    println!("  Blacklisted:     {}", stats.blacklisted);
    println!(
        "  Orphans:         {} pending, {} exhausted",
        stats.orphans_pending, stats.orphans_exhausted
    );
    println!(
        "  Locks:           {} held, {} expired",
        stats.locks_held, stats.locks_expired
    );

    if !stats.imports.is_empty() {
        println!();
        println!("  Imports:");
        println!("  {:<12} {:>8}", "STATUS", "RUNS");
        println!("  {}", "-".repeat(21));
        for (status, n) in &stats.imports {
            println!("  {:<12} {:>8}", status, n);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
