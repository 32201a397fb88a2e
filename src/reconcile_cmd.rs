//! Orphan, blacklist, and lock maintenance commands.
//!
//! `orphans reconcile` runs one pass; `orphans watch` runs one over every
//! user each `sweep_interval_secs` until interrupted. Both go through the
//! core [`Reconciler`], so they take per-user reconcile locks and never
//! retry the same orphan concurrently.

use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{error, info};

use scoreport_core::models::{now_ms, UserId};
use scoreport_core::pipeline::Pipeline;
use scoreport_core::reconcile::{ReconcileOutcome, Reconciler, SweepReport};

use crate::config::Config;
use crate::converters;
use crate::db;
use crate::sqlite_store::{self, SqliteStore};

fn pipeline(pool: &SqlitePool) -> Pipeline {
    sqlite_store::pipeline(pool, converters::builtin())
}

pub async fn list_orphans(config: &Config, user_id: Option<UserId>) -> Result<()> {
    let pool = db::connect(config).await?;
    let orphans = pipeline(&pool).orphans.list(user_id).await?;

    if orphans.is_empty() {
        println!("No orphans.");
    } else {
        println!(
            "{:<14} {:>8} {:<16} {:>7} {:<9}  LAST ERROR",
            "ORPHAN", "USER", "IMPORT TYPE", "RETRIES", "STATE"
        );
        for orphan in &orphans {
            let state = if orphan.exhausted { "exhausted" } else { "pending" };
            println!(
                "{:<14} {:>8} {:<16} {:>7} {:<9}  {}",
                short_id(&orphan.orphan_id),
                orphan.user_id,
                orphan.import_type,
                orphan.retry_count,
                state,
                orphan.last_error.as_deref().unwrap_or("-")
            );
        }
        println!();
        println!("{} orphan(s)", orphans.len());
    }

    pool.close().await;
    Ok(())
}

/// One reconciliation pass, for one user or for everyone with orphans.
pub async fn reconcile_once(
    pool: &SqlitePool,
    config: &Config,
    user_id: Option<UserId>,
) -> Result<SweepReport> {
    let pipeline = pipeline(pool);
    let blacklist = pipeline.blacklist.clone();
    let reconciler = Reconciler::new(pipeline, config.reconcile_policy());

    let report = match user_id {
        Some(user_id) => {
            let outcome = reconciler.reconcile_user(user_id, blacklist.as_ref()).await?;
            SweepReport {
                users: vec![(user_id, outcome)],
                busy_users: Vec::new(),
                total: outcome,
            }
        }
        None => reconciler.reconcile_all(blacklist.as_ref()).await?,
    };
    Ok(report)
}

pub async fn run_reconcile(config: &Config, user_id: Option<UserId>) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = reconcile_once(&pool, config, user_id).await?;
    print_report(&report);
    pool.close().await;
    Ok(())
}

/// Reconcile every user each `sweep_interval_secs` until Ctrl-C.
pub async fn run_watch(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let period = Duration::from_secs(config.orphans.sweep_interval_secs);
    let mut interval = tokio::time::interval(period);
    info!(interval_secs = period.as_secs(), "Watching orphans");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match reconcile_once(&pool, config, None).await {
                    Ok(report) => {
                        info!(
                            users = report.users.len(),
                            busy = report.busy_users.len(),
                            processed = report.total.processed,
                            success = report.total.success,
                            failed = report.total.failed,
                            "Reconciliation sweep finished"
                        );
                    }
                    // A store outage shouldn't kill the watcher; the next tick retries.
                    Err(e) => error!(error = %format!("{:#}", e), "Reconciliation sweep failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping orphan watch");
                break;
            }
        }
    }

    pool.close().await;
    Ok(())
}

pub async fn run_purge(config: &Config, user_id: Option<UserId>) -> Result<()> {
    let pool = db::connect(config).await?;
    let purged = pipeline(&pool).orphans.purge_exhausted(user_id).await?;
    println!("purged {} exhausted orphan(s)", purged);
    pool.close().await;
    Ok(())
}

pub async fn run_blacklist_add(config: &Config, score_id: &str, user_id: UserId) -> Result<()> {
    let pool = db::connect(config).await?;
    let added = SqliteStore::new(pool.clone())
        .add_to_blacklist(score_id, user_id)
        .await?;
    if added {
        println!("blacklisted {}", score_id);
    } else {
        println!("{} was already blacklisted", score_id);
    }
    pool.close().await;
    Ok(())
}

/// Delete expired locks, or every lock with `all` (after a crash, before
/// anything else is running).
pub async fn run_lock_sweep(config: &Config, all: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let locks = pipeline(&pool).locks;
    let removed = if all {
        locks.clear_all().await?
    } else {
        locks.sweep_expired(now_ms()).await?
    };
    println!("removed {} lock(s)", removed);
    pool.close().await;
    Ok(())
}

fn print_report(report: &SweepReport) {
    println!("orphans reconcile");
    for (user_id, outcome) in &report.users {
        println!("  user {}: {}", user_id, outcome_line(outcome));
    }
    for user_id in &report.busy_users {
        println!("  user {}: busy, skipped", user_id);
    }
    println!("  total: {}", outcome_line(&report.total));
    println!("ok");
}

fn outcome_line(outcome: &ReconcileOutcome) -> String {
    format!(
        "processed {}, success {}, failed {}, removed {}, retired {}, deferred {}",
        outcome.processed,
        outcome.success,
        outcome.failed,
        outcome.removed,
        outcome.retired,
        outcome.deferred
    )
}

fn short_id(id: &str) -> &str {
    id.get(..13).unwrap_or(id)
}
