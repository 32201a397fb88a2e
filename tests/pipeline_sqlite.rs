//! End-to-end tests of the import pipeline against a real SQLite database.
//!
//! Each test gets its own temporary database, seeded with one song and one
//! SP ANOTHER chart (in-game ID 1000, versions 26 and 27).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;

use scoreport::config::Config;
use scoreport::converters;
use scoreport::db;
use scoreport::ingest::{self, ImportRequest, ImportRun};
use scoreport::migrate;
use scoreport::reconcile_cmd;
use scoreport::sqlite_store::{self, SqliteStore};
use scoreport::stats;
use scoreport_core::convert::ErasedConverter;
use scoreport_core::dedup;
use scoreport_core::models::{now_ms, Chart, Difficulty, Game, Playtype, Song};
use scoreport_core::progress::{NoProgress, RunStatus};
use scoreport_core::store::{LockKind, UserLocks};

struct TestEnv {
    tmp: TempDir,
    config: Config,
    pool: SqlitePool,
    store: SqliteStore,
}

fn song(id: i64) -> Song {
    Song {
        id,
        game: Game::Iidx,
        title: format!("Song {}", id),
        artist: "Test Artist".to_string(),
    }
}

fn chart(chart_id: &str, song_id: i64, in_game_id: i64) -> Chart {
    Chart {
        chart_id: chart_id.to_string(),
        song_id,
        game: Game::Iidx,
        playtype: Playtype::SP,
        difficulty: Difficulty::Another,
        in_game_id,
        versions: vec!["26".to_string(), "27".to_string()],
        is_primary: true,
        level: "10".to_string(),
        notecount: 786,
        hash_sha256: None,
    }
}

async fn setup() -> TestEnv {
    scoreport::logging::init_test();
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db_path(tmp.path().join("data").join("scoreport.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let store = SqliteStore::new(pool.clone());
    store.upsert_song(&song(1)).await.unwrap();
    store
        .upsert_chart(&chart("c2311194e3897ddb5745b1760d2c0141f933e683", 1, 1000))
        .await
        .unwrap();

    TestEnv {
        tmp,
        config,
        pool,
        store,
    }
}

fn fervidex_record(entry_id: i64, ex_score: u32) -> Value {
    json!({
        "chart": "spa",
        "entry_id": entry_id,
        "custom": false,
        "ex_score": ex_score,
        "pgreat": ex_score / 2,
        "great": ex_score % 2,
        "good": 0,
        "bad": 0,
        "poor": 6,
        "fast": 0,
        "slow": 0,
        "combo_break": 6,
        "clear_type": 5,
        "gauge": [100, 80],
        "ghost": [0, 2],
        "option": {"gauge": "HARD"}
    })
}

fn fervidex_context() -> Value {
    json!({"version": "27", "timeReceived": 1_625_142_600_000i64})
}

fn write_jsonl(dir: &Path, name: &str, records: &[Value]) -> PathBuf {
    let path = dir.join(name);
    let body: Vec<String> = records.iter().map(|r| r.to_string()).collect();
    std::fs::write(&path, body.join("\n")).unwrap();
    path
}

async fn import(env: &TestEnv, user_id: i64, path: PathBuf) -> ImportRun {
    let request = ImportRequest {
        user_id,
        import_type: "ir/fervidex".to_string(),
        path,
        context: fervidex_context(),
    };
    ingest::import_with_pool(&env.pool, &env.config, &request, &NoProgress)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_import_commits_and_reimport_is_idempotent() {
    let env = setup().await;
    let path = write_jsonl(
        env.tmp.path(),
        "plays.jsonl",
        &[fervidex_record(1000, 1200), fervidex_record(1000, 1300)],
    );

    let run = import(&env, 1, path.clone()).await;
    assert_eq!(run.status, RunStatus::Done);
    let summary = run.summary.unwrap();
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.committed, 2);
    assert_eq!(run.source_sha256.as_ref().map(String::len), Some(64));

    let again = import(&env, 1, path).await;
    let summary = again.summary.unwrap();
    assert_eq!(summary.committed, 0);
    assert_eq!(summary.duplicates, 2);

    let stats = stats::collect(&env.pool).await.unwrap();
    assert_eq!(stats.scores, 2);
    assert_eq!(stats.personal_bests, 1);

    let pb = env
        .store
        .get_personal_best(1, "c2311194e3897ddb5745b1760d2c0141f933e683")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pb.best_score, 1300);
}

#[tokio::test]
async fn test_invalid_records_are_skipped_not_fatal() {
    let env = setup().await;
    let path = write_jsonl(
        env.tmp.path(),
        "plays.jsonl",
        &[fervidex_record(1000, 9999), fervidex_record(1000, 1000)],
    );

    let run = import(&env, 1, path).await;
    assert_eq!(run.status, RunStatus::Done);
    let summary = run.summary.unwrap();
    assert_eq!(summary.skipped_invalid, 1);
    assert_eq!(summary.internal_failures, 0);
    assert_eq!(summary.committed, 1);
}

#[tokio::test]
async fn test_orphan_is_reconciled_once_catalog_catches_up() {
    let env = setup().await;
    let path = write_jsonl(env.tmp.path(), "plays.jsonl", &[fervidex_record(2000, 900)]);

    let run = import(&env, 1, path).await;
    assert_eq!(run.summary.unwrap().orphaned, 1);

    // Chart still unknown: the attempt is counted, the orphan stays.
    let report = reconcile_cmd::reconcile_once(&env.pool, &env.config, Some(1))
        .await
        .unwrap();
    assert_eq!(report.total.processed, 1);
    assert_eq!(report.total.success, 0);

    let pipeline = sqlite_store::pipeline(&env.pool, converters::builtin());
    let orphans = pipeline.orphans.list(Some(1)).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].retry_count, 1);

    env.store.upsert_song(&song(2)).await.unwrap();
    env.store.upsert_chart(&chart("chart-2000", 2, 2000)).await.unwrap();

    let report = reconcile_cmd::reconcile_once(&env.pool, &env.config, None)
        .await
        .unwrap();
    assert_eq!(report.total.success, 1);
    assert!(pipeline.orphans.list(None).await.unwrap().is_empty());

    let pb = env.store.get_personal_best(1, "chart-2000").await.unwrap();
    assert_eq!(pb.map(|p| p.best_score), Some(900));
}

#[tokio::test]
async fn test_concurrent_import_for_same_user_conflicts() {
    let env = setup().await;
    let pipeline = sqlite_store::pipeline(&env.pool, converters::builtin());
    let held = pipeline
        .locks
        .try_acquire(1, LockKind::Import, Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();

    let path = write_jsonl(env.tmp.path(), "plays.jsonl", &[fervidex_record(1000, 1000)]);
    let run = import(&env, 1, path.clone()).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("already in progress"));
    assert!(run.summary.is_none());

    // Another user is unaffected.
    let other = import(&env, 2, path.clone()).await;
    assert_eq!(other.status, RunStatus::Done);

    assert!(pipeline.locks.release(&held).await.unwrap());
    let retried = import(&env, 1, path).await;
    assert_eq!(retried.status, RunStatus::Done);
}

#[tokio::test]
async fn test_expired_lock_is_taken_over_and_swept() {
    let env = setup().await;
    let pipeline = sqlite_store::pipeline(&env.pool, converters::builtin());

    // A crashed holder leaves a lock that expired immediately.
    let stale = pipeline
        .locks
        .try_acquire(1, LockKind::Import, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let path = write_jsonl(env.tmp.path(), "plays.jsonl", &[fervidex_record(1000, 1000)]);
    let run = import(&env, 1, path).await;
    assert_eq!(run.status, RunStatus::Done);

    // The old holder can no longer release what it lost.
    assert!(!pipeline.locks.release(&stale).await.unwrap());

    pipeline
        .locks
        .try_acquire(7, LockKind::Reconcile, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pipeline.locks.sweep_expired(now_ms()).await.unwrap(), 1);
    assert_eq!(pipeline.locks.clear_all().await.unwrap(), 0);
}

#[tokio::test]
async fn test_blacklisted_score_is_never_committed() {
    let env = setup().await;
    let raw = fervidex_record(1000, 1000);

    let registry = converters::builtin();
    let converter = registry.find("ir/fervidex").unwrap();
    let converted = converter
        .convert_value(&raw, &fervidex_context(), &env.store)
        .await
        .unwrap();
    let score_id = dedup::score_id(1, &converted.chart, &converted.dry_score);
    assert!(env.store.add_to_blacklist(&score_id, 1).await.unwrap());
    assert!(!env.store.add_to_blacklist(&score_id, 1).await.unwrap());

    let path = write_jsonl(env.tmp.path(), "plays.jsonl", &[raw]);
    let summary = import(&env, 1, path).await.summary.unwrap();
    assert_eq!(summary.blacklisted, 1);
    assert_eq!(summary.committed, 0);
    assert!(env.store.get_score(&score_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_background_import_is_pollable() {
    let env = setup().await;
    let path = write_jsonl(env.tmp.path(), "plays.jsonl", &[fervidex_record(1000, 1000)]);
    let request = ImportRequest {
        user_id: 1,
        import_type: "ir/fervidex".to_string(),
        path,
        context: fervidex_context(),
    };

    let (import_id, handle) = ingest::spawn_import(
        env.pool.clone(),
        env.config.clone(),
        request,
        Box::new(NoProgress),
    )
    .await
    .unwrap();

    let registered = ingest::poll_import(&env.pool, &import_id).await.unwrap().unwrap();
    assert_eq!(registered.user_id, 1);

    handle.await.unwrap().unwrap();
    let run = ingest::poll_import(&env.pool, &import_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.summary.unwrap().committed, 1);

    assert!(ingest::poll_import(&env.pool, "no-such-import").await.unwrap().is_none());
}

#[tokio::test]
async fn test_mer_export_import() {
    let env = setup().await;
    let path = env.tmp.path().join("mer.json");
    std::fs::write(
        &path,
        json!([
            {
                "music_id": 1000,
                "play_type": "SINGLE",
                "diff_type": "ANOTHER",
                "score": 1398,
                "miss_count": -1,
                "clear_type": "FULLCOMBO CLEAR",
                "update_time": "2021-07-01 12:30:00"
            },
            {
                "music_id": 1000,
                "play_type": "SINGLE",
                "diff_type": "ANOTHER",
                "score": 1000,
                "miss_count": 10,
                "clear_type": "NOT A LAMP",
                "update_time": "2021-07-02 12:30:00"
            }
        ])
        .to_string(),
    )
    .unwrap();

    let request = ImportRequest {
        user_id: 3,
        import_type: "file/mer-iidx".to_string(),
        path,
        context: json!({}),
    };
    let run = ingest::import_with_pool(&env.pool, &env.config, &request, &NoProgress)
        .await
        .unwrap();
    let summary = run.summary.unwrap();
    assert_eq!(summary.committed, 1);
    assert_eq!(summary.internal_failures, 1);

    let score = env
        .store
        .get_score(&summary.score_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(score.dry.service, "MER");
    assert_eq!(score.dry.time_achieved, Some(1_625_142_600_000));
}

#[tokio::test]
async fn test_unknown_import_type_fails_run() {
    let env = setup().await;
    let path = write_jsonl(env.tmp.path(), "plays.jsonl", &[fervidex_record(1000, 1000)]);
    let request = ImportRequest {
        user_id: 1,
        import_type: "ir/unknown".to_string(),
        path,
        context: json!({}),
    };
    let run = ingest::import_with_pool(&env.pool, &env.config, &request, &NoProgress)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("ir/unknown"));
}
