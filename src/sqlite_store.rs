//! SQLite-backed catalog, score store, personal-best index and blacklist.
//!
//! Together with [`SqliteOrphanStore`](crate::sqlite_orphans::SqliteOrphanStore)
//! and [`SqliteLocks`](crate::sqlite_locks::SqliteLocks) this provides every
//! collaborator the core pipeline needs; [`pipeline`] wires them up.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use scoreport_core::convert::ConverterRegistry;
use scoreport_core::models::{
    now_ms, Chart, ChartQuery, Difficulty, Game, Lamp, PersonalBest, Playtype, Score, Song, UserId,
};
use scoreport_core::pipeline::Pipeline;
use scoreport_core::store::{Blacklist, Catalog, PersonalBestMerge, ScoreStore};

use crate::sqlite_locks::SqliteLocks;
use crate::sqlite_orphans::SqliteOrphanStore;

/// Build a [`Pipeline`] whose collaborators all live in `pool`.
pub fn pipeline(pool: &SqlitePool, converters: ConverterRegistry) -> Pipeline {
    let store = Arc::new(SqliteStore::new(pool.clone()));
    Pipeline {
        catalog: store.clone(),
        scores: store.clone(),
        personal_bests: store.clone(),
        orphans: Arc::new(SqliteOrphanStore::new(pool.clone())),
        locks: Arc::new(SqliteLocks::new(pool.clone())),
        blacklist: store,
        converters: Arc::new(converters),
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace a song. Catalog maintenance proper is out of scope;
    /// this exists for seeding and tests.
    pub async fn upsert_song(&self, song: &Song) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO songs (game, id, title, artist) VALUES (?, ?, ?, ?)
            ON CONFLICT(game, id) DO UPDATE SET title = excluded.title, artist = excluded.artist
            "#,
        )
        .bind(song.game.as_str())
        .bind(song.id)
        .bind(&song.title)
        .bind(&song.artist)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_chart(&self, chart: &Chart) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO charts (chart_id, song_id, game, playtype, difficulty, in_game_id,
                                versions_json, is_primary, level, notecount, hash_sha256)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chart_id) DO UPDATE SET
                song_id = excluded.song_id,
                game = excluded.game,
                playtype = excluded.playtype,
                difficulty = excluded.difficulty,
                in_game_id = excluded.in_game_id,
                versions_json = excluded.versions_json,
                is_primary = excluded.is_primary,
                level = excluded.level,
                notecount = excluded.notecount,
                hash_sha256 = excluded.hash_sha256
            "#,
        )
        .bind(&chart.chart_id)
        .bind(chart.song_id)
        .bind(chart.game.as_str())
        .bind(chart.playtype.as_str())
        .bind(chart.difficulty.as_str())
        .bind(chart.in_game_id)
        .bind(serde_json::to_string(&chart.versions)?)
        .bind(chart.is_primary)
        .bind(&chart.level)
        .bind(chart.notecount as i64)
        .bind(&chart.hash_sha256)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_to_blacklist(&self, score_id: &str, user_id: UserId) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO score_blacklist (score_id, user_id, added_at) VALUES (?, ?, ?) \
             ON CONFLICT(score_id) DO NOTHING",
        )
        .bind(score_id)
        .bind(user_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_score(&self, score_id: &str) -> Result<Option<Score>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT score_json FROM scores WHERE score_id = ?")
                .bind(score_id)
                .fetch_optional(&self.pool)
                .await?;
        json.map(|j| serde_json::from_str(&j).context("corrupt score_json"))
            .transpose()
    }

    pub async fn get_personal_best(
        &self,
        user_id: UserId,
        chart_id: &str,
    ) -> Result<Option<PersonalBest>> {
        let row = sqlx::query(
            "SELECT user_id, chart_id, best_score, best_score_id, best_lamp, updated_at \
             FROM personal_bests WHERE user_id = ? AND chart_id = ?",
        )
        .bind(user_id)
        .bind(chart_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pb_from_row).transpose()
    }
}

fn chart_from_row(row: &SqliteRow) -> Result<Chart> {
    let versions_json: String = row.try_get("versions_json")?;
    Ok(Chart {
        chart_id: row.try_get("chart_id")?,
        song_id: row.try_get("song_id")?,
        game: Game::from_str(row.try_get("game")?)?,
        playtype: Playtype::from_str(row.try_get("playtype")?)?,
        difficulty: Difficulty::from_str(row.try_get("difficulty")?)?,
        in_game_id: row.try_get("in_game_id")?,
        versions: serde_json::from_str(&versions_json).context("corrupt versions_json")?,
        is_primary: row.try_get("is_primary")?,
        level: row.try_get("level")?,
        notecount: row.try_get::<i64, _>("notecount")? as u32,
        hash_sha256: row.try_get("hash_sha256")?,
    })
}

fn pb_from_row(row: &SqliteRow) -> Result<PersonalBest> {
    Ok(PersonalBest {
        user_id: row.try_get("user_id")?,
        chart_id: row.try_get("chart_id")?,
        best_score: row.try_get::<i64, _>("best_score")? as u32,
        best_score_id: row.try_get("best_score_id")?,
        best_lamp: Lamp::from_str(row.try_get("best_lamp")?)?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Catalog for SqliteStore {
    async fn find_chart(&self, query: &ChartQuery) -> Result<Option<Chart>> {
        let rows = match query {
            ChartQuery::InGame {
                game,
                in_game_id,
                playtype,
                difficulty,
                ..
            } => {
                sqlx::query(
                    "SELECT * FROM charts WHERE game = ? AND in_game_id = ? \
                     AND playtype = ? AND difficulty = ?",
                )
                .bind(game.as_str())
                .bind(in_game_id)
                .bind(playtype.as_str())
                .bind(difficulty.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            ChartQuery::Hash { game, sha256 } => {
                sqlx::query("SELECT * FROM charts WHERE game = ? AND hash_sha256 = ?")
                    .bind(game.as_str())
                    .bind(sha256)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        // The version window lives in a JSON column; filter candidates here.
        for row in &rows {
            let chart = chart_from_row(row)?;
            if query.matches(&chart) {
                return Ok(Some(chart));
            }
        }
        Ok(None)
    }

    async fn find_song(&self, game: Game, song_id: i64) -> Result<Option<Song>> {
        let row = sqlx::query("SELECT id, title, artist FROM songs WHERE game = ? AND id = ?")
            .bind(game.as_str())
            .bind(song_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<Song> {
            Ok(Song {
                id: r.try_get("id")?,
                game,
                title: r.try_get("title")?,
                artist: r.try_get("artist")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl ScoreStore for SqliteStore {
    async fn insert_score(&self, score: &Score) -> Result<bool> {
        let data = &score.dry.score_data;
        let result = sqlx::query(
            r#"
            INSERT INTO scores (score_id, user_id, chart_id, song_id, game, playtype, import_type,
                                score, lamp, time_achieved, time_added, score_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(score_id) DO NOTHING
            "#,
        )
        .bind(&score.score_id)
        .bind(score.user_id)
        .bind(&score.chart_id)
        .bind(score.song_id)
        .bind(score.dry.game.as_str())
        .bind(score.playtype.as_str())
        .bind(&score.dry.import_type)
        .bind(data.score as i64)
        .bind(data.lamp.as_str())
        .bind(score.dry.time_achieved)
        .bind(score.time_added)
        .bind(serde_json::to_string(score)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn score_exists(&self, score_id: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM scores WHERE score_id = ?")
                .bind(score_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

#[async_trait]
impl PersonalBestMerge for SqliteStore {
    async fn apply(&self, score: &Score) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT user_id, chart_id, best_score, best_score_id, best_lamp, updated_at \
             FROM personal_bests WHERE user_id = ? AND chart_id = ?",
        )
        .bind(score.user_id)
        .bind(&score.chart_id)
        .fetch_optional(&mut *tx)
        .await?;
        let existing = existing.as_ref().map(pb_from_row).transpose()?;

        let pb = PersonalBest::merge(existing, score, now_ms());
        sqlx::query(
            r#"
            INSERT INTO personal_bests (user_id, chart_id, best_score, best_score_id, best_lamp, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, chart_id) DO UPDATE SET
                best_score = excluded.best_score,
                best_score_id = excluded.best_score_id,
                best_lamp = excluded.best_lamp,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(pb.user_id)
        .bind(&pb.chart_id)
        .bind(pb.best_score as i64)
        .bind(&pb.best_score_id)
        .bind(pb.best_lamp.as_str())
        .bind(pb.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Blacklist for SqliteStore {
    async fn contains(&self, score_id: &str) -> Result<bool> {
        let listed: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM score_blacklist WHERE score_id = ?")
                .bind(score_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(listed)
    }
}
