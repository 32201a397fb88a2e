//! `file/mer-iidx` converter.
//!
//! MER exports are a JSON array of plays the user downloads and uploads
//! in one go. They carry no game version, so charts resolve to the newest
//! catalog revision of the in-game ID.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;

use scoreport_core::convert::Converter;
use scoreport_core::failure::ConversionFailure;
use scoreport_core::models::{
    ChartQuery, Converted, Difficulty, DryScore, Game, HitMeta, Judgements, Lamp, Playtype,
    ScoreData, ScoreMeta,
};
use scoreport_core::score_utils::grade_and_percent;
use scoreport_core::store::Catalog;

use crate::converters::{find_chart, find_song};

pub const IMPORT_TYPE: &str = "file/mer-iidx";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Deserialize)]
pub struct MerRecord {
    pub music_id: i64,
    pub play_type: String,
    pub diff_type: String,
    pub score: u32,
    /// `-1` when the export does not know the miss count.
    pub miss_count: i64,
    pub clear_type: String,
    pub update_time: String,
}

/// MER uploads carry no side-channel data.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MerContext {}

pub fn lamp(clear_type: &str) -> Option<Lamp> {
    Some(match clear_type {
        "NO PLAY" => Lamp::NoPlay,
        "FAILED" => Lamp::Failed,
        "ASSIST CLEAR" => Lamp::AssistClear,
        "EASY CLEAR" => Lamp::EasyClear,
        "CLEAR" => Lamp::Clear,
        "HARD CLEAR" => Lamp::HardClear,
        "EX HARD CLEAR" => Lamp::ExHardClear,
        "FULLCOMBO CLEAR" => Lamp::FullCombo,
        _ => return None,
    })
}

fn playtype(play_type: &str) -> Result<Playtype, ConversionFailure> {
    match play_type {
        "SINGLE" => Ok(Playtype::SP),
        "DOUBLE" => Ok(Playtype::DP),
        other => Err(ConversionFailure::Internal(format!(
            "Invalid MER play_type of {}",
            other
        ))),
    }
}

fn difficulty(diff_type: &str) -> Result<Difficulty, ConversionFailure> {
    diff_type.parse::<Difficulty>().map_err(|_| {
        ConversionFailure::Internal(format!("Invalid MER diff_type of {}", diff_type))
    })
}

/// Parse `update_time` as UTC, in milliseconds since epoch.
pub fn parse_time(update_time: &str) -> Result<i64, ConversionFailure> {
    NaiveDateTime::parse_from_str(update_time, TIME_FORMAT)
        .map(|t| t.and_utc().timestamp_millis())
        .map_err(|_| {
            ConversionFailure::InvalidScore(format!("Invalid update_time of {}.", update_time))
        })
}

pub struct MerConverter;

#[async_trait]
impl Converter for MerConverter {
    type Record = MerRecord;
    type Context = MerContext;

    fn import_type(&self) -> &str {
        IMPORT_TYPE
    }

    async fn convert(
        &self,
        record: &MerRecord,
        _context: &MerContext,
        catalog: &dyn Catalog,
    ) -> Result<Converted, ConversionFailure> {
        let playtype = playtype(&record.play_type)?;
        let difficulty = difficulty(&record.diff_type)?;
        let lamp = lamp(&record.clear_type).ok_or_else(|| {
            ConversionFailure::Internal(format!("Invalid MER clear_type of {}", record.clear_type))
        })?;
        let time_achieved = parse_time(&record.update_time)?;

        let query = ChartQuery::InGame {
            game: Game::Iidx,
            in_game_id: record.music_id,
            playtype,
            difficulty,
            version: None,
        };
        let chart = find_chart(catalog, &query, &query).await?;
        let song = find_song(catalog, &chart).await?;
        let (percent, grade) = grade_and_percent(record.score, &chart)?;

        let bp = match record.miss_count {
            -1 => None,
            n => Some(u32::try_from(n).map_err(|_| {
                ConversionFailure::InvalidScore(format!("Invalid miss_count of {}.", n))
            })?),
        };

        Ok(Converted {
            song,
            dry_score: DryScore {
                game: Game::Iidx,
                service: "MER".to_string(),
                import_type: IMPORT_TYPE.to_string(),
                comment: None,
                time_achieved: Some(time_achieved),
                source_id: None,
                score_data: ScoreData {
                    score: record.score,
                    percent,
                    grade,
                    lamp,
                    judgements: Judgements::default(),
                    hit_meta: HitMeta {
                        bp,
                        ..Default::default()
                    },
                },
                score_meta: ScoreMeta::default(),
            },
            chart,
        })
    }
}
