//! `ir/fervidex` converter.
//!
//! Fervidex pushes one record per play straight from the cabinet hook, so
//! the context carries the game version the cabinet runs and the time the
//! push was received. Charts are resolved on `(entry_id, playtype,
//! difficulty, version)`, or by content hash for custom charts.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use scoreport_core::convert::Converter;
use scoreport_core::failure::ConversionFailure;
use scoreport_core::models::{
    Assist, ChartQuery, Converted, Difficulty, DryScore, Game, GaugeOption, HitMeta, Judgements,
    Lamp, Playtype, Random, RandomOption, RangeOption, ScoreData, ScoreMeta,
};
use scoreport_core::score_utils::{grade_and_percent, normalize_gauge};
use scoreport_core::store::Catalog;

use crate::converters::{find_chart, find_song};

pub const IMPORT_TYPE: &str = "ir/fervidex";

const LAMPS: [Lamp; 8] = [
    Lamp::NoPlay,
    Lamp::Failed,
    Lamp::AssistClear,
    Lamp::EasyClear,
    Lamp::Clear,
    Lamp::HardClear,
    Lamp::ExHardClear,
    Lamp::FullCombo,
];

#[derive(Debug, Clone, Deserialize)]
pub struct FervidexRecord {
    /// Combined chart code, e.g. `"spa"` or `"dpl"`.
    pub chart: String,
    pub entry_id: i64,
    #[serde(default)]
    pub custom: bool,
    #[serde(default)]
    pub chart_sha256: Option<String>,
    pub ex_score: u32,
    pub pgreat: u32,
    pub great: u32,
    pub good: u32,
    pub bad: u32,
    pub poor: u32,
    pub fast: u32,
    pub slow: u32,
    pub combo_break: u32,
    #[serde(default)]
    pub max_combo: Option<u32>,
    pub clear_type: u8,
    pub gauge: Vec<u32>,
    #[serde(default)]
    pub ghost: Vec<u32>,
    /// Present when the player died before the end of the chart.
    #[serde(default)]
    pub dead: Option<FervidexDead>,
    #[serde(default)]
    pub option: Option<FervidexOptions>,
    #[serde(rename = "2dx-gsm", default)]
    pub gsm: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FervidexDead {
    pub measure: Option<u32>,
    pub note: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FervidexOptions {
    #[serde(default)]
    pub gauge: Option<FervidexGauge>,
    #[serde(default)]
    pub range: Option<FervidexRange>,
    #[serde(default)]
    pub style: Option<FervidexStyle>,
    #[serde(default)]
    pub style_2p: Option<FervidexStyle>,
    #[serde(default)]
    pub assist: Option<FervidexAssist>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FervidexGauge {
    AssistedEasy,
    Easy,
    Hard,
    ExHard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FervidexRange {
    HiddenPlus,
    SuddenPlus,
    SudPlusHidPlus,
    Lift,
    LiftSudPlus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FervidexStyle {
    Random,
    SRandom,
    RRandom,
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FervidexAssist {
    AscrLegacy,
    AutoScratch,
    FullAssist,
    LegacyNote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FervidexContext {
    pub version: String,
    #[serde(rename = "timeReceived")]
    pub time_received: i64,
}

/// Split a combined chart code into playtype and difficulty.
pub fn split_chart_ref(code: &str) -> Result<(Playtype, Difficulty), ConversionFailure> {
    let invalid = || ConversionFailure::Internal(format!("Invalid fervidex difficulty of {}", code));

    let (playtype, suffix) = match (code.get(..2), code.get(2..)) {
        (Some("sp"), Some(suffix)) => (Playtype::SP, suffix),
        (Some("dp"), Some(suffix)) => (Playtype::DP, suffix),
        _ => return Err(invalid()),
    };
    let difficulty = match suffix {
        "b" => Difficulty::Beginner,
        "n" => Difficulty::Normal,
        "h" => Difficulty::Hyper,
        "a" => Difficulty::Another,
        "l" => Difficulty::Leggendaria,
        _ => return Err(invalid()),
    };
    Ok((playtype, difficulty))
}

pub fn assist(option: Option<FervidexAssist>) -> Assist {
    match option {
        Some(FervidexAssist::AscrLegacy | FervidexAssist::FullAssist) => Assist::FullAssist,
        Some(FervidexAssist::AutoScratch) => Assist::AutoScratch,
        Some(FervidexAssist::LegacyNote) => Assist::LegacyNote,
        None => Assist::NoAssist,
    }
}

pub fn gauge(option: Option<FervidexGauge>) -> GaugeOption {
    match option {
        Some(FervidexGauge::AssistedEasy) => GaugeOption::AssistedEasy,
        Some(FervidexGauge::Easy) => GaugeOption::Easy,
        Some(FervidexGauge::Hard) => GaugeOption::Hard,
        Some(FervidexGauge::ExHard) => GaugeOption::ExHard,
        None => GaugeOption::Normal,
    }
}

pub fn range(option: Option<FervidexRange>) -> RangeOption {
    match option {
        Some(FervidexRange::HiddenPlus) => RangeOption::HiddenPlus,
        Some(FervidexRange::SuddenPlus) => RangeOption::SuddenPlus,
        Some(FervidexRange::SudPlusHidPlus) => RangeOption::SudPlusHidPlus,
        Some(FervidexRange::Lift) => RangeOption::Lift,
        Some(FervidexRange::LiftSudPlus) => RangeOption::LiftSudPlus,
        None => RangeOption::None,
    }
}

pub fn random(option: Option<FervidexStyle>) -> Random {
    match option {
        Some(FervidexStyle::Random) => Random::Random,
        Some(FervidexStyle::SRandom) => Random::SRandom,
        Some(FervidexStyle::RRandom) => Random::RRandom,
        Some(FervidexStyle::Mirror) => Random::Mirror,
        None => Random::NonRan,
    }
}

pub struct FervidexConverter;

#[async_trait]
impl Converter for FervidexConverter {
    type Record = FervidexRecord;
    type Context = FervidexContext;

    fn import_type(&self) -> &str {
        IMPORT_TYPE
    }

    async fn convert(
        &self,
        record: &FervidexRecord,
        context: &FervidexContext,
        catalog: &dyn Catalog,
    ) -> Result<Converted, ConversionFailure> {
        let (playtype, difficulty) = split_chart_ref(&record.chart)?;
        let lamp = LAMPS
            .get(record.clear_type as usize)
            .copied()
            .ok_or_else(|| {
                ConversionFailure::Internal(format!(
                    "Invalid fervidex clear_type of {}",
                    record.clear_type
                ))
            })?;

        let in_game = ChartQuery::InGame {
            game: Game::Iidx,
            in_game_id: record.entry_id,
            playtype,
            difficulty,
            version: Some(context.version.clone()),
        };
        let query = if record.custom {
            match record.chart_sha256.as_deref() {
                Some(hash) if !hash.is_empty() => ChartQuery::Hash {
                    game: Game::Iidx,
                    sha256: hash.to_string(),
                },
                _ => {
                    return Err(ConversionFailure::InvalidScore(
                        "Score has no chart_sha256 but is a custom?".to_string(),
                    ))
                }
            }
        } else {
            in_game.clone()
        };

        // The not-found message always names the in-game key, which is what
        // an operator can look up.
        let chart = find_chart(catalog, &query, &in_game).await?;
        let song = find_song(catalog, &chart).await?;

        let (gauge_history, terminal_gauge) = normalize_gauge(&record.gauge)?;
        let (percent, grade) = grade_and_percent(record.ex_score, &chart)?;

        let bp = match record.dead {
            Some(_) => None,
            None => Some(record.bad.checked_add(record.poor).ok_or_else(|| {
                ConversionFailure::InvalidScore(format!(
                    "Invalid bp: bad {} + poor {} overflows.",
                    record.bad, record.poor
                ))
            })?),
        };

        let options = record.option.clone().unwrap_or_default();
        let random = match chart.playtype {
            Playtype::SP => RandomOption::Single(random(options.style)),
            Playtype::DP => RandomOption::Dual(random(options.style), random(options.style_2p)),
        };

        Ok(Converted {
            song,
            dry_score: DryScore {
                game: Game::Iidx,
                service: "Fervidex".to_string(),
                import_type: IMPORT_TYPE.to_string(),
                comment: None,
                time_achieved: Some(context.time_received),
                source_id: None,
                score_data: ScoreData {
                    score: record.ex_score,
                    percent,
                    grade,
                    lamp,
                    judgements: Judgements {
                        pgreat: Some(record.pgreat),
                        great: Some(record.great),
                        good: Some(record.good),
                        bad: Some(record.bad),
                        poor: Some(record.poor),
                    },
                    hit_meta: HitMeta {
                        fast: Some(record.fast),
                        slow: Some(record.slow),
                        max_combo: None,
                        gauge_history: Some(gauge_history),
                        score_history: Some(record.ghost.clone()),
                        gauge: terminal_gauge,
                        bp,
                        combo_break: Some(record.combo_break),
                        gsm: record.gsm.clone(),
                    },
                },
                score_meta: ScoreMeta {
                    random: Some(random),
                    assist: Some(assist(options.assist)),
                    gauge: Some(gauge(options.gauge)),
                    range: Some(range(options.range)),
                },
            },
            chart,
        })
    }
}
