//! Core data models used throughout scoreport.
//!
//! Catalog entities ([`Song`], [`Chart`]) are read-only inputs owned by the
//! reference catalog. [`DryScore`] is what a converter produces; [`Score`]
//! is a dry score bound to a user and a dedup key, ready to be committed.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub type UserId = i64;

/// Milliseconds since the Unix epoch, the timestamp unit used everywhere.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Game {
    Iidx,
}

impl Game {
    pub fn as_str(&self) -> &'static str {
        match self {
            Game::Iidx => "iidx",
        }
    }
}

impl FromStr for Game {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "iidx" => Ok(Game::Iidx),
            other => Err(anyhow!("unknown game '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Playtype {
    SP,
    DP,
}

impl Playtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Playtype::SP => "SP",
            Playtype::DP => "DP",
        }
    }
}

impl FromStr for Playtype {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SP" => Ok(Playtype::SP),
            "DP" => Ok(Playtype::DP),
            other => Err(anyhow!("unknown playtype '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Difficulty {
    Beginner,
    Normal,
    Hyper,
    Another,
    Leggendaria,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Beginner => "BEGINNER",
            Difficulty::Normal => "NORMAL",
            Difficulty::Hyper => "HYPER",
            Difficulty::Another => "ANOTHER",
            Difficulty::Leggendaria => "LEGGENDARIA",
        }
    }
}

impl FromStr for Difficulty {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BEGINNER" => Ok(Difficulty::Beginner),
            "NORMAL" => Ok(Difficulty::Normal),
            "HYPER" => Ok(Difficulty::Hyper),
            "ANOTHER" => Ok(Difficulty::Another),
            "LEGGENDARIA" => Ok(Difficulty::Leggendaria),
            other => Err(anyhow!("unknown difficulty '{}'", other)),
        }
    }
}

/// Parent grouping of one or more charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: i64,
    pub game: Game,
    pub title: String,
    pub artist: String,
}

/// One playable variant of a song.
///
/// `versions` is the window of game versions this revision of the chart is
/// authoritative for; `is_primary` marks the newest revision, used when a
/// source provides no version hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub chart_id: String,
    pub song_id: i64,
    pub game: Game,
    pub playtype: Playtype,
    pub difficulty: Difficulty,
    pub in_game_id: i64,
    pub versions: Vec<String>,
    pub is_primary: bool,
    pub level: String,
    pub notecount: u32,
    pub hash_sha256: Option<String>,
}

impl Chart {
    /// Mechanically possible maximum EX score.
    pub fn max_score(&self) -> u32 {
        self.notecount.saturating_mul(2)
    }

    pub fn in_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }
}

/// How a converter identifies a chart in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartQuery {
    /// Natural in-game key. `version: None` selects the primary revision.
    InGame {
        game: Game,
        in_game_id: i64,
        playtype: Playtype,
        difficulty: Difficulty,
        version: Option<String>,
    },
    /// Content hash of a custom (user-made) chart.
    Hash { game: Game, sha256: String },
}

impl ChartQuery {
    /// Whether `chart` satisfies this query. Backends that cannot express
    /// the version window natively filter their candidates with this.
    pub fn matches(&self, chart: &Chart) -> bool {
        match self {
            ChartQuery::InGame {
                game,
                in_game_id,
                playtype,
                difficulty,
                version,
            } => {
                chart.game == *game
                    && chart.in_game_id == *in_game_id
                    && chart.playtype == *playtype
                    && chart.difficulty == *difficulty
                    && match version {
                        Some(v) => chart.in_version(v),
                        None => chart.is_primary,
                    }
            }
            ChartQuery::Hash { game, sha256 } => {
                chart.game == *game && chart.hash_sha256.as_deref() == Some(sha256.as_str())
            }
        }
    }
}

impl fmt::Display for ChartQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChartQuery::InGame {
                in_game_id,
                playtype,
                difficulty,
                version,
                ..
            } => write!(
                f,
                "songID {} ({} {} [{}])",
                in_game_id,
                playtype.as_str(),
                difficulty.as_str(),
                version.as_deref().unwrap_or("latest")
            ),
            ChartQuery::Hash { sha256, .. } => write!(f, "chart hash {}", sha256),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Lamp {
    #[serde(rename = "NO PLAY")]
    NoPlay,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "ASSIST CLEAR")]
    AssistClear,
    #[serde(rename = "EASY CLEAR")]
    EasyClear,
    #[serde(rename = "CLEAR")]
    Clear,
    #[serde(rename = "HARD CLEAR")]
    HardClear,
    #[serde(rename = "EX HARD CLEAR")]
    ExHardClear,
    #[serde(rename = "FULL COMBO")]
    FullCombo,
}

impl Lamp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lamp::NoPlay => "NO PLAY",
            Lamp::Failed => "FAILED",
            Lamp::AssistClear => "ASSIST CLEAR",
            Lamp::EasyClear => "EASY CLEAR",
            Lamp::Clear => "CLEAR",
            Lamp::HardClear => "HARD CLEAR",
            Lamp::ExHardClear => "EX HARD CLEAR",
            Lamp::FullCombo => "FULL COMBO",
        }
    }
}

impl FromStr for Lamp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        [
            Lamp::NoPlay,
            Lamp::Failed,
            Lamp::AssistClear,
            Lamp::EasyClear,
            Lamp::Clear,
            Lamp::HardClear,
            Lamp::ExHardClear,
            Lamp::FullCombo,
        ]
        .into_iter()
        .find(|l| l.as_str() == s)
        .ok_or_else(|| anyhow!("unknown lamp '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    F,
    E,
    D,
    C,
    B,
    A,
    AA,
    AAA,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Judgements {
    pub pgreat: Option<u32>,
    pub great: Option<u32>,
    pub good: Option<u32>,
    pub bad: Option<u32>,
    pub poor: Option<u32>,
}

/// Derived hit metadata. `None` means unknown, never zero-filled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitMeta {
    pub fast: Option<u32>,
    pub slow: Option<u32>,
    pub max_combo: Option<u32>,
    pub gauge_history: Option<Vec<Option<u32>>>,
    pub score_history: Option<Vec<u32>>,
    pub gauge: Option<u32>,
    pub bp: Option<u32>,
    pub combo_break: Option<u32>,
    pub gsm: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreData {
    pub score: u32,
    pub percent: f64,
    pub grade: Grade,
    pub lamp: Lamp,
    pub judgements: Judgements,
    pub hit_meta: HitMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Random {
    #[serde(rename = "NONRAN")]
    NonRan,
    #[serde(rename = "RANDOM")]
    Random,
    #[serde(rename = "S-RANDOM")]
    SRandom,
    #[serde(rename = "R-RANDOM")]
    RRandom,
    #[serde(rename = "MIRROR")]
    Mirror,
}

/// Random modifier: a scalar for single-side charts, a `[1P, 2P]` pair for
/// dual-side charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RandomOption {
    Single(Random),
    Dual(Random, Random),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assist {
    #[serde(rename = "NO ASSIST")]
    NoAssist,
    #[serde(rename = "AUTO SCRATCH")]
    AutoScratch,
    #[serde(rename = "LEGACY NOTE")]
    LegacyNote,
    #[serde(rename = "FULL ASSIST")]
    FullAssist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GaugeOption {
    #[serde(rename = "ASSISTED EASY")]
    AssistedEasy,
    #[serde(rename = "EASY")]
    Easy,
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "HARD")]
    Hard,
    #[serde(rename = "EX-HARD")]
    ExHard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeOption {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "SUDDEN+")]
    SuddenPlus,
    #[serde(rename = "HIDDEN+")]
    HiddenPlus,
    #[serde(rename = "SUD+ HID+")]
    SudPlusHidPlus,
    #[serde(rename = "LIFT")]
    Lift,
    #[serde(rename = "LIFT SUD+")]
    LiftSudPlus,
}

/// Play options. Fields are `None` when the source does not report them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreMeta {
    pub random: Option<RandomOption>,
    pub assist: Option<Assist>,
    pub gauge: Option<GaugeOption>,
    pub range: Option<RangeOption>,
}

/// A converter's output before it is bound to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryScore {
    pub game: Game,
    pub service: String,
    pub import_type: String,
    pub comment: Option<String>,
    /// Milliseconds since epoch, if the source knows when the play happened.
    pub time_achieved: Option<i64>,
    /// Source-provided unique play ID. Takes precedence over content
    /// hashing when deriving the dedup key.
    pub source_id: Option<String>,
    pub score_data: ScoreData,
    pub score_meta: ScoreMeta,
}

/// Successful conversion: the resolved catalog entities plus the dry score.
#[derive(Debug, Clone, PartialEq)]
pub struct Converted {
    pub song: Song,
    pub chart: Chart,
    pub dry_score: DryScore,
}

/// A dry score bound to a user and its dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub score_id: String,
    pub user_id: UserId,
    pub chart_id: String,
    pub song_id: i64,
    pub playtype: Playtype,
    pub time_added: i64,
    #[serde(flatten)]
    pub dry: DryScore,
}

impl Score {
    pub fn from_converted(user_id: UserId, converted: &Converted, time_added: i64) -> Self {
        Self {
            score_id: crate::dedup::score_id(user_id, &converted.chart, &converted.dry_score),
            user_id,
            chart_id: converted.chart.chart_id.clone(),
            song_id: converted.song.id,
            playtype: converted.chart.playtype,
            time_added,
            dry: converted.dry_score.clone(),
        }
    }
}

/// Best result per user and chart. Score and lamp are tracked
/// independently, so they may come from different plays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalBest {
    pub user_id: UserId,
    pub chart_id: String,
    pub best_score: u32,
    pub best_score_id: String,
    pub best_lamp: Lamp,
    pub updated_at: i64,
}

impl PersonalBest {
    /// Fold a newly committed score into the existing PB (if any).
    pub fn merge(existing: Option<PersonalBest>, score: &Score, now: i64) -> PersonalBest {
        let data = &score.dry.score_data;
        match existing {
            None => PersonalBest {
                user_id: score.user_id,
                chart_id: score.chart_id.clone(),
                best_score: data.score,
                best_score_id: score.score_id.clone(),
                best_lamp: data.lamp,
                updated_at: now,
            },
            Some(mut pb) => {
                if data.score > pb.best_score {
                    pb.best_score = data.score;
                    pb.best_score_id = score.score_id.clone();
                }
                if data.lamp > pb.best_lamp {
                    pb.best_lamp = data.lamp;
                }
                pb.updated_at = now;
                pb
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn song() -> Song {
        Song {
            id: 1,
            game: Game::Iidx,
            title: "5.1.1.".to_string(),
            artist: "dj nagureo".to_string(),
        }
    }

    pub fn chart_spa() -> Chart {
        Chart {
            chart_id: "c2311194e3897ddb5745b1760d2c0141f933e683".to_string(),
            song_id: 1,
            game: Game::Iidx,
            playtype: Playtype::SP,
            difficulty: Difficulty::Another,
            in_game_id: 1000,
            versions: vec!["26".to_string(), "27".to_string()],
            is_primary: true,
            level: "10".to_string(),
            notecount: 786,
            hash_sha256: None,
        }
    }

    pub fn dry_score(score: u32, lamp: Lamp) -> DryScore {
        DryScore {
            game: Game::Iidx,
            service: "Test".to_string(),
            import_type: "test/json".to_string(),
            comment: None,
            time_achieved: Some(10),
            source_id: None,
            score_data: ScoreData {
                score,
                percent: 100.0 * score as f64 / 1572.0,
                grade: Grade::F,
                lamp,
                judgements: Judgements::default(),
                hit_meta: HitMeta::default(),
            },
            score_meta: ScoreMeta::default(),
        }
    }
}
