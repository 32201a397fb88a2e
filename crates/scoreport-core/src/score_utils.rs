//! Shared derivations used by every converter: percent, grade, and gauge
//! normalization.

use crate::failure::ConversionFailure;
use crate::models::{Chart, Grade};

/// Legal upper bound of a sampled gauge value; larger samples are sensor
/// noise and become unknown.
pub const GAUGE_SAMPLE_MAX: u32 = 200;

/// Legal upper bound of the terminal gauge value.
pub const GAUGE_TERMINAL_MAX: u32 = 100;

/// Grade thresholds in ninths of the maximum score, best first.
const GRADE_NINTHS: [(Grade, u32); 7] = [
    (Grade::AAA, 8),
    (Grade::AA, 7),
    (Grade::A, 6),
    (Grade::B, 5),
    (Grade::C, 4),
    (Grade::D, 3),
    (Grade::E, 2),
];

/// Compute percent and grade for `score` on `chart`.
///
/// Scores above the chart's maximum are rejected, never clamped.
pub fn grade_and_percent(score: u32, chart: &Chart) -> Result<(f64, Grade), ConversionFailure> {
    let max = chart.max_score();
    if max == 0 {
        return Err(ConversionFailure::Internal(format!(
            "Chart {} has a notecount of 0",
            chart.chart_id
        )));
    }

    let percent = 100.0 * score as f64 / max as f64;
    if percent > 100.0 {
        return Err(ConversionFailure::InvalidScore(format!(
            "Invalid percent {} (score {} on a chart with max {}).",
            percent, score, max
        )));
    }

    // Integer comparison avoids float rounding at the exact boundary.
    let grade = GRADE_NINTHS
        .iter()
        .find(|(_, ninths)| u64::from(score) * 9 >= u64::from(max) * u64::from(*ninths))
        .map(|(g, _)| *g)
        .unwrap_or(Grade::F);

    Ok((percent, grade))
}

/// Null out gauge samples above [`GAUGE_SAMPLE_MAX`] and validate the
/// terminal value.
///
/// Returns the normalized history and the terminal gauge (the last sample,
/// after normalization).
pub fn normalize_gauge(
    history: &[u32],
) -> Result<(Vec<Option<u32>>, Option<u32>), ConversionFailure> {
    let normalized: Vec<Option<u32>> = history
        .iter()
        .map(|&g| if g > GAUGE_SAMPLE_MAX { None } else { Some(g) })
        .collect();

    let terminal = normalized.last().copied().flatten();
    if let Some(gauge) = terminal {
        if gauge > GAUGE_TERMINAL_MAX {
            return Err(ConversionFailure::InvalidScore(format!(
                "Invalid value of gauge {}.",
                gauge
            )));
        }
    }

    Ok((normalized, terminal))
}
