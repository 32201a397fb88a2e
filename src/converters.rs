//! Built-in converters and the catalog lookups they share.

use scoreport_core::convert::ConverterRegistry;
use scoreport_core::failure::ConversionFailure;
use scoreport_core::models::{Chart, ChartQuery, Song};
use scoreport_core::store::Catalog;

use crate::converter_fervidex::FervidexConverter;
use crate::converter_mer::MerConverter;

/// Registry with every import type this build understands.
pub fn builtin() -> ConverterRegistry {
    let mut registry = ConverterRegistry::new();
    registry.register(FervidexConverter);
    registry.register(MerConverter);
    registry
}

/// Resolve `query`, reporting a miss in terms of `described`.
///
/// Catalog I/O errors come back as internal failures so the converter can
/// stop; `Pipeline::convert` sees the underlying error and turns the run
/// fatal instead of skipping the record.
pub(crate) async fn find_chart(
    catalog: &dyn Catalog,
    query: &ChartQuery,
    described: &ChartQuery,
) -> Result<Chart, ConversionFailure> {
    catalog
        .find_chart(query)
        .await
        .map_err(|e| ConversionFailure::Internal(format!("Catalog lookup failed: {:#}", e)))?
        .ok_or_else(|| {
            ConversionFailure::SongOrChartNotFound(format!(
                "Could not find chart with {}.",
                described
            ))
        })
}

pub(crate) async fn find_song(catalog: &dyn Catalog, chart: &Chart) -> Result<Song, ConversionFailure> {
    catalog
        .find_song(chart.game, chart.song_id)
        .await
        .map_err(|e| ConversionFailure::Internal(format!("Catalog lookup failed: {:#}", e)))?
        .ok_or_else(|| {
            ConversionFailure::Internal(format!(
                "Song {} ({}) has no parent song?",
                chart.song_id,
                chart.game.as_str()
            ))
        })
}

#[cfg(test)]
pub(crate) mod test_support {
    use scoreport_core::models::{Chart, Difficulty, Game, Playtype, Song};
    use scoreport_core::store::memory::InMemoryCatalog;

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

    pub fn catalog() -> InMemoryCatalog {
        let catalog = InMemoryCatalog::new();
        catalog.add_song(song());
        catalog.add_chart(chart_spa());
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registers_both_formats() {
        let registry = builtin();
        assert_eq!(registry.import_types(), vec!["ir/fervidex", "file/mer-iidx"]);
        assert!(registry.find("ir/fervidex").is_some());
        assert!(registry.find("file/mer-iidx").is_some());
        assert!(registry.find("ir/unknown").is_none());
    }
}
