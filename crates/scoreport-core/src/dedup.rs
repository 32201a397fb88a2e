//! Stable content hashes used as identity keys.
//!
//! Both keys hash a canonical JSON encoding (object keys sorted at every
//! level), so the same logical record always produces the same key no
//! matter how its source ordered the fields.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::models::{Chart, DryScore, UserId};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Serialize `value` with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let entries: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical_json(v))).collect();
            let body = entries
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String((*k).clone()), v))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{}]", body)
        }
        other => other.to_string(),
    }
}

/// Dedup key of a committed score (`R` + 64 hex chars).
///
/// Derived from the explicit source ID when the converter provides one,
/// otherwise from the fields that discriminate one play from another.
pub fn score_id(user_id: UserId, chart: &Chart, dry: &DryScore) -> String {
    let payload = match &dry.source_id {
        Some(source_id) => json!({
            "user": user_id,
            "importType": dry.import_type,
            "sourceID": source_id,
        }),
        None => json!({
            "user": user_id,
            "chart": chart.chart_id,
            "score": dry.score_data.score,
            "lamp": dry.score_data.lamp,
            "judgements": dry.score_data.judgements,
            "timeAchieved": dry.time_achieved,
        }),
    };
    format!("R{}", sha256_hex(canonical_json(&payload).as_bytes()))
}

/// Identity of an orphaned record (`O` + 64 hex chars).
pub fn orphan_id(user_id: UserId, import_type: &str, raw: &Value, context: &Value) -> String {
    let payload = json!([user_id, import_type, raw, context]);
    format!("O{}", sha256_hex(canonical_json(&payload).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{chart_spa, dry_score};
    use crate::models::Lamp;

    #[test]
    fn test_score_id_is_stable() {
        let chart = chart_spa();
        let a = score_id(1, &chart, &dry_score(500, Lamp::Clear));
        let b = score_id(1, &chart, &dry_score(500, Lamp::Clear));
        assert_eq!(a, b);
        assert!(a.starts_with('R'));
        assert_eq!(a.len(), 65);
    }

    #[test]
    fn test_score_id_discriminates() {
        let chart = chart_spa();
        let base = score_id(1, &chart, &dry_score(500, Lamp::Clear));
        assert_ne!(base, score_id(2, &chart, &dry_score(500, Lamp::Clear)));
        assert_ne!(base, score_id(1, &chart, &dry_score(501, Lamp::Clear)));
        assert_ne!(base, score_id(1, &chart, &dry_score(500, Lamp::HardClear)));

        let mut later = dry_score(500, Lamp::Clear);
        later.time_achieved = Some(11);
        assert_ne!(base, score_id(1, &chart, &later));
    }

    #[test]
    fn test_explicit_source_id_wins() {
        let chart = chart_spa();
        let mut a = dry_score(500, Lamp::Clear);
        a.source_id = Some("play-42".to_string());
        let mut b = dry_score(900, Lamp::FullCombo);
        b.source_id = Some("play-42".to_string());
        assert_eq!(score_id(1, &chart, &a), score_id(1, &chart, &b));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let v: Value = serde_json::from_str(r#"{"b":{"y":1,"x":[{"q":2,"p":1}]},"a":null}"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"a":null,"b":{"x":[{"p":1,"q":2}],"y":1}}"#);
    }

    #[test]
    fn test_orphan_id_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"chart":"spa","entry_id":1}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"entry_id":1,"chart":"spa"}"#).unwrap();
        let ctx = json!({"version": "27"});
        assert_eq!(
            orphan_id(1, "ir/fervidex", &a, &ctx),
            orphan_id(1, "ir/fervidex", &b, &ctx)
        );
        assert_ne!(
            orphan_id(1, "ir/fervidex", &a, &ctx),
            orphan_id(2, "ir/fervidex", &a, &ctx)
        );
    }
}
