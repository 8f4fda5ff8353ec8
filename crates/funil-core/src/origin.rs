//! Lead-origin (`origem`) taxonomy resolution for card creation.

use serde_json::{Map, Value};

use crate::fields::is_empty_value;

/// Canonical origin bucket for anything marketing-flavored.
pub const ORIGEM_MARKETING: &str = "marketing";

/// Values the admin UI recognizes as first-class origins. Anything else goes
/// through the marketing heuristics or the source fallback.
pub const RECOGNIZED_ORIGINS: &[&str] = &[
    "indicacao",
    "organico",
    "trafego_pago",
    "evento",
    "outbound",
    "parceria",
    ORIGEM_MARKETING,
];

const MARKETING_HINTS: &[&str] = &["marketing", "mkt", "campanha", "anuncio", "ads", "trafego"];

fn normalize(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|ch| match ch {
            ' ' | '-' => '_',
            'á' | 'ã' | 'â' | 'à' => 'a',
            'é' | 'ê' => 'e',
            'í' => 'i',
            'ó' | 'õ' | 'ô' => 'o',
            'ú' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

/// Whether the payload carries any non-empty UTM parameter, in either the
/// bare (`utm_source`) or bracketed (`contact[utm_source]`) notation.
pub fn payload_has_utm(payload: &Map<String, Value>) -> bool {
    payload.iter().any(|(key, value)| {
        (key.starts_with("utm_") || key.contains("[utm_")) && !is_empty_value(value)
    })
}

/// Resolve the `origem` for a new card. Priority: an explicitly recognized
/// origin value, then marketing-flavored free text, then UTM presence, then
/// a source-specific fallback tag.
pub fn resolve_origem(origin_value: Option<&str>, has_utm: bool, source_fallback: &str) -> String {
    if let Some(raw) = origin_value {
        let normalized = normalize(raw);
        if !normalized.is_empty() {
            if RECOGNIZED_ORIGINS.contains(&normalized.as_str()) {
                return normalized;
            }
            if MARKETING_HINTS.iter().any(|hint| normalized.contains(hint)) {
                return ORIGEM_MARKETING.to_string();
            }
        }
    }
    if has_utm {
        return ORIGEM_MARKETING.to_string();
    }
    source_fallback.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recognized_origin_wins() {
        assert_eq!(
            resolve_origem(Some("Indicação"), true, "active_campaign"),
            "indicacao"
        );
    }

    #[test]
    fn marketing_text_maps_to_marketing_bucket() {
        assert_eq!(
            resolve_origem(Some("Campanha de inverno"), false, "active_campaign"),
            ORIGEM_MARKETING
        );
        assert_eq!(
            resolve_origem(Some("Facebook Ads"), false, "active_campaign"),
            ORIGEM_MARKETING
        );
    }

    #[test]
    fn utm_presence_defaults_to_marketing() {
        assert_eq!(
            resolve_origem(Some("???"), true, "active_campaign"),
            ORIGEM_MARKETING
        );
        assert_eq!(resolve_origem(None, true, "active_campaign"), ORIGEM_MARKETING);
    }

    #[test]
    fn falls_back_to_source_tag() {
        assert_eq!(
            resolve_origem(None, false, "active_campaign"),
            "active_campaign"
        );
        assert_eq!(
            resolve_origem(Some("???"), false, "active_campaign"),
            "active_campaign"
        );
    }

    #[test]
    fn utm_detection_handles_both_notations() {
        let mut payload = Map::new();
        payload.insert("contact[utm_source]".into(), json!("google"));
        assert!(payload_has_utm(&payload));

        let mut payload = Map::new();
        payload.insert("utm_campaign".into(), json!(""));
        assert!(!payload_has_utm(&payload));
    }
}
