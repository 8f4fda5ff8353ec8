//! Run-mode and scope resolution from the settings key/value table.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::event::EventType;

pub const SETTING_SHADOW_MODE: &str = "SHADOW_MODE_ENABLED";
pub const SETTING_WRITE_MODE: &str = "WRITE_MODE_ENABLED";
pub const SETTING_ALLOWED_EVENT_TYPES: &str = "ALLOWED_EVENT_TYPES";
pub const SETTING_DEFAULT_NEW_LEAD_STAGE: &str = "DEFAULT_NEW_LEAD_STAGE_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Write,
    Shadow,
}

impl RunMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Write => "WRITE",
            Self::Shadow => "SHADOW",
        }
    }

    pub const fn is_shadow(self) -> bool {
        matches!(self, Self::Shadow)
    }
}

/// Shadow only when explicitly asked for: the shadow flag is literally
/// "true", or the write flag is literally "false". Absent settings mean
/// WRITE — do not reintroduce default-shadow.
pub fn resolve_run_mode(settings: &HashMap<String, String>) -> RunMode {
    let flag = |key: &str| settings.get(key).map(|value| value.trim().to_lowercase());
    if flag(SETTING_SHADOW_MODE).as_deref() == Some("true")
        || flag(SETTING_WRITE_MODE).as_deref() == Some("false")
    {
        RunMode::Shadow
    } else {
        RunMode::Write
    }
}

/// Event types this deployment processes. Comma-separated setting; defaults
/// to the deal lifecycle set when unconfigured.
pub fn allowed_event_types(settings: &HashMap<String, String>) -> HashSet<EventType> {
    settings
        .get(SETTING_ALLOWED_EVENT_TYPES)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(parse_event_type)
                .collect()
        })
        .filter(|set: &HashSet<EventType>| !set.is_empty())
        .unwrap_or_else(|| {
            HashSet::from([EventType::DealAdd, EventType::DealUpdate, EventType::DealState])
        })
}

fn parse_event_type(raw: &str) -> EventType {
    match raw {
        "deal_add" => EventType::DealAdd,
        "deal_update" => EventType::DealUpdate,
        "deal_state" => EventType::DealState,
        "contact_add" => EventType::ContactAdd,
        "contact_update" => EventType::ContactUpdate,
        other => EventType::Other(other.to_string()),
    }
}

/// Fallback stage for new-lead imports with no stage mapping.
pub fn default_new_lead_stage(settings: &HashMap<String, String>) -> Option<Uuid> {
    settings
        .get(SETTING_DEFAULT_NEW_LEAD_STAGE)
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
}
