use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Rejected,
    Quarantined,
    Forced,
}

impl ConflictResolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::Quarantined => "quarantined",
            Self::Forced => "forced",
        }
    }
}

/// Audit record written whenever the quality gate fails or is overridden.
/// Insert-only; operators read these to tune stage requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictLogEntry {
    pub id: Uuid,
    pub event_id: Uuid,
    #[serde(default)]
    pub trigger_id: Option<Uuid>,
    pub conflict_type: String,
    #[serde(default)]
    pub target_stage_id: Option<Uuid>,
    #[serde(default)]
    pub actual_stage_id: Option<Uuid>,
    #[serde(default)]
    pub missing_requirements: Vec<String>,
    pub resolution: ConflictResolution,
    pub created_at: DateTime<Utc>,
}

/// Result of the stored quality-gate procedure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(default)]
    pub can_bypass: bool,
    #[serde(default)]
    pub missing_requirements: Vec<String>,
}

impl ValidationOutcome {
    pub const fn pass() -> Self {
        Self {
            valid: true,
            can_bypass: false,
            missing_requirements: Vec::new(),
        }
    }
}
