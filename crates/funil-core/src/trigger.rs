use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{EntityType, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateOnly,
    UpdateOnly,
    All,
}

impl ActionType {
    /// `create_only` matches only creation events; `update_only` matches all
    /// non-creation events; `all` matches everything.
    pub const fn allows(self, event_type: &EventType) -> bool {
        match self {
            Self::CreateOnly => event_type.is_creation(),
            Self::UpdateOnly => !event_type.is_creation(),
            Self::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineMode {
    Stage,
    Reject,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    None,
    Basic,
    Strict,
}

impl ValidationLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Strict => "strict",
        }
    }
}

/// A rule scoping which inbound events may create/update entities, and how
/// the quality gate treats them. Empty scoping arrays mean "any".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundTrigger {
    pub id: Uuid,
    pub integration_id: Uuid,
    #[serde(default)]
    pub external_pipeline_ids: Vec<String>,
    #[serde(default)]
    pub external_stage_ids: Vec<String>,
    #[serde(default)]
    pub external_owner_ids: Vec<String>,
    #[serde(default)]
    pub entity_types: Vec<EntityType>,
    pub action_type: ActionType,
    #[serde(default)]
    pub target_stage_id: Option<Uuid>,
    #[serde(default)]
    pub target_pipeline_id: Option<Uuid>,
    #[serde(default = "default_validation_level")]
    pub validation_level: ValidationLevel,
    #[serde(default)]
    pub bypass_validation: bool,
    #[serde(default = "default_quarantine_mode")]
    pub quarantine_mode: QuarantineMode,
    #[serde(default)]
    pub quarantine_stage_id: Option<Uuid>,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
}

const fn default_validation_level() -> ValidationLevel {
    ValidationLevel::Basic
}

const fn default_quarantine_mode() -> QuarantineMode {
    QuarantineMode::Reject
}

const fn default_is_active() -> bool {
    true
}

#[derive(Debug, Clone, Copy)]
pub struct TriggerContext<'a> {
    pub integration_id: Uuid,
    pub external_pipeline_id: Option<&'a str>,
    pub external_stage_id: Option<&'a str>,
    pub external_owner_id: Option<&'a str>,
    pub entity_type: EntityType,
    pub event_type: &'a EventType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision<'a> {
    /// Allowed, either by a matching trigger or because the integration has
    /// none configured (backward-compatible default-allow).
    Allowed(Option<&'a InboundTrigger>),
    /// The integration has triggers but none matched: allowlist semantics.
    Blocked,
}

fn scope_matches(scope: &[String], candidate: Option<&str>) -> bool {
    if scope.is_empty() {
        return true;
    }
    candidate.is_some_and(|value| scope.iter().any(|entry| entry == value))
}

impl InboundTrigger {
    pub fn matches(&self, ctx: &TriggerContext<'_>) -> bool {
        self.is_active
            && self.integration_id == ctx.integration_id
            && self.action_type.allows(ctx.event_type)
            && (self.entity_types.is_empty() || self.entity_types.contains(&ctx.entity_type))
            && scope_matches(&self.external_pipeline_ids, ctx.external_pipeline_id)
            && scope_matches(&self.external_stage_ids, ctx.external_stage_id)
            && scope_matches(&self.external_owner_ids, ctx.external_owner_id)
    }
}

/// Evaluate the entry gate. With zero active triggers for the integration,
/// everything passes; with one or more, the set acts as an allowlist.
pub fn evaluate_triggers<'a>(
    triggers: &'a [InboundTrigger],
    ctx: &TriggerContext<'_>,
) -> TriggerDecision<'a> {
    let mut saw_active = false;
    for trigger in triggers {
        if !trigger.is_active || trigger.integration_id != ctx.integration_id {
            continue;
        }
        saw_active = true;
        if trigger.matches(ctx) {
            return TriggerDecision::Allowed(Some(trigger));
        }
    }
    if saw_active {
        TriggerDecision::Blocked
    } else {
        TriggerDecision::Allowed(None)
    }
}
