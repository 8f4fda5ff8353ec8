use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Source tag recorded on every entity mirrored from ActiveCampaign.
pub const EXTERNAL_SOURCE_ACTIVE_CAMPAIGN: &str = "active_campaign";

/// Payload keys in the externally-flattened notation the ingest front door
/// stores verbatim (`deal[stageid]` style, straight from the webhook form
/// encoding). Anything not listed here is treated as a custom field and
/// routed through the field mapper.
pub mod payload_keys {
    pub const DEAL_ID: &str = "deal[id]";
    pub const DEAL_TITLE: &str = "deal[title]";
    pub const DEAL_VALUE: &str = "deal[value]";
    pub const DEAL_PIPELINE: &str = "deal[pipelineid]";
    pub const DEAL_STAGE: &str = "deal[stageid]";
    pub const DEAL_OWNER: &str = "deal[owner]";
    pub const DEAL_STATUS: &str = "deal[status]";
    pub const DEAL_CDATE: &str = "deal[cdate]";
    pub const DEAL_ORIGIN: &str = "deal[origin]";
    pub const CONTACT_ID: &str = "contact[id]";
    pub const CONTACT_EMAIL: &str = "contact[email]";
    pub const CONTACT_PHONE: &str = "contact[phone]";
    pub const CONTACT_FIRST_NAME: &str = "contact[first_name]";
    pub const CONTACT_LAST_NAME: &str = "contact[last_name]";
    pub const MANUAL_SYNC: &str = "manual_sync";
}

/// ActiveCampaign deal status codes as they arrive on the wire.
pub const AC_STATUS_LOST: &str = "2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Deal,
    Contact,
    DealActivity,
}

impl EntityType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deal => "deal",
            Self::Contact => "contact",
            Self::DealActivity => "dealActivity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DealAdd,
    DealUpdate,
    DealState,
    ContactAdd,
    ContactUpdate,
    #[serde(untagged)]
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::DealAdd => "deal_add",
            Self::DealUpdate => "deal_update",
            Self::DealState => "deal_state",
            Self::ContactAdd => "contact_add",
            Self::ContactUpdate => "contact_update",
            Self::Other(raw) => raw.as_str(),
        }
    }

    /// Whether this event creates an entity, as opposed to mutating one.
    /// Trigger `action_type` compatibility keys off this.
    pub const fn is_creation(&self) -> bool {
        matches!(self, Self::DealAdd | Self::ContactAdd)
    }

    /// Events that carry (or may carry) a stage move.
    pub const fn moves_stage(&self) -> bool {
        matches!(self, Self::DealAdd | Self::DealUpdate | Self::DealState)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processed,
    ProcessedShadow,
    Ignored,
    Blocked,
    Failed,
}

impl EventStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::ProcessedShadow => "processed_shadow",
            Self::Ignored => "ignored",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }
}

/// One queued webhook occurrence. Created by the ingest front door; only the
/// outcome recorder mutates it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationEvent {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub entity_type: EntityType,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub status: EventStatus,
    #[serde(default)]
    pub attempts: i32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub matched_trigger_id: Option<Uuid>,
    #[serde(default)]
    pub processing_log: String,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl IntegrationEvent {
    /// Payload value as a trimmed string, accepting the string/number/bool
    /// shapes webhook form re-encoding produces. `None` for missing keys and
    /// non-scalar values.
    pub fn payload_str(&self, key: &str) -> Option<String> {
        self.payload.get(key).and_then(value_as_trimmed_string)
    }

    /// Like [`payload_str`](Self::payload_str) but treating blank strings as
    /// absent.
    pub fn payload_non_empty(&self, key: &str) -> Option<String> {
        self.payload_str(key).filter(|value| !value.is_empty())
    }

    pub fn external_deal_id(&self) -> Option<String> {
        self.payload_non_empty(payload_keys::DEAL_ID)
    }

    pub fn external_pipeline_id(&self) -> Option<String> {
        self.payload_non_empty(payload_keys::DEAL_PIPELINE)
    }

    pub fn external_stage_id(&self) -> Option<String> {
        self.payload_non_empty(payload_keys::DEAL_STAGE)
    }

    pub fn external_owner_id(&self) -> Option<String> {
        self.payload_non_empty(payload_keys::DEAL_OWNER)
    }

    /// The external system reports this deal as lost.
    pub fn reports_lost(&self) -> bool {
        self.payload_str(payload_keys::DEAL_STATUS)
            .is_some_and(|status| status == AC_STATUS_LOST || status.eq_ignore_ascii_case("lost"))
    }

    /// Manual re-syncs are operator-initiated and bypass trigger and quality
    /// gates.
    pub fn is_manual_sync(&self) -> bool {
        match self.payload.get(payload_keys::MANUAL_SYNC) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(raw)) => {
                let raw = raw.trim();
                raw.eq_ignore_ascii_case("true") || raw == "1"
            }
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            _ => false,
        }
    }

    /// External creation timestamp, when parseable. ActiveCampaign sends
    /// ISO-8601 with offset.
    pub fn external_created_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.payload_non_empty(payload_keys::DEAL_CDATE)?;
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
            .filter(|parsed| *parsed <= Utc::now())
    }
}

pub fn value_as_trimmed_string(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => Some(raw.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
