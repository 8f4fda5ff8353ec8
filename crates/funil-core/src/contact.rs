use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Internal person record, deduplicated across integrations by a three-tier
/// waterfall: external link, then email, then normalized phone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub external_source: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub nome: Option<String>,
    #[serde(default)]
    pub sobrenome: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub marketing_data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContactPatch {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub nome: Option<String>,
    pub sobrenome: Option<String>,
    /// Backfill of a missing external link. Writers must only apply this when
    /// the stored contact has no link at all.
    pub external_id: Option<String>,
    pub external_source: Option<String>,
    /// Mapped column assignments for contact-scoped field mappings.
    pub columns: Map<String, Value>,
    pub marketing_data: Map<String, Value>,
}

impl ContactPatch {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.phone.is_none()
            && self.nome.is_none()
            && self.sobrenome.is_none()
            && self.external_id.is_none()
            && self.external_source.is_none()
            && self.columns.is_empty()
            && self.marketing_data.is_empty()
    }
}

/// Split a webhook name into (nome, sobrenome). ActiveCampaign usually sends
/// first/last separately; when only a full name arrives, split on the first
/// space.
pub fn split_name(full_name: &str) -> (Option<String>, Option<String>) {
    let trimmed = full_name.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    match trimmed.split_once(' ') {
        Some((first, rest)) => (
            Some(first.to_string()),
            Some(rest.trim().to_string()).filter(|s| !s.is_empty()),
        ),
        None => (Some(trimmed.to_string()), None),
    }
}
