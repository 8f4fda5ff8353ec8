//! Storage seam for the integration processor.
//!
//! Everything the processor reads or writes goes through the
//! [`IntegrationStore`] trait: the managed database's REST surface in
//! production ([`postgrest::PostgrestStore`]), an in-memory store in tests
//! ([`memory::MemoryStore`]). Card writes additionally pass through the
//! [`LoopSafeWriter`] capability so the outbound-sync trigger can tell
//! integration-origin writes apart from user edits.

pub mod memory;
pub mod postgrest;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use funil_core::{
    Card, CardPatch, ConflictLogEntry, Contact, ContactPatch, EventStatus, IntegrationEvent,
    ValidationLevel, ValidationOutcome,
};
use funil_core::mapping::{FieldMapping, StageMapping, UserMapping};
use funil_core::topology::{Pipeline, PipelinePhase, PipelineStage};
use funil_core::trigger::InboundTrigger;

/// Merge one bucket entry the way the database writers do: object values
/// merge key-by-key so later partial updates never drop earlier keys;
/// scalars replace.
pub fn merge_bucket_entry(
    bucket: &mut serde_json::Map<String, Value>,
    key: String,
    value: Value,
) {
    if let Value::Object(incoming) = &value {
        if let Some(Value::Object(existing)) = bucket.get_mut(&key) {
            for (nested_key, nested_value) in incoming.clone() {
                existing.insert(nested_key, nested_value);
            }
            return;
        }
    }
    bucket.insert(key, value);
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("{0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Store failures are transient from the processor's point of view: the
/// permanent error classes are all raised by resolution logic, never by I/O.
impl From<StoreError> for funil_core::ProcessError {
    fn from(error: StoreError) -> Self {
        Self::Transient(error.to_string())
    }
}

/// Provenance of a card write. The outbound-sync database trigger skips
/// re-firing for `Integration` writes; `Standard` writes behave like user
/// edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Integration,
    Standard,
}

/// Terminal-for-this-invocation event update written by the outcome
/// recorder.
#[derive(Debug, Clone)]
pub struct EventOutcome {
    pub status: EventStatus,
    pub processing_log: String,
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub matched_trigger_id: Option<Uuid>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    // Configuration, loaded once per invocation.
    async fn load_settings(&self) -> StoreResult<HashMap<String, String>>;
    async fn load_stage_mappings(&self) -> StoreResult<Vec<StageMapping>>;
    async fn load_user_mappings(&self) -> StoreResult<Vec<UserMapping>>;
    async fn load_field_mappings(&self) -> StoreResult<Vec<FieldMapping>>;
    async fn load_pipelines(&self) -> StoreResult<Vec<Pipeline>>;
    async fn load_stages(&self) -> StoreResult<Vec<PipelineStage>>;
    async fn load_phases(&self) -> StoreResult<Vec<PipelinePhase>>;
    async fn load_triggers(&self) -> StoreResult<Vec<InboundTrigger>>;

    // Event queue.
    async fn fetch_pending_events(
        &self,
        limit: usize,
        integration_id: Option<Uuid>,
    ) -> StoreResult<Vec<IntegrationEvent>>;
    async fn fetch_events_by_ids(
        &self,
        event_ids: &[Uuid],
        integration_id: Option<Uuid>,
    ) -> StoreResult<Vec<IntegrationEvent>>;
    async fn record_event_outcome(
        &self,
        event_id: Uuid,
        outcome: EventOutcome,
    ) -> StoreResult<()>;

    // Contacts.
    async fn find_contact_by_external(
        &self,
        external_source: &str,
        external_id: &str,
    ) -> StoreResult<Option<Contact>>;
    async fn find_contact_by_email(&self, email: &str) -> StoreResult<Option<Contact>>;
    async fn find_contact_by_id(&self, contact_id: Uuid) -> StoreResult<Option<Contact>>;
    /// Stored fuzzy phone-matching procedure. Transport errors are the
    /// caller's to fail open on.
    async fn match_contact_by_phone(&self, raw_phone: &str) -> StoreResult<Option<Uuid>>;
    async fn insert_contact(&self, contact: Contact) -> StoreResult<Contact>;
    async fn update_contact(&self, contact_id: Uuid, patch: ContactPatch) -> StoreResult<()>;
    /// Conflict-ignore upsert into the normalized-phone index.
    async fn upsert_phone_index(
        &self,
        contact_id: Uuid,
        normalized_phone: &str,
    ) -> StoreResult<()>;

    // Cards.
    async fn find_card_by_external(
        &self,
        external_source: &str,
        external_id: &str,
    ) -> StoreResult<Option<Card>>;
    async fn insert_card(&self, card: Card, origin: WriteOrigin) -> StoreResult<Card>;
    async fn update_card(
        &self,
        card_id: Uuid,
        patch: CardPatch,
        origin: WriteOrigin,
    ) -> StoreResult<()>;

    // Quality gate and audit trail.
    async fn validate_card_for_stage(
        &self,
        card_payload: &Value,
        target_stage_id: Uuid,
        source: &str,
        level: ValidationLevel,
    ) -> StoreResult<ValidationOutcome>;
    async fn insert_conflict_log(&self, entry: ConflictLogEntry) -> StoreResult<()>;

    /// Resolve a session token to the profile role of its user, for the
    /// authorizer's admin-session path.
    async fn resolve_session_role(&self, token: &str) -> StoreResult<Option<String>>;

    /// Whether this store can stamp card writes with integration origin.
    fn loop_safety_available(&self) -> bool;
}

/// Capability object the entity writer holds: every card write through it is
/// flagged as integration-origin so the outbound sync trigger does not
/// re-fire and loop the update back out. Falls back to the standard write
/// path when the store has no origin channel; callers surface that in the
/// event log.
#[derive(Clone)]
pub struct LoopSafeWriter {
    store: Arc<dyn IntegrationStore>,
    enabled: bool,
}

impl LoopSafeWriter {
    pub fn new(store: Arc<dyn IntegrationStore>) -> Self {
        let enabled = store.loop_safety_available();
        if !enabled {
            tracing::warn!("loop prevention disabled: store has no write-origin channel");
        }
        Self { store, enabled }
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    const fn origin(&self) -> WriteOrigin {
        if self.enabled {
            WriteOrigin::Integration
        } else {
            WriteOrigin::Standard
        }
    }

    pub async fn insert_card(&self, card: Card) -> StoreResult<Card> {
        self.store.insert_card(card, self.origin()).await
    }

    pub async fn update_card(&self, card_id: Uuid, patch: CardPatch) -> StoreResult<()> {
        self.store.update_card(card_id, patch, self.origin()).await
    }
}
