//! In-memory [`IntegrationStore`] used by unit and end-to-end tests. Mirrors
//! the merge semantics of the REST store so tests exercise the same
//! contracts the production path relies on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use funil_core::mapping::{FieldMapping, StageMapping, UserMapping};
use funil_core::phone::normalize_phone;
use funil_core::topology::{Pipeline, PipelinePhase, PipelineStage};
use funil_core::trigger::InboundTrigger;
use funil_core::{
    Card, CardPatch, ConflictLogEntry, Contact, ContactPatch, EventStatus, IntegrationEvent,
    ValidationLevel, ValidationOutcome,
};

use crate::{
    EventOutcome, IntegrationStore, StoreError, StoreResult, WriteOrigin, merge_bucket_entry,
};

#[derive(Default)]
struct MemoryState {
    settings: HashMap<String, String>,
    stage_mappings: Vec<StageMapping>,
    user_mappings: Vec<UserMapping>,
    field_mappings: Vec<FieldMapping>,
    pipelines: Vec<Pipeline>,
    stages: Vec<PipelineStage>,
    phases: Vec<PipelinePhase>,
    triggers: Vec<InboundTrigger>,
    events: Vec<IntegrationEvent>,
    contacts: Vec<Contact>,
    phone_index: HashMap<String, Uuid>,
    cards: Vec<Card>,
    /// Column assignments that have no typed field on [`Card`]; the real
    /// database has these as columns, tests assert on them here.
    extra_columns: HashMap<Uuid, Map<String, Value>>,
    conflict_logs: Vec<ConflictLogEntry>,
    session_roles: HashMap<String, String>,
    validation_by_stage: HashMap<Uuid, ValidationOutcome>,
    validation_rpc_fails: bool,
    phone_rpc_fails: bool,
    card_write_failures: u32,
    write_origins: Vec<WriteOrigin>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_setting(&self, key: &str, value: &str) {
        self.state
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
    }

    pub async fn seed_stage_mapping(&self, mapping: StageMapping) {
        self.state.write().await.stage_mappings.push(mapping);
    }

    pub async fn seed_user_mapping(&self, mapping: UserMapping) {
        self.state.write().await.user_mappings.push(mapping);
    }

    pub async fn seed_field_mapping(&self, mapping: FieldMapping) {
        self.state.write().await.field_mappings.push(mapping);
    }

    pub async fn seed_topology(
        &self,
        pipelines: Vec<Pipeline>,
        stages: Vec<PipelineStage>,
        phases: Vec<PipelinePhase>,
    ) {
        let mut state = self.state.write().await;
        state.pipelines.extend(pipelines);
        state.stages.extend(stages);
        state.phases.extend(phases);
    }

    pub async fn seed_trigger(&self, trigger: InboundTrigger) {
        self.state.write().await.triggers.push(trigger);
    }

    pub async fn seed_event(&self, event: IntegrationEvent) {
        self.state.write().await.events.push(event);
    }

    pub async fn seed_contact(&self, contact: Contact) {
        self.state.write().await.contacts.push(contact);
    }

    pub async fn seed_card(&self, card: Card) {
        self.state.write().await.cards.push(card);
    }

    pub async fn seed_session_role(&self, token: &str, role: &str) {
        self.state
            .write()
            .await
            .session_roles
            .insert(token.to_string(), role.to_string());
    }

    pub async fn set_validation_outcome(&self, stage_id: Uuid, outcome: ValidationOutcome) {
        self.state
            .write()
            .await
            .validation_by_stage
            .insert(stage_id, outcome);
    }

    pub async fn fail_validation_rpc(&self, fail: bool) {
        self.state.write().await.validation_rpc_fails = fail;
    }

    pub async fn fail_phone_rpc(&self, fail: bool) {
        self.state.write().await.phone_rpc_fails = fail;
    }

    /// Make the next `count` card writes fail with a transient backend
    /// error, for retry-path tests.
    pub async fn inject_card_write_failures(&self, count: u32) {
        self.state.write().await.card_write_failures = count;
    }

    pub async fn event(&self, event_id: Uuid) -> Option<IntegrationEvent> {
        self.state
            .read()
            .await
            .events
            .iter()
            .find(|event| event.id == event_id)
            .cloned()
    }

    pub async fn cards(&self) -> Vec<Card> {
        self.state.read().await.cards.clone()
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.state.read().await.contacts.clone()
    }

    pub async fn conflict_logs(&self) -> Vec<ConflictLogEntry> {
        self.state.read().await.conflict_logs.clone()
    }

    pub async fn write_origins(&self) -> Vec<WriteOrigin> {
        self.state.read().await.write_origins.clone()
    }

    pub async fn extra_columns(&self, card_id: Uuid) -> Map<String, Value> {
        self.state
            .read()
            .await
            .extra_columns
            .get(&card_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn phone_index(&self) -> HashMap<String, Uuid> {
        self.state.read().await.phone_index.clone()
    }
}

fn apply_card_patch(card: &mut Card, extra: &mut Map<String, Value>, patch: CardPatch) {
    if let Some(titulo) = patch.titulo {
        card.titulo = titulo;
    }
    if let Some(valor) = patch.valor_estimado {
        card.valor_estimado = Some(valor);
    }
    if let Some(status) = patch.status_comercial {
        card.status_comercial = status;
    }
    if let Some(stage) = patch.pipeline_stage_id {
        card.pipeline_stage_id = Some(stage);
    }
    if let Some(pipeline) = patch.pipeline_id {
        card.pipeline_id = Some(pipeline);
    }
    if let Some(produto) = patch.produto {
        card.produto = Some(produto);
    }
    if let Some(owner) = patch.dono_atual_id {
        card.dono_atual_id = Some(owner);
    }
    if let Some(sdr) = patch.sdr_id {
        card.sdr_id = Some(sdr);
    }
    if let Some(planner) = patch.planner_id {
        card.planner_id = Some(planner);
    }
    if let Some(posvenda) = patch.posvenda_id {
        card.posvenda_id = Some(posvenda);
    }
    if let Some(contato) = patch.contato_id {
        card.contato_id = Some(contato);
    }
    if let Some(origem) = patch.origem {
        card.origem = Some(origem);
    }
    for (column, value) in patch.columns {
        match column.as_str() {
            "titulo" => {
                if let Some(titulo) = value.as_str() {
                    card.titulo = titulo.to_string();
                }
            }
            "valor_estimado" => card.valor_estimado = value.as_f64(),
            "origem" => card.origem = value.as_str().map(str::to_string),
            "produto" => card.produto = value.as_str().map(str::to_string),
            _ => {
                extra.insert(column, value);
            }
        }
    }
    for (key, value) in patch.marketing_data {
        merge_bucket_entry(&mut card.marketing_data, key, value);
    }
    for (key, value) in patch.produto_data {
        merge_bucket_entry(&mut card.produto_data, key, value);
    }
    for (key, value) in patch.briefing_inicial {
        merge_bucket_entry(&mut card.briefing_inicial, key, value);
    }
}

#[async_trait]
impl IntegrationStore for MemoryStore {
    async fn load_settings(&self) -> StoreResult<HashMap<String, String>> {
        Ok(self.state.read().await.settings.clone())
    }

    async fn load_stage_mappings(&self) -> StoreResult<Vec<StageMapping>> {
        Ok(self.state.read().await.stage_mappings.clone())
    }

    async fn load_user_mappings(&self) -> StoreResult<Vec<UserMapping>> {
        Ok(self.state.read().await.user_mappings.clone())
    }

    async fn load_field_mappings(&self) -> StoreResult<Vec<FieldMapping>> {
        Ok(self.state.read().await.field_mappings.clone())
    }

    async fn load_pipelines(&self) -> StoreResult<Vec<Pipeline>> {
        Ok(self.state.read().await.pipelines.clone())
    }

    async fn load_stages(&self) -> StoreResult<Vec<PipelineStage>> {
        Ok(self.state.read().await.stages.clone())
    }

    async fn load_phases(&self) -> StoreResult<Vec<PipelinePhase>> {
        Ok(self.state.read().await.phases.clone())
    }

    async fn load_triggers(&self) -> StoreResult<Vec<InboundTrigger>> {
        Ok(self.state.read().await.triggers.clone())
    }

    async fn fetch_pending_events(
        &self,
        limit: usize,
        integration_id: Option<Uuid>,
    ) -> StoreResult<Vec<IntegrationEvent>> {
        let now = Utc::now();
        let state = self.state.read().await;
        let mut due: Vec<IntegrationEvent> = state
            .events
            .iter()
            .filter(|event| event.status == EventStatus::Pending)
            .filter(|event| event.next_retry_at.is_none_or(|at| at <= now))
            .filter(|event| integration_id.is_none_or(|id| event.integration_id == id))
            .cloned()
            .collect();
        due.sort_by_key(|event| event.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn fetch_events_by_ids(
        &self,
        event_ids: &[Uuid],
        integration_id: Option<Uuid>,
    ) -> StoreResult<Vec<IntegrationEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|event| event_ids.contains(&event.id))
            .filter(|event| integration_id.is_none_or(|id| event.integration_id == id))
            .cloned()
            .collect())
    }

    async fn record_event_outcome(
        &self,
        event_id: Uuid,
        outcome: EventOutcome,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let event = state
            .events
            .iter_mut()
            .find(|event| event.id == event_id)
            .ok_or_else(|| StoreError::Backend(format!("event {event_id} not found")))?;
        event.status = outcome.status;
        event.processing_log = outcome.processing_log;
        event.attempts = outcome.attempts;
        event.next_retry_at = outcome.next_retry_at;
        event.matched_trigger_id = outcome.matched_trigger_id;
        event.processed_at = outcome.processed_at;
        Ok(())
    }

    async fn find_contact_by_external(
        &self,
        external_source: &str,
        external_id: &str,
    ) -> StoreResult<Option<Contact>> {
        Ok(self
            .state
            .read()
            .await
            .contacts
            .iter()
            .find(|contact| {
                contact.external_source.as_deref() == Some(external_source)
                    && contact.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn find_contact_by_email(&self, email: &str) -> StoreResult<Option<Contact>> {
        let needle = email.to_lowercase();
        Ok(self
            .state
            .read()
            .await
            .contacts
            .iter()
            .find(|contact| {
                contact
                    .email
                    .as_deref()
                    .is_some_and(|candidate| candidate.to_lowercase() == needle)
            })
            .cloned())
    }

    async fn find_contact_by_id(&self, contact_id: Uuid) -> StoreResult<Option<Contact>> {
        Ok(self
            .state
            .read()
            .await
            .contacts
            .iter()
            .find(|contact| contact.id == contact_id)
            .cloned())
    }

    async fn match_contact_by_phone(&self, raw_phone: &str) -> StoreResult<Option<Uuid>> {
        let state = self.state.read().await;
        if state.phone_rpc_fails {
            return Err(StoreError::Backend("phone match rpc unavailable".into()));
        }
        Ok(normalize_phone(raw_phone).and_then(|normalized| state.phone_index.get(&normalized).copied()))
    }

    async fn insert_contact(&self, contact: Contact) -> StoreResult<Contact> {
        self.state.write().await.contacts.push(contact.clone());
        Ok(contact)
    }

    async fn update_contact(&self, contact_id: Uuid, patch: ContactPatch) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let contact = state
            .contacts
            .iter_mut()
            .find(|contact| contact.id == contact_id)
            .ok_or_else(|| StoreError::Backend(format!("contact {contact_id} not found")))?;
        if let Some(email) = patch.email {
            contact.email = Some(email);
        }
        if let Some(phone) = patch.phone {
            contact.phone = Some(phone);
        }
        if let Some(nome) = patch.nome {
            contact.nome = Some(nome);
        }
        if let Some(sobrenome) = patch.sobrenome {
            contact.sobrenome = Some(sobrenome);
        }
        if let Some(external_id) = patch.external_id {
            contact.external_id = Some(external_id);
        }
        if let Some(external_source) = patch.external_source {
            contact.external_source = Some(external_source);
        }
        for (key, value) in patch.marketing_data {
            merge_bucket_entry(&mut contact.marketing_data, key, value);
        }
        Ok(())
    }

    async fn upsert_phone_index(
        &self,
        contact_id: Uuid,
        normalized_phone: &str,
    ) -> StoreResult<()> {
        self.state
            .write()
            .await
            .phone_index
            .entry(normalized_phone.to_string())
            .or_insert(contact_id);
        Ok(())
    }

    async fn find_card_by_external(
        &self,
        external_source: &str,
        external_id: &str,
    ) -> StoreResult<Option<Card>> {
        Ok(self
            .state
            .read()
            .await
            .cards
            .iter()
            .find(|card| {
                card.external_source.as_deref() == Some(external_source)
                    && card.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn insert_card(&self, card: Card, origin: WriteOrigin) -> StoreResult<Card> {
        let mut state = self.state.write().await;
        if state.card_write_failures > 0 {
            state.card_write_failures -= 1;
            return Err(StoreError::Backend("injected card write failure".into()));
        }
        state.write_origins.push(origin);
        state.cards.push(card.clone());
        Ok(card)
    }

    async fn update_card(
        &self,
        card_id: Uuid,
        patch: CardPatch,
        origin: WriteOrigin,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.card_write_failures > 0 {
            state.card_write_failures -= 1;
            return Err(StoreError::Backend("injected card write failure".into()));
        }
        state.write_origins.push(origin);
        let mut extra = state.extra_columns.remove(&card_id).unwrap_or_default();
        let card = state
            .cards
            .iter_mut()
            .find(|card| card.id == card_id)
            .ok_or_else(|| StoreError::Backend(format!("card {card_id} not found")))?;
        apply_card_patch(card, &mut extra, patch);
        state.extra_columns.insert(card_id, extra);
        Ok(())
    }

    async fn validate_card_for_stage(
        &self,
        _card_payload: &Value,
        target_stage_id: Uuid,
        _source: &str,
        _level: ValidationLevel,
    ) -> StoreResult<ValidationOutcome> {
        let state = self.state.read().await;
        if state.validation_rpc_fails {
            return Err(StoreError::Backend("validation rpc unavailable".into()));
        }
        Ok(state
            .validation_by_stage
            .get(&target_stage_id)
            .cloned()
            .unwrap_or_else(ValidationOutcome::pass))
    }

    async fn insert_conflict_log(&self, entry: ConflictLogEntry) -> StoreResult<()> {
        self.state.write().await.conflict_logs.push(entry);
        Ok(())
    }

    async fn resolve_session_role(&self, token: &str) -> StoreResult<Option<String>> {
        Ok(self.state.read().await.session_roles.get(token).cloned())
    }

    fn loop_safety_available(&self) -> bool {
        true
    }
}
