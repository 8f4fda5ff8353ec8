//! Managed-database store speaking the PostgREST surface (Supabase-style):
//! table reads/writes under `/rest/v1/<table>`, stored procedures under
//! `/rest/v1/rpc/<fn>`, session introspection under `/auth/v1/user`.
//!
//! Loop prevention: when `sync_origin_header` is configured, card writes
//! carry it so the outbound-sync trigger can skip integration-origin rows.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use funil_core::mapping::{FieldMapping, StageMapping, UserMapping};
use funil_core::topology::{Pipeline, PipelinePhase, PipelineStage};
use funil_core::trigger::InboundTrigger;
use funil_core::{
    Card, CardPatch, ConflictLogEntry, Contact, ContactPatch, IntegrationEvent, ValidationLevel,
    ValidationOutcome,
};

use crate::{
    EventOutcome, IntegrationStore, StoreError, StoreResult, WriteOrigin, merge_bucket_entry,
};

const TABLE_EVENTS: &str = "integration_events";
const TABLE_STAGE_MAPPINGS: &str = "integration_stage_mappings";
const TABLE_USER_MAPPINGS: &str = "integration_user_mappings";
const TABLE_FIELD_MAPPINGS: &str = "integration_field_mappings";
const TABLE_SETTINGS: &str = "integration_settings";
const TABLE_TRIGGERS: &str = "integration_inbound_triggers";
const TABLE_PIPELINES: &str = "pipelines";
const TABLE_STAGES: &str = "pipeline_stages";
const TABLE_PHASES: &str = "pipeline_phases";
const TABLE_CONTACTS: &str = "contatos";
const TABLE_PHONE_INDEX: &str = "contato_phone_index";
const TABLE_CARDS: &str = "cards";
const TABLE_CONFLICT_LOG: &str = "integration_conflict_log";
const TABLE_PROFILES: &str = "profiles";

const RPC_VALIDATE_CARD: &str = "validate_card_for_stage";
const RPC_MATCH_PHONE: &str = "match_contact_by_phone";

/// Value the outbound-sync trigger checks for on the origin header.
pub const SYNC_ORIGIN_VALUE: &str = "integration-processor";

impl From<reqwest::Error> for StoreError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(error.to_string())
    }
}

#[derive(Clone)]
pub struct PostgrestStore {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
    sync_origin_header: Option<String>,
}

impl PostgrestStore {
    pub fn new(base_url: &str, service_key: &str, sync_origin_header: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            sync_origin_header: sync_origin_header.filter(|name| !name.trim().is_empty()),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{function}", self.base_url)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn read_body(response: reqwest::Response) -> StoreResult<String> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(StoreError::Http(format!("status {status}: {body}")))
        }
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> StoreResult<Vec<T>> {
        let response = self
            .authed(self.http.get(self.table_url(table)))
            .query(query)
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        serde_json::from_str(&body)
            .map_err(|error| StoreError::Decode(format!("{table}: {error}")))
    }

    async fn insert_returning<T: DeserializeOwned>(
        &self,
        table: &str,
        body: &Value,
        origin: Option<WriteOrigin>,
    ) -> StoreResult<T> {
        let mut request = self
            .authed(self.http.post(self.table_url(table)))
            .header("Prefer", "return=representation")
            .json(body);
        request = self.stamp_origin(request, origin);
        let response = request.send().await?;
        let body = Self::read_body(response).await?;
        let mut rows: Vec<T> = serde_json::from_str(&body)
            .map_err(|error| StoreError::Decode(format!("{table}: {error}")))?;
        rows.pop()
            .ok_or_else(|| StoreError::Decode(format!("{table}: insert returned no rows")))
    }

    async fn patch_by_id(
        &self,
        table: &str,
        id: Uuid,
        body: &Value,
        origin: Option<WriteOrigin>,
    ) -> StoreResult<()> {
        let mut request = self
            .authed(self.http.patch(self.table_url(table)))
            .query(&[("id", format!("eq.{id}"))])
            .json(body);
        request = self.stamp_origin(request, origin);
        let response = request.send().await?;
        Self::read_body(response).await.map(|_| ())
    }

    fn stamp_origin(
        &self,
        request: reqwest::RequestBuilder,
        origin: Option<WriteOrigin>,
    ) -> reqwest::RequestBuilder {
        match (origin, self.sync_origin_header.as_deref()) {
            (Some(WriteOrigin::Integration), Some(header)) => {
                request.header(header, SYNC_ORIGIN_VALUE)
            }
            _ => request,
        }
    }

    async fn rpc(&self, function: &str, body: &Value) -> StoreResult<Value> {
        let response = self
            .authed(self.http.post(self.rpc_url(function)))
            .json(body)
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|error| StoreError::Decode(format!("rpc {function}: {error}")))
    }

    async fn fetch_card(&self, card_id: Uuid) -> StoreResult<Card> {
        let mut rows: Vec<Card> = self
            .select(TABLE_CARDS, &[("id", format!("eq.{card_id}")), ("limit", "1".into())])
            .await?;
        rows.pop()
            .ok_or_else(|| StoreError::Backend(format!("card {card_id} not found")))
    }

    async fn fetch_contact(&self, contact_id: Uuid) -> StoreResult<Contact> {
        self.find_contact_by_id(contact_id)
            .await?
            .ok_or_else(|| StoreError::Backend(format!("contact {contact_id} not found")))
    }
}

#[derive(Debug, Deserialize)]
struct SettingRow {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ProfileRole {
    role: String,
}

/// Serialize a card patch into a PATCH body. Bucket maps must already be
/// merged with the stored buckets: PostgREST replaces jsonb columns whole.
fn card_patch_body(existing: &Card, patch: CardPatch) -> Value {
    let mut body = Map::new();
    if let Some(titulo) = patch.titulo {
        body.insert("titulo".into(), json!(titulo));
    }
    if let Some(valor) = patch.valor_estimado {
        body.insert("valor_estimado".into(), json!(valor));
    }
    if let Some(status) = patch.status_comercial {
        body.insert("status_comercial".into(), json!(status));
    }
    if let Some(stage) = patch.pipeline_stage_id {
        body.insert("pipeline_stage_id".into(), json!(stage));
    }
    if let Some(pipeline) = patch.pipeline_id {
        body.insert("pipeline_id".into(), json!(pipeline));
    }
    if let Some(produto) = patch.produto {
        body.insert("produto".into(), json!(produto));
    }
    if let Some(owner) = patch.dono_atual_id {
        body.insert("dono_atual_id".into(), json!(owner));
    }
    if let Some(sdr) = patch.sdr_id {
        body.insert("sdr_id".into(), json!(sdr));
    }
    if let Some(planner) = patch.planner_id {
        body.insert("planner_id".into(), json!(planner));
    }
    if let Some(posvenda) = patch.posvenda_id {
        body.insert("posvenda_id".into(), json!(posvenda));
    }
    if let Some(contato) = patch.contato_id {
        body.insert("contato_id".into(), json!(contato));
    }
    if let Some(origem) = patch.origem {
        body.insert("origem".into(), json!(origem));
    }
    for (column, value) in patch.columns {
        body.insert(column, value);
    }
    for (bucket_name, incoming, stored) in [
        ("marketing_data", patch.marketing_data, &existing.marketing_data),
        ("produto_data", patch.produto_data, &existing.produto_data),
        ("briefing_inicial", patch.briefing_inicial, &existing.briefing_inicial),
    ] {
        if incoming.is_empty() {
            continue;
        }
        let mut merged = stored.clone();
        for (key, value) in incoming {
            merge_bucket_entry(&mut merged, key, value);
        }
        body.insert(bucket_name.into(), Value::Object(merged));
    }
    Value::Object(body)
}

#[async_trait]
impl IntegrationStore for PostgrestStore {
    async fn load_settings(&self) -> StoreResult<HashMap<String, String>> {
        let rows: Vec<SettingRow> = self
            .select(TABLE_SETTINGS, &[("select", "key,value".into())])
            .await?;
        Ok(rows.into_iter().map(|row| (row.key, row.value)).collect())
    }

    async fn load_stage_mappings(&self) -> StoreResult<Vec<StageMapping>> {
        self.select(TABLE_STAGE_MAPPINGS, &[("select", "*".into())]).await
    }

    async fn load_user_mappings(&self) -> StoreResult<Vec<UserMapping>> {
        self.select(TABLE_USER_MAPPINGS, &[("select", "*".into())]).await
    }

    async fn load_field_mappings(&self) -> StoreResult<Vec<FieldMapping>> {
        self.select(TABLE_FIELD_MAPPINGS, &[("select", "*".into())]).await
    }

    async fn load_pipelines(&self) -> StoreResult<Vec<Pipeline>> {
        self.select(TABLE_PIPELINES, &[("select", "*".into())]).await
    }

    async fn load_stages(&self) -> StoreResult<Vec<PipelineStage>> {
        self.select(TABLE_STAGES, &[("select", "*".into())]).await
    }

    async fn load_phases(&self) -> StoreResult<Vec<PipelinePhase>> {
        self.select(TABLE_PHASES, &[("select", "*".into())]).await
    }

    async fn load_triggers(&self) -> StoreResult<Vec<InboundTrigger>> {
        self.select(TABLE_TRIGGERS, &[("is_active", "eq.true".into())]).await
    }

    async fn fetch_pending_events(
        &self,
        limit: usize,
        integration_id: Option<Uuid>,
    ) -> StoreResult<Vec<IntegrationEvent>> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut query = vec![
            ("status", "eq.pending".to_string()),
            ("or", format!("(next_retry_at.is.null,next_retry_at.lte.{now})")),
            ("order", "created_at.asc".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(id) = integration_id {
            query.push(("integration_id", format!("eq.{id}")));
        }
        self.select(TABLE_EVENTS, &query).await
    }

    async fn fetch_events_by_ids(
        &self,
        event_ids: &[Uuid],
        integration_id: Option<Uuid>,
    ) -> StoreResult<Vec<IntegrationEvent>> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = event_ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut query = vec![("id", format!("in.({ids})"))];
        if let Some(id) = integration_id {
            query.push(("integration_id", format!("eq.{id}")));
        }
        self.select(TABLE_EVENTS, &query).await
    }

    async fn record_event_outcome(
        &self,
        event_id: Uuid,
        outcome: EventOutcome,
    ) -> StoreResult<()> {
        let body = json!({
            "status": outcome.status,
            "processing_log": outcome.processing_log,
            "attempts": outcome.attempts,
            "next_retry_at": outcome.next_retry_at,
            "matched_trigger_id": outcome.matched_trigger_id,
            "processed_at": outcome.processed_at,
        });
        self.patch_by_id(TABLE_EVENTS, event_id, &body, None).await
    }

    async fn find_contact_by_external(
        &self,
        external_source: &str,
        external_id: &str,
    ) -> StoreResult<Option<Contact>> {
        let mut rows: Vec<Contact> = self
            .select(
                TABLE_CONTACTS,
                &[
                    ("external_source", format!("eq.{external_source}")),
                    ("external_id", format!("eq.{external_id}")),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.pop())
    }

    async fn find_contact_by_email(&self, email: &str) -> StoreResult<Option<Contact>> {
        let mut rows: Vec<Contact> = self
            .select(
                TABLE_CONTACTS,
                &[("email", format!("ilike.{email}")), ("limit", "1".into())],
            )
            .await?;
        Ok(rows.pop())
    }

    async fn find_contact_by_id(&self, contact_id: Uuid) -> StoreResult<Option<Contact>> {
        let mut rows: Vec<Contact> = self
            .select(
                TABLE_CONTACTS,
                &[("id", format!("eq.{contact_id}")), ("limit", "1".into())],
            )
            .await?;
        Ok(rows.pop())
    }

    async fn match_contact_by_phone(&self, raw_phone: &str) -> StoreResult<Option<Uuid>> {
        let result = self
            .rpc(RPC_MATCH_PHONE, &json!({ "phone_raw": raw_phone, "conversation_id": Value::Null }))
            .await?;
        match result {
            Value::Null => Ok(None),
            Value::String(id) => Uuid::parse_str(&id)
                .map(Some)
                .map_err(|error| StoreError::Decode(format!("rpc {RPC_MATCH_PHONE}: {error}"))),
            other => Err(StoreError::Decode(format!(
                "rpc {RPC_MATCH_PHONE}: unexpected result {other}"
            ))),
        }
    }

    async fn insert_contact(&self, contact: Contact) -> StoreResult<Contact> {
        let body = serde_json::to_value(&contact)
            .map_err(|error| StoreError::Decode(error.to_string()))?;
        self.insert_returning(TABLE_CONTACTS, &body, None).await
    }

    async fn update_contact(&self, contact_id: Uuid, patch: ContactPatch) -> StoreResult<()> {
        let existing = self.fetch_contact(contact_id).await?;
        let mut body = Map::new();
        if let Some(email) = patch.email {
            body.insert("email".into(), json!(email));
        }
        if let Some(phone) = patch.phone {
            body.insert("phone".into(), json!(phone));
        }
        if let Some(nome) = patch.nome {
            body.insert("nome".into(), json!(nome));
        }
        if let Some(sobrenome) = patch.sobrenome {
            body.insert("sobrenome".into(), json!(sobrenome));
        }
        if let Some(external_id) = patch.external_id {
            body.insert("external_id".into(), json!(external_id));
        }
        if let Some(external_source) = patch.external_source {
            body.insert("external_source".into(), json!(external_source));
        }
        for (column, value) in patch.columns {
            body.insert(column, value);
        }
        if !patch.marketing_data.is_empty() {
            let mut merged = existing.marketing_data.clone();
            for (key, value) in patch.marketing_data {
                merge_bucket_entry(&mut merged, key, value);
            }
            body.insert("marketing_data".into(), Value::Object(merged));
        }
        if body.is_empty() {
            return Ok(());
        }
        self.patch_by_id(TABLE_CONTACTS, contact_id, &Value::Object(body), None)
            .await
    }

    async fn upsert_phone_index(
        &self,
        contact_id: Uuid,
        normalized_phone: &str,
    ) -> StoreResult<()> {
        let response = self
            .authed(self.http.post(self.table_url(TABLE_PHONE_INDEX)))
            .query(&[("on_conflict", "phone_normalized")])
            .header("Prefer", "resolution=ignore-duplicates")
            .json(&json!({
                "contact_id": contact_id,
                "phone_normalized": normalized_phone,
            }))
            .send()
            .await?;
        Self::read_body(response).await.map(|_| ())
    }

    async fn find_card_by_external(
        &self,
        external_source: &str,
        external_id: &str,
    ) -> StoreResult<Option<Card>> {
        let mut rows: Vec<Card> = self
            .select(
                TABLE_CARDS,
                &[
                    ("external_source", format!("eq.{external_source}")),
                    ("external_id", format!("eq.{external_id}")),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.pop())
    }

    async fn insert_card(&self, card: Card, origin: WriteOrigin) -> StoreResult<Card> {
        let body =
            serde_json::to_value(&card).map_err(|error| StoreError::Decode(error.to_string()))?;
        self.insert_returning(TABLE_CARDS, &body, Some(origin)).await
    }

    async fn update_card(
        &self,
        card_id: Uuid,
        patch: CardPatch,
        origin: WriteOrigin,
    ) -> StoreResult<()> {
        let existing = self.fetch_card(card_id).await?;
        let body = card_patch_body(&existing, patch);
        if body.as_object().is_some_and(Map::is_empty) {
            return Ok(());
        }
        self.patch_by_id(TABLE_CARDS, card_id, &body, Some(origin)).await
    }

    async fn validate_card_for_stage(
        &self,
        card_payload: &Value,
        target_stage_id: Uuid,
        source: &str,
        level: ValidationLevel,
    ) -> StoreResult<ValidationOutcome> {
        let result = self
            .rpc(
                RPC_VALIDATE_CARD,
                &json!({
                    "card_data": card_payload,
                    "target_stage_id": target_stage_id,
                    "source": source,
                    "validation_level": level.as_str(),
                }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|error| StoreError::Decode(format!("rpc {RPC_VALIDATE_CARD}: {error}")))
    }

    async fn insert_conflict_log(&self, entry: ConflictLogEntry) -> StoreResult<()> {
        let body =
            serde_json::to_value(&entry).map_err(|error| StoreError::Decode(error.to_string()))?;
        let response = self
            .authed(self.http.post(self.table_url(TABLE_CONFLICT_LOG)))
            .json(&body)
            .send()
            .await?;
        Self::read_body(response).await.map(|_| ())
    }

    async fn resolve_session_role(&self, token: &str) -> StoreResult<Option<String>> {
        let response = self
            .http
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.service_key)
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let user: AuthUser = response
            .json()
            .await
            .map_err(|error| StoreError::Decode(format!("auth user: {error}")))?;
        let mut rows: Vec<ProfileRole> = self
            .select(
                TABLE_PROFILES,
                &[
                    ("id", format!("eq.{}", user.id)),
                    ("select", "role".into()),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.pop().map(|row| row.role))
    }

    fn loop_safety_available(&self) -> bool {
        self.sync_origin_header.is_some()
    }
}
