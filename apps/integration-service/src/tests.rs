use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::{Map, Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use funil_core::event::{EntityType, EventStatus, EventType};
use funil_core::mapping::{
    FieldMapping, MappingDirection, MappingEntity, StageMapping, StorageLocation, UserMapping,
};
use funil_core::topology::{Fase, Pipeline, PipelineStage};
use funil_core::trigger::{ActionType, InboundTrigger, QuarantineMode, ValidationLevel};
use funil_core::{Card, Contact, IntegrationEvent, StatusComercial, ValidationOutcome};
use funil_store::memory::MemoryStore;
use funil_store::{IntegrationStore, WriteOrigin};

use crate::build_router;
use crate::config::Config;

fn uuid(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

const INTEGRATION: u128 = 1;
const PIPELINE: u128 = 10;
const STAGE_ENTRY: u128 = 100;
const STAGE_MID: u128 = 101;
const STAGE_WON: u128 = 102;
const STAGE_LOST: u128 = 103;
const STAGE_QUARANTINE: u128 = 104;

fn stage(id: u128, ordem: i32, won: bool, lost: bool, fase: Option<Fase>) -> PipelineStage {
    PipelineStage {
        id: uuid(id),
        pipeline_id: uuid(PIPELINE),
        nome: format!("stage-{id}"),
        fase,
        is_won: won,
        is_lost: lost,
        ordem,
        phase_id: None,
    }
}

/// One pipeline, two working stages, won/lost terminals, a quarantine stage,
/// and stage mappings for external stages "30" and "31".
async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .seed_topology(
            vec![Pipeline {
                id: uuid(PIPELINE),
                nome: "Comercial".to_string(),
                produto: Some("consultoria".to_string()),
            }],
            vec![
                stage(STAGE_ENTRY, 1, false, false, Some(Fase::Sdr)),
                stage(STAGE_MID, 2, false, false, Some(Fase::Planner)),
                stage(STAGE_QUARANTINE, 3, false, false, None),
                stage(STAGE_WON, 9, true, false, None),
                stage(STAGE_LOST, 10, false, true, None),
            ],
            vec![],
        )
        .await;
    for (external_stage, stage_id) in [("30", STAGE_ENTRY), ("31", STAGE_MID)] {
        store
            .seed_stage_mapping(StageMapping {
                id: Uuid::new_v4(),
                integration_id: uuid(INTEGRATION),
                external_pipeline_id: "5".to_string(),
                external_stage_id: external_stage.to_string(),
                stage_id: uuid(stage_id),
            })
            .await;
    }
    store
}

fn app(store: &MemoryStore) -> Router {
    let store: Arc<dyn IntegrationStore> = Arc::new(store.clone());
    build_router(Config::for_tests(), store)
}

fn event(id: u128, entity: EntityType, event_type: EventType, payload: Value) -> IntegrationEvent {
    IntegrationEvent {
        id: uuid(id),
        integration_id: uuid(INTEGRATION),
        entity_type: entity,
        event_type,
        payload: payload.as_object().cloned().unwrap_or_else(Map::new),
        status: EventStatus::Pending,
        attempts: 0,
        next_retry_at: None,
        matched_trigger_id: None,
        processing_log: String::new(),
        processed_at: None,
        created_at: Utc::now(),
    }
}

fn card_at(id: u128, external_id: &str, stage: u128, status: StatusComercial) -> Card {
    Card {
        id: uuid(id),
        external_id: Some(external_id.to_string()),
        external_source: Some("active_campaign".to_string()),
        titulo: "Proposta existente".to_string(),
        valor_estimado: Some(900.0),
        status_comercial: status,
        pipeline_stage_id: Some(uuid(stage)),
        pipeline_id: Some(uuid(PIPELINE)),
        produto: Some("consultoria".to_string()),
        dono_atual_id: None,
        sdr_id: None,
        planner_id: None,
        posvenda_id: None,
        contato_id: None,
        origem: Some("outbound".to_string()),
        marketing_data: Map::new(),
        produto_data: Map::new(),
        briefing_inicial: Map::new(),
        locked_fields: Map::new(),
        created_at: Utc::now(),
    }
}

fn trigger_base() -> InboundTrigger {
    InboundTrigger {
        id: uuid(200),
        integration_id: uuid(INTEGRATION),
        external_pipeline_ids: vec![],
        external_stage_ids: vec![],
        external_owner_ids: vec![],
        entity_types: vec![EntityType::Deal],
        action_type: ActionType::All,
        target_stage_id: None,
        target_pipeline_id: None,
        validation_level: ValidationLevel::Basic,
        bypass_validation: false,
        quarantine_mode: QuarantineMode::Reject,
        quarantine_stage_id: None,
        is_active: true,
    }
}

async fn read_json(response: axum::response::Response) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

async fn invoke_with_headers(
    app: Router,
    body: Value,
    headers: &[(&str, &str)],
) -> Result<(StatusCode, Value)> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/integration/process")
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = app.oneshot(builder.body(Body::from(body.to_string()))?).await?;
    let status = response.status();
    let value = read_json(response).await?;
    Ok((status, value))
}

/// Invoke the process route with the internal cron secret.
async fn invoke(app: Router) -> Result<(StatusCode, Value)> {
    invoke_with_headers(app, json!({}), &[("x-internal-secret", "test-internal-secret")]).await
}

async fn invoke_body(app: Router, body: Value) -> Result<(StatusCode, Value)> {
    invoke_with_headers(app, body, &[("x-internal-secret", "test-internal-secret")]).await
}

fn service_role_jwt() -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(br#"{"role":"service_role"}"#);
    format!("{header}.{payload}.signature")
}

#[tokio::test]
async fn healthz_route_returns_ok() -> Result<()> {
    let store = MemoryStore::new();
    let request = Request::builder().uri("/healthz").body(Body::empty())?;
    let response = app(&store).oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "funil-integration-service");
    Ok(())
}

#[tokio::test]
async fn cors_preflight_allows_any_origin() -> Result<()> {
    let store = MemoryStore::new();
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/integration/process")
        .header("origin", "https://app.funil.example")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "authorization")
        .body(Body::empty())?;
    let response = app(&store).oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|value| value.to_str().ok()),
        Some("*")
    );
    Ok(())
}

#[tokio::test]
async fn process_requires_admin_credentials() -> Result<()> {
    let store = MemoryStore::new();
    let (status, body) = invoke_with_headers(app(&store), json!({}), &[]).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized: Admin access required");

    let (status, _) = invoke_with_headers(
        app(&store),
        json!({}),
        &[("authorization", "Bearer wrong-token")],
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn internal_secret_header_is_accepted() -> Result<()> {
    let store = MemoryStore::new();
    let (status, body) = invoke(app(&store)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "No events to process");
    assert_eq!(body["stats"]["scanned"], 0);
    Ok(())
}

#[tokio::test]
async fn service_role_jwt_is_accepted() -> Result<()> {
    let store = MemoryStore::new();
    let token = format!("Bearer {}", service_role_jwt());
    let (status, _) =
        invoke_with_headers(app(&store), json!({}), &[("authorization", &token)]).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn raw_service_key_bearer_is_accepted() -> Result<()> {
    let store = MemoryStore::new();
    let (status, _) = invoke_with_headers(
        app(&store),
        json!({}),
        &[("authorization", "Bearer test-service-key")],
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn admin_session_is_accepted_and_viewer_is_not() -> Result<()> {
    let store = MemoryStore::new();
    store.seed_session_role("admin-token", "admin").await;
    store.seed_session_role("viewer-token", "viewer").await;

    let (status, _) = invoke_with_headers(
        app(&store),
        json!({}),
        &[("authorization", "Bearer admin-token")],
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = invoke_with_headers(
        app(&store),
        json!({}),
        &[("authorization", "Bearer viewer-token")],
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn deal_add_creates_card_and_contact() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_event(event(
            500,
            EntityType::Deal,
            EventType::DealAdd,
            json!({
                "deal[id]": "900",
                "deal[title]": "Proposta ACME",
                "deal[value]": "150000",
                "deal[pipelineid]": "5",
                "deal[stageid]": "30",
                "contact[id]": "70",
                "contact[email]": "maria@acme.com",
                "contact[first_name]": "Maria",
                "contact[last_name]": "da Silva",
                "contact[phone]": "+55 41 99876-5432",
            }),
        ))
        .await;

    let (status, body) = invoke(app(&store)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stats"]["scanned"], 1);
    assert_eq!(body["stats"]["eligible"], 1);
    assert_eq!(body["stats"]["updated"], 1);
    assert_eq!(body["stats"]["mode"], "WRITE");

    let cards = store.cards().await;
    assert_eq!(cards.len(), 1);
    let card = &cards[0];
    assert_eq!(card.titulo, "Proposta ACME");
    assert_eq!(card.valor_estimado, Some(1500.0));
    assert_eq!(card.pipeline_stage_id, Some(uuid(STAGE_ENTRY)));
    assert_eq!(card.pipeline_id, Some(uuid(PIPELINE)));
    assert_eq!(card.status_comercial, StatusComercial::Aberto);
    assert_eq!(card.external_id.as_deref(), Some("900"));
    assert_eq!(card.produto.as_deref(), Some("consultoria"));
    assert_eq!(card.origem.as_deref(), Some("active_campaign"));

    let contacts = store.contacts().await;
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].nome.as_deref(), Some("Maria"));
    assert_eq!(contacts[0].sobrenome.as_deref(), Some("da Silva"));
    assert_eq!(card.contato_id, Some(contacts[0].id));
    assert!(store.phone_index().await.contains_key("41998765432"));

    // Writes were stamped as integration-origin for loop prevention.
    assert!(store
        .write_origins()
        .await
        .iter()
        .all(|origin| *origin == WriteOrigin::Integration));

    let stored = store.event(uuid(500)).await.expect("event");
    assert_eq!(stored.status, EventStatus::Processed);
    assert!(stored.processed_at.is_some());
    Ok(())
}

#[tokio::test]
async fn owner_mapping_routes_role_specific_field() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_user_mapping(UserMapping {
            id: Uuid::new_v4(),
            integration_id: uuid(INTEGRATION),
            external_user_id: "2".to_string(),
            user_id: uuid(50),
        })
        .await;
    store
        .seed_event(event(
            501,
            EntityType::Deal,
            EventType::DealAdd,
            json!({
                "deal[id]": "901",
                "deal[pipelineid]": "5",
                "deal[stageid]": "30",
                "deal[owner]": "2",
            }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    assert_eq!(cards[0].dono_atual_id, Some(uuid(50)));
    // Entry stage belongs to the SDR fase.
    assert_eq!(cards[0].sdr_id, Some(uuid(50)));
    assert_eq!(cards[0].planner_id, None);
    Ok(())
}

#[tokio::test]
async fn backward_stage_move_is_suppressed_but_fields_apply() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_card(card_at(300, "902", STAGE_MID, StatusComercial::Aberto))
        .await;
    store
        .seed_event(event(
            502,
            EntityType::Deal,
            EventType::DealUpdate,
            json!({
                "deal[id]": "902",
                "deal[title]": "Título novo",
                "deal[pipelineid]": "5",
                "deal[stageid]": "30",
            }),
        ))
        .await;

    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["updated"], 1);

    let cards = store.cards().await;
    assert_eq!(cards[0].pipeline_stage_id, Some(uuid(STAGE_MID)));
    assert_eq!(cards[0].titulo, "Título novo");

    let stored = store.event(uuid(502)).await.expect("event");
    assert_eq!(stored.status, EventStatus::Processed);
    assert!(stored.processing_log.contains("[DONT_REGRESS]"));
    Ok(())
}

#[tokio::test]
async fn terminal_stage_never_moves() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_card(card_at(301, "903", STAGE_WON, StatusComercial::Ganho))
        .await;
    store
        .seed_event(event(
            503,
            EntityType::Deal,
            EventType::DealState,
            json!({
                "deal[id]": "903",
                "deal[pipelineid]": "5",
                "deal[stageid]": "31",
            }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    assert_eq!(cards[0].pipeline_stage_id, Some(uuid(STAGE_WON)));
    assert_eq!(cards[0].status_comercial, StatusComercial::Ganho);
    Ok(())
}

#[tokio::test]
async fn lost_deal_is_forced_to_lost_stage() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_card(card_at(302, "904", STAGE_MID, StatusComercial::Aberto))
        .await;
    store
        .seed_event(event(
            504,
            EntityType::Deal,
            EventType::DealState,
            json!({
                "deal[id]": "904",
                "deal[status]": "2",
                "deal[pipelineid]": "5",
                "deal[stageid]": "30",
            }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    assert_eq!(cards[0].pipeline_stage_id, Some(uuid(STAGE_LOST)));
    assert_eq!(cards[0].status_comercial, StatusComercial::Perdido);

    let stored = store.event(uuid(504)).await.expect("event");
    assert!(stored.processing_log.contains("[LOST_FORCE]"));
    Ok(())
}

#[tokio::test]
async fn locked_titulo_is_never_overwritten() -> Result<()> {
    let store = seeded_store().await;
    let mut card = card_at(303, "905", STAGE_ENTRY, StatusComercial::Aberto);
    card.locked_fields.insert("titulo".to_string(), json!(true));
    store.seed_card(card).await;
    store
        .seed_event(event(
            505,
            EntityType::Deal,
            EventType::DealUpdate,
            json!({
                "deal[id]": "905",
                "deal[title]": "Tentativa de sobrescrita",
                "deal[value]": "200000",
            }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    assert_eq!(cards[0].titulo, "Proposta existente");
    assert_eq!(cards[0].valor_estimado, Some(2000.0));
    Ok(())
}

#[tokio::test]
async fn protected_mapping_keeps_existing_value() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_field_mapping(FieldMapping {
            id: Uuid::new_v4(),
            integration_id: uuid(INTEGRATION),
            external_field_id: "100".to_string(),
            external_pipeline_id: None,
            field_key: "segmento".to_string(),
            entity_type: MappingEntity::Deal,
            direction: MappingDirection::Inbound,
            storage_location: StorageLocation::MarketingData,
            db_column_name: None,
            sync_always: false,
        })
        .await;
    let mut card = card_at(304, "906", STAGE_ENTRY, StatusComercial::Aberto);
    card.marketing_data
        .insert("segmento".to_string(), json!("industria"));
    store.seed_card(card).await;
    store
        .seed_event(event(
            506,
            EntityType::Deal,
            EventType::DealUpdate,
            json!({ "deal[id]": "906", "100": "varejo" }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    assert_eq!(cards[0].marketing_data["segmento"], json!("industria"));
    Ok(())
}

#[tokio::test]
async fn unmapped_fields_are_retained_under_marketing_data() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_event(event(
            507,
            EntityType::Deal,
            EventType::DealAdd,
            json!({
                "deal[id]": "907",
                "deal[pipelineid]": "5",
                "deal[stageid]": "30",
                "campo_misterioso": "valor",
            }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    assert_eq!(
        cards[0].marketing_data["unmapped"]["campo_misterioso"],
        json!("valor")
    );
    Ok(())
}

#[tokio::test]
async fn trigger_allowlist_blocks_unmatched_events() -> Result<()> {
    let store = seeded_store().await;
    let mut trigger = trigger_base();
    trigger.external_pipeline_ids = vec!["9".to_string()];
    store.seed_trigger(trigger).await;
    store
        .seed_event(event(
            508,
            EntityType::Deal,
            EventType::DealAdd,
            json!({ "deal[id]": "908", "deal[pipelineid]": "5", "deal[stageid]": "30" }),
        ))
        .await;

    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["ignored"], 1);
    assert_eq!(body["stats"]["ignored_by_trigger"], 1);
    assert!(store.cards().await.is_empty());

    let stored = store.event(uuid(508)).await.expect("event");
    assert_eq!(stored.status, EventStatus::Ignored);
    Ok(())
}

#[tokio::test]
async fn trigger_stage_override_wins_over_mapping() -> Result<()> {
    let store = seeded_store().await;
    let mut trigger = trigger_base();
    trigger.target_stage_id = Some(uuid(STAGE_MID));
    store.seed_trigger(trigger).await;
    store
        .seed_event(event(
            509,
            EntityType::Deal,
            EventType::DealAdd,
            json!({ "deal[id]": "909", "deal[pipelineid]": "5", "deal[stageid]": "30" }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    assert_eq!(cards[0].pipeline_stage_id, Some(uuid(STAGE_MID)));

    let stored = store.event(uuid(509)).await.expect("event");
    assert_eq!(stored.matched_trigger_id, Some(uuid(200)));
    Ok(())
}

#[tokio::test]
async fn quality_gate_reject_blocks_the_event() -> Result<()> {
    let store = seeded_store().await;
    store.seed_trigger(trigger_base()).await;
    store
        .set_validation_outcome(
            uuid(STAGE_ENTRY),
            ValidationOutcome {
                valid: false,
                can_bypass: false,
                missing_requirements: vec!["briefing_inicial.objetivo".to_string()],
            },
        )
        .await;
    store
        .seed_event(event(
            510,
            EntityType::Deal,
            EventType::DealAdd,
            json!({ "deal[id]": "910", "deal[pipelineid]": "5", "deal[stageid]": "30" }),
        ))
        .await;

    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["blocked"], 1);
    assert!(store.cards().await.is_empty());

    let conflicts = store.conflict_logs().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(
        conflicts[0].resolution,
        funil_core::ConflictResolution::Rejected
    );
    assert_eq!(conflicts[0].missing_requirements, vec!["briefing_inicial.objetivo"]);

    let stored = store.event(uuid(510)).await.expect("event");
    assert_eq!(stored.status, EventStatus::Blocked);
    Ok(())
}

#[tokio::test]
async fn quality_gate_quarantine_redirects_stage() -> Result<()> {
    let store = seeded_store().await;
    let mut trigger = trigger_base();
    trigger.quarantine_mode = QuarantineMode::Stage;
    trigger.quarantine_stage_id = Some(uuid(STAGE_QUARANTINE));
    store.seed_trigger(trigger).await;
    store
        .set_validation_outcome(
            uuid(STAGE_ENTRY),
            ValidationOutcome {
                valid: false,
                can_bypass: false,
                missing_requirements: vec!["valor_estimado".to_string()],
            },
        )
        .await;
    store
        .seed_event(event(
            511,
            EntityType::Deal,
            EventType::DealAdd,
            json!({ "deal[id]": "911", "deal[pipelineid]": "5", "deal[stageid]": "30" }),
        ))
        .await;

    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["updated"], 1);

    let cards = store.cards().await;
    assert_eq!(cards[0].pipeline_stage_id, Some(uuid(STAGE_QUARANTINE)));

    let conflicts = store.conflict_logs().await;
    assert_eq!(
        conflicts[0].resolution,
        funil_core::ConflictResolution::Quarantined
    );
    assert_eq!(conflicts[0].actual_stage_id, Some(uuid(STAGE_QUARANTINE)));

    let stored = store.event(uuid(511)).await.expect("event");
    assert_eq!(stored.status, EventStatus::Processed);
    Ok(())
}

#[tokio::test]
async fn quality_gate_rpc_failure_fails_open() -> Result<()> {
    let store = seeded_store().await;
    store.seed_trigger(trigger_base()).await;
    store.fail_validation_rpc(true).await;
    store
        .seed_event(event(
            525,
            EntityType::Deal,
            EventType::DealAdd,
            json!({ "deal[id]": "925", "deal[pipelineid]": "5", "deal[stageid]": "30" }),
        ))
        .await;

    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["updated"], 1);
    assert_eq!(store.cards().await.len(), 1);
    assert!(store.conflict_logs().await.is_empty());

    let stored = store.event(uuid(525)).await.expect("event");
    assert!(stored.processing_log.contains("fail-open"));
    Ok(())
}

#[tokio::test]
async fn manual_sync_bypasses_trigger_and_gate() -> Result<()> {
    let store = seeded_store().await;
    let mut trigger = trigger_base();
    trigger.external_pipeline_ids = vec!["9".to_string()];
    store.seed_trigger(trigger).await;
    store
        .set_validation_outcome(
            uuid(STAGE_ENTRY),
            ValidationOutcome {
                valid: false,
                can_bypass: false,
                missing_requirements: vec!["briefing_inicial".to_string()],
            },
        )
        .await;
    store
        .seed_event(event(
            512,
            EntityType::Deal,
            EventType::DealAdd,
            json!({
                "deal[id]": "912",
                "deal[pipelineid]": "5",
                "deal[stageid]": "30",
                "manual_sync": "true",
            }),
        ))
        .await;

    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["updated"], 1);
    assert_eq!(store.cards().await.len(), 1);
    assert!(store.conflict_logs().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn shadow_mode_simulates_without_writes() -> Result<()> {
    let store = seeded_store().await;
    store.seed_setting("SHADOW_MODE_ENABLED", "true").await;
    store
        .seed_event(event(
            513,
            EntityType::Deal,
            EventType::DealAdd,
            json!({
                "deal[id]": "913",
                "deal[pipelineid]": "5",
                "deal[stageid]": "30",
                "contact[email]": "sombra@acme.com",
            }),
        ))
        .await;

    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["mode"], "SHADOW");
    assert_eq!(body["stats"]["processed_shadow"], 1);
    assert_eq!(body["stats"]["updated"], 0);
    assert!(store.cards().await.is_empty());
    assert!(store.contacts().await.is_empty());

    let stored = store.event(uuid(513)).await.expect("event");
    assert_eq!(stored.status, EventStatus::ProcessedShadow);
    assert!(stored.processing_log.contains("[SHADOW]"));
    Ok(())
}

#[tokio::test]
async fn transient_failure_schedules_backoff_retry() -> Result<()> {
    let store = seeded_store().await;
    store.inject_card_write_failures(1).await;
    store
        .seed_event(event(
            514,
            EntityType::Deal,
            EventType::DealAdd,
            json!({ "deal[id]": "914", "deal[pipelineid]": "5", "deal[stageid]": "30" }),
        ))
        .await;

    let before = Utc::now();
    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["errors"], 1);

    let stored = store.event(uuid(514)).await.expect("event");
    assert_eq!(stored.status, EventStatus::Pending);
    assert_eq!(stored.attempts, 1);
    let next_retry = stored.next_retry_at.expect("retry scheduled");
    assert!(next_retry >= before + Duration::minutes(1));
    assert!(next_retry <= Utc::now() + Duration::minutes(3));

    // Targeted reprocessing ignores the retry window and succeeds now that
    // the store is healthy again.
    let (_, body) = invoke_body(app(&store), json!({ "event_ids": [uuid(514)] })).await?;
    assert_eq!(body["stats"]["updated"], 1);
    let stored = store.event(uuid(514)).await.expect("event");
    assert_eq!(stored.status, EventStatus::Processed);
    assert!(stored.processing_log.contains("[attempt 2]"));
    assert_eq!(store.cards().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn third_transient_failure_is_terminal() -> Result<()> {
    let store = seeded_store().await;
    store.inject_card_write_failures(1).await;
    let mut queued = event(
        515,
        EntityType::Deal,
        EventType::DealAdd,
        json!({ "deal[id]": "915", "deal[pipelineid]": "5", "deal[stageid]": "30" }),
    );
    queued.attempts = 2;
    store.seed_event(queued).await;

    invoke(app(&store)).await?;
    let stored = store.event(uuid(515)).await.expect("event");
    assert_eq!(stored.status, EventStatus::Failed);
    assert_eq!(stored.attempts, 3);
    assert_eq!(stored.next_retry_at, None);
    Ok(())
}

#[tokio::test]
async fn unmapped_stage_fails_permanently() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_event(event(
            516,
            EntityType::Deal,
            EventType::DealUpdate,
            json!({ "deal[id]": "916", "deal[pipelineid]": "5", "deal[stageid]": "99" }),
        ))
        .await;

    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["errors"], 1);

    let stored = store.event(uuid(516)).await.expect("event");
    assert_eq!(stored.status, EventStatus::Failed);
    assert_eq!(stored.next_retry_at, None);
    assert!(stored.processing_log.contains("unmapped stage"));
    Ok(())
}

#[tokio::test]
async fn default_new_lead_stage_catches_unmapped_creations() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_setting("DEFAULT_NEW_LEAD_STAGE_ID", &uuid(STAGE_ENTRY).to_string())
        .await;
    store
        .seed_event(event(
            517,
            EntityType::Deal,
            EventType::DealAdd,
            json!({ "deal[id]": "917", "deal[pipelineid]": "5", "deal[stageid]": "99" }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    assert_eq!(cards[0].pipeline_stage_id, Some(uuid(STAGE_ENTRY)));
    Ok(())
}

#[tokio::test]
async fn out_of_scope_event_types_are_ignored() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_event(event(
            518,
            EntityType::Contact,
            EventType::ContactAdd,
            json!({ "contact[id]": "70", "contact[email]": "fora@acme.com" }),
        ))
        .await;
    store
        .seed_event(event(
            519,
            EntityType::DealActivity,
            EventType::Other("deal_task_add".to_string()),
            json!({ "deal[id]": "918" }),
        ))
        .await;

    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["scanned"], 2);
    assert_eq!(body["stats"]["ignored"], 2);
    assert_eq!(body["stats"]["eligible"], 0);
    assert!(store.contacts().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn contact_events_sync_when_enabled() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_setting("ALLOWED_EVENT_TYPES", "deal_add,deal_update,contact_update")
        .await;
    store
        .seed_contact(Contact {
            id: uuid(400),
            external_id: Some("70".to_string()),
            external_source: Some("active_campaign".to_string()),
            email: Some("maria@acme.com".to_string()),
            phone: None,
            nome: Some("Maria".to_string()),
            sobrenome: None,
            tags: vec![],
            marketing_data: Map::new(),
            created_at: Utc::now(),
        })
        .await;
    store
        .seed_event(event(
            520,
            EntityType::Contact,
            EventType::ContactUpdate,
            json!({
                "contact[id]": "70",
                "contact[email]": "maria@acme.com",
                "contact[phone]": "+55 41 99876-5432",
                "contact[last_name]": "da Silva",
            }),
        ))
        .await;

    let (_, body) = invoke(app(&store)).await?;
    assert_eq!(body["stats"]["updated"], 1);
    assert!(store.cards().await.is_empty());

    let contacts = store.contacts().await;
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].phone.as_deref(), Some("+55 41 99876-5432"));
    assert_eq!(contacts[0].sobrenome.as_deref(), Some("da Silva"));
    assert!(store.phone_index().await.contains_key("41998765432"));
    Ok(())
}

#[tokio::test]
async fn email_match_backfills_external_link() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_contact(Contact {
            id: uuid(401),
            external_id: None,
            external_source: None,
            email: Some("maria@acme.com".to_string()),
            phone: None,
            nome: Some("Maria".to_string()),
            sobrenome: None,
            tags: vec![],
            marketing_data: Map::new(),
            created_at: Utc::now(),
        })
        .await;
    store
        .seed_event(event(
            521,
            EntityType::Deal,
            EventType::DealAdd,
            json!({
                "deal[id]": "919",
                "deal[pipelineid]": "5",
                "deal[stageid]": "30",
                "contact[id]": "70",
                "contact[email]": "maria@acme.com",
            }),
        ))
        .await;

    invoke(app(&store)).await?;
    let contacts = store.contacts().await;
    assert_eq!(contacts.len(), 1, "no duplicate contact created");
    assert_eq!(contacts[0].external_id.as_deref(), Some("70"));
    assert_eq!(contacts[0].external_source.as_deref(), Some("active_campaign"));

    let cards = store.cards().await;
    assert_eq!(cards[0].contato_id, Some(uuid(401)));
    Ok(())
}

#[tokio::test]
async fn batch_is_scoped_to_requested_integration() -> Result<()> {
    let store = seeded_store().await;
    let mut foreign = event(
        522,
        EntityType::Deal,
        EventType::DealAdd,
        json!({ "deal[id]": "920", "deal[pipelineid]": "5", "deal[stageid]": "30" }),
    );
    foreign.integration_id = uuid(2);
    store.seed_event(foreign).await;

    let (_, body) = invoke_body(
        app(&store),
        json!({ "integration_id": uuid(INTEGRATION) }),
    )
    .await?;
    assert_eq!(body["message"], "No events to process");
    Ok(())
}

#[tokio::test]
async fn protected_mapping_on_standard_title_field_is_honored() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_field_mapping(FieldMapping {
            id: Uuid::new_v4(),
            integration_id: uuid(INTEGRATION),
            external_field_id: "deal[title]".to_string(),
            external_pipeline_id: None,
            field_key: "titulo".to_string(),
            entity_type: MappingEntity::Deal,
            direction: MappingDirection::Inbound,
            storage_location: StorageLocation::Column,
            db_column_name: Some("titulo".to_string()),
            sync_always: false,
        })
        .await;
    store
        .seed_card(card_at(305, "926", STAGE_ENTRY, StatusComercial::Aberto))
        .await;
    store
        .seed_event(event(
            526,
            EntityType::Deal,
            EventType::DealUpdate,
            json!({
                "deal[id]": "926",
                "deal[title]": "Tentativa de sobrescrita",
                "deal[value]": "300000",
            }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    assert_eq!(cards[0].titulo, "Proposta existente");
    // Value carries no protected mapping, so the update still lands.
    assert_eq!(cards[0].valor_estimado, Some(3000.0));

    let stored = store.event(uuid(526)).await.expect("event");
    assert!(stored.processing_log.contains("titulo protected"));
    Ok(())
}

#[tokio::test]
async fn protected_contact_mapping_keeps_existing_value() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_setting("ALLOWED_EVENT_TYPES", "deal_add,contact_update")
        .await;
    let mut marketing_data = Map::new();
    marketing_data.insert("segmento".to_string(), json!("industria"));
    store
        .seed_contact(Contact {
            id: uuid(402),
            external_id: Some("71".to_string()),
            external_source: Some("active_campaign".to_string()),
            email: Some("joao@acme.com".to_string()),
            phone: None,
            nome: Some("João".to_string()),
            sobrenome: None,
            tags: vec![],
            marketing_data,
            created_at: Utc::now(),
        })
        .await;
    for (external, field_key, sync_always) in
        [("100", "segmento", false), ("101", "interesse", true)]
    {
        store
            .seed_field_mapping(FieldMapping {
                id: Uuid::new_v4(),
                integration_id: uuid(INTEGRATION),
                external_field_id: external.to_string(),
                external_pipeline_id: None,
                field_key: field_key.to_string(),
                entity_type: MappingEntity::Contact,
                direction: MappingDirection::Inbound,
                storage_location: StorageLocation::MarketingData,
                db_column_name: None,
                sync_always,
            })
            .await;
    }
    store
        .seed_event(event(
            527,
            EntityType::Contact,
            EventType::ContactUpdate,
            json!({ "contact[id]": "71", "100": "varejo", "101": "consultoria" }),
        ))
        .await;

    invoke(app(&store)).await?;
    let contacts = store.contacts().await;
    assert_eq!(contacts[0].marketing_data["segmento"], json!("industria"));
    assert_eq!(contacts[0].marketing_data["interesse"], json!("consultoria"));
    Ok(())
}

#[tokio::test]
async fn failed_reprocess_of_settled_event_never_returns_to_pending() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_card(card_at(306, "927", STAGE_ENTRY, StatusComercial::Aberto))
        .await;
    let mut settled = event(
        528,
        EntityType::Deal,
        EventType::DealUpdate,
        json!({ "deal[id]": "927", "deal[title]": "Título atualizado" }),
    );
    settled.status = EventStatus::Processed;
    settled.processed_at = Some(Utc::now());
    store.seed_event(settled).await;
    store.inject_card_write_failures(1).await;

    let (_, body) = invoke_body(app(&store), json!({ "event_ids": [uuid(528)] })).await?;
    assert_eq!(body["stats"]["errors"], 1);

    let stored = store.event(uuid(528)).await.expect("event");
    assert_eq!(stored.status, EventStatus::Failed);
    assert_eq!(stored.next_retry_at, None);
    Ok(())
}

#[tokio::test]
async fn trigger_pipeline_override_reroutes_to_entry_stage() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_topology(
            vec![Pipeline {
                id: uuid(11),
                nome: "Expansão".to_string(),
                produto: Some("expansao".to_string()),
            }],
            vec![
                PipelineStage {
                    id: uuid(110),
                    pipeline_id: uuid(11),
                    nome: "Triagem".to_string(),
                    fase: Some(Fase::Sdr),
                    is_won: false,
                    is_lost: false,
                    ordem: 1,
                    phase_id: None,
                },
                PipelineStage {
                    id: uuid(111),
                    pipeline_id: uuid(11),
                    nome: "Negociação".to_string(),
                    fase: Some(Fase::Planner),
                    is_won: false,
                    is_lost: false,
                    ordem: 2,
                    phase_id: None,
                },
            ],
            vec![],
        )
        .await;
    let mut trigger = trigger_base();
    trigger.target_pipeline_id = Some(uuid(11));
    store.seed_trigger(trigger).await;
    store
        .seed_event(event(
            529,
            EntityType::Deal,
            EventType::DealAdd,
            json!({ "deal[id]": "928", "deal[pipelineid]": "5", "deal[stageid]": "30" }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    assert_eq!(cards[0].pipeline_id, Some(uuid(11)));
    assert_eq!(cards[0].pipeline_stage_id, Some(uuid(110)));
    assert_eq!(cards[0].produto.as_deref(), Some("expansao"));

    let stored = store.event(uuid(529)).await.expect("event");
    assert!(stored.processing_log.contains("pipeline override"));
    Ok(())
}

#[tokio::test]
async fn mapped_column_field_lands_on_declared_column() -> Result<()> {
    let store = seeded_store().await;
    store
        .seed_field_mapping(FieldMapping {
            id: Uuid::new_v4(),
            integration_id: uuid(INTEGRATION),
            external_field_id: "200".to_string(),
            external_pipeline_id: None,
            field_key: "cidade".to_string(),
            entity_type: MappingEntity::Deal,
            direction: MappingDirection::Inbound,
            storage_location: StorageLocation::Column,
            db_column_name: Some("cidade_cliente".to_string()),
            sync_always: true,
        })
        .await;
    store
        .seed_event(event(
            523,
            EntityType::Deal,
            EventType::DealAdd,
            json!({
                "deal[id]": "921",
                "deal[pipelineid]": "5",
                "deal[stageid]": "30",
                "200": "Curitiba",
            }),
        ))
        .await;

    invoke(app(&store)).await?;
    let cards = store.cards().await;
    let columns = store.extra_columns(cards[0].id).await;
    assert_eq!(columns.get("cidade_cliente"), Some(&json!("Curitiba")));
    Ok(())
}
