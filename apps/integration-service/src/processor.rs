//! Batch orchestration: load configuration once, walk the due events, and
//! run each through trigger evaluation, resolution, the quality gate, field
//! mapping, and the entity writer. Every event settles through the recorder
//! regardless of how it fared.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use funil_core::event::{EXTERNAL_SOURCE_ACTIVE_CAMPAIGN, EntityType, payload_keys};
use funil_core::fields::{FieldContext, FieldPatch, map_event_fields};
use funil_core::mapping::MappingEntity;
use funil_core::mode::{allowed_event_types, default_new_lead_stage, resolve_run_mode};
use funil_core::trigger::{InboundTrigger, TriggerContext, TriggerDecision, evaluate_triggers};
use funil_core::{
    Card, ConflictLogEntry, ConflictResolution, EventType, IntegrationEvent, MappingIndex,
    ProcessError, QuarantineMode, RunMode, TopologyIndex, ValidationLevel,
};
use funil_store::{IntegrationStore, LoopSafeWriter, StoreError};

use crate::recorder::{self, Disposition, EventResult};
use crate::resolver::{self, ResolvedTopology};
use crate::writer;
use crate::{AppState, ProcessRequest};

/// Configuration snapshot shared read-only across one batch.
pub struct RunContext {
    pub mode: RunMode,
    pub allowed_event_types: HashSet<EventType>,
    pub default_new_lead_stage: Option<Uuid>,
    pub mappings: MappingIndex,
    pub topology: TopologyIndex,
    pub triggers: Vec<InboundTrigger>,
}

impl RunContext {
    pub async fn load(store: &Arc<dyn IntegrationStore>) -> Result<Self, StoreError> {
        let settings = store.load_settings().await?;
        let mappings = MappingIndex::new(
            store.load_stage_mappings().await?,
            store.load_user_mappings().await?,
            store.load_field_mappings().await?,
        );
        let topology = TopologyIndex::new(
            store.load_pipelines().await?,
            store.load_stages().await?,
            store.load_phases().await?,
        );
        let triggers = store.load_triggers().await?;
        Ok(Self {
            mode: resolve_run_mode(&settings),
            allowed_event_types: allowed_event_types(&settings),
            default_new_lead_stage: default_new_lead_stage(&settings),
            mappings,
            topology,
            triggers,
        })
    }
}

/// Per-event annotation buffer, rendered into the processing log.
#[derive(Debug, Default)]
pub struct RunLog(Vec<String>);

impl RunLog {
    pub fn push(&mut self, entry: impl Into<String>) {
        self.0.push(entry.into());
    }

    pub fn render(&self) -> String {
        self.0.join(" | ")
    }
}

#[derive(Debug, Default, Serialize)]
pub struct BatchStats {
    pub scanned: usize,
    pub eligible: usize,
    pub updated: usize,
    pub blocked: usize,
    pub processed_shadow: usize,
    pub ignored: usize,
    pub ignored_by_trigger: usize,
    pub errors: usize,
    pub mode: String,
}

#[derive(Debug, Serialize)]
pub struct ProcessReport {
    pub message: String,
    pub stats: BatchStats,
    pub results: Vec<EventResult>,
}

pub async fn run_batch(
    state: &AppState,
    request: ProcessRequest,
) -> Result<ProcessReport, StoreError> {
    let ctx = RunContext::load(&state.store).await?;
    let events = match &request.event_ids {
        Some(ids) if !ids.is_empty() => {
            state
                .store
                .fetch_events_by_ids(ids, request.integration_id)
                .await?
        }
        _ => {
            state
                .store
                .fetch_pending_events(state.config.batch_limit, request.integration_id)
                .await?
        }
    };

    let mut stats = BatchStats {
        scanned: events.len(),
        mode: ctx.mode.as_str().to_string(),
        ..BatchStats::default()
    };
    if events.is_empty() {
        return Ok(ProcessReport {
            message: "No events to process".to_string(),
            stats,
            results: Vec::new(),
        });
    }

    let writer = LoopSafeWriter::new(Arc::clone(&state.store));
    let mut results = Vec::with_capacity(events.len());
    for event in &events {
        let mut log = RunLog::default();
        if !writer.is_enabled() {
            log.push("[LOOP_SAFE off]");
        }
        let mut matched_trigger_id = None;
        let result = process_event(state, &ctx, &writer, event, &mut log, &mut matched_trigger_id)
            .await;
        if let Err(error) = &result {
            tracing::warn!(event_id = %event.id, %error, "event processing failed");
        }
        let event_result = recorder::record(
            &state.store,
            event,
            result,
            log.render(),
            matched_trigger_id,
            &mut stats,
        )
        .await;
        results.push(event_result);
    }

    tracing::info!(
        scanned = stats.scanned,
        updated = stats.updated,
        blocked = stats.blocked,
        errors = stats.errors,
        mode = %stats.mode,
        "batch complete"
    );
    Ok(ProcessReport {
        message: format!("Processed {} events", results.len()),
        stats,
        results,
    })
}

async fn process_event(
    state: &AppState,
    ctx: &RunContext,
    writer: &LoopSafeWriter,
    event: &IntegrationEvent,
    log: &mut RunLog,
    matched_trigger_id: &mut Option<Uuid>,
) -> Result<Disposition, ProcessError> {
    if event.entity_type == EntityType::DealActivity {
        return Ok(Disposition::OutOfScope {
            detail: "deal activity events are not processed".to_string(),
        });
    }
    if !ctx.allowed_event_types.contains(&event.event_type) {
        return Ok(Disposition::OutOfScope {
            detail: format!("event type {} not in allowed set", event.event_type.as_str()),
        });
    }

    let manual_sync = event.is_manual_sync();
    let trigger = if manual_sync {
        log.push("[MANUAL_SYNC] trigger and quality gates bypassed");
        None
    } else {
        let external_pipeline_id = event.external_pipeline_id();
        let external_stage_id = event.external_stage_id();
        let external_owner_id = event.external_owner_id();
        let trigger_ctx = TriggerContext {
            integration_id: event.integration_id,
            external_pipeline_id: external_pipeline_id.as_deref(),
            external_stage_id: external_stage_id.as_deref(),
            external_owner_id: external_owner_id.as_deref(),
            entity_type: event.entity_type,
            event_type: &event.event_type,
        };
        match evaluate_triggers(&ctx.triggers, &trigger_ctx) {
            TriggerDecision::Allowed(Some(trigger)) => {
                *matched_trigger_id = Some(trigger.id);
                log.push(format!("[TRIGGER {}] matched", trigger.id));
                Some(trigger)
            }
            TriggerDecision::Allowed(None) => None,
            TriggerDecision::Blocked => {
                log.push("[TRIGGER] no active trigger matches this event");
                return Ok(Disposition::TriggerBlocked {
                    detail: "blocked by trigger allowlist".to_string(),
                });
            }
        }
    };

    match event.entity_type {
        EntityType::Contact => writer::sync_contact_event(&state.store, ctx, event, log).await,
        EntityType::Deal => {
            process_deal_event(state, ctx, writer, event, trigger, manual_sync, log).await
        }
        EntityType::DealActivity => Ok(Disposition::OutOfScope {
            detail: "deal activity events are not processed".to_string(),
        }),
    }
}

async fn process_deal_event(
    state: &AppState,
    ctx: &RunContext,
    writer: &LoopSafeWriter,
    event: &IntegrationEvent,
    trigger: Option<&InboundTrigger>,
    manual_sync: bool,
    log: &mut RunLog,
) -> Result<Disposition, ProcessError> {
    let external_id = event
        .external_deal_id()
        .ok_or(ProcessError::MissingExternalId)?;

    let contact_id = resolver::resolve_contact(&state.store, ctx.mode, event, log).await?;
    let mut topo = resolver::resolve_topology(ctx, event, trigger, log)?;
    let owner = resolver::resolve_owner(ctx, event);

    let existing = state
        .store
        .find_card_by_external(EXTERNAL_SOURCE_ACTIVE_CAMPAIGN, &external_id)
        .await?;
    let existing_json = existing
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|error| ProcessError::transient(error.to_string()))?;

    let empty_locks = Map::new();
    let external_pipeline_id = event.external_pipeline_id();
    let field_ctx = FieldContext {
        integration_id: event.integration_id,
        external_pipeline_id: external_pipeline_id.as_deref(),
        entity: MappingEntity::Deal,
        mappings: &ctx.mappings,
        existing: existing_json.as_ref(),
        locked_fields: existing.as_ref().map_or(&empty_locks, |card| &card.locked_fields),
    };
    let patch = map_event_fields(&event.payload, &field_ctx);

    if !manual_sync
        && let Verdict::Blocked(detail) = apply_quality_gate(
            state,
            event,
            trigger,
            ctx,
            &mut topo,
            existing.as_ref(),
            &patch,
            log,
        )
        .await?
    {
        return Ok(Disposition::GateBlocked { detail });
    }

    if ctx.mode.is_shadow() {
        log.push("[SHADOW] writes suppressed");
        let detail = if existing.is_some() {
            "card update simulated".to_string()
        } else {
            "card creation simulated".to_string()
        };
        return Ok(Disposition::Shadow { detail });
    }

    let detail = match existing {
        Some(card) => {
            writer::update_card(writer, ctx, event, &card, contact_id, topo, owner, patch, log)
                .await?
        }
        None => {
            writer::create_card(
                writer,
                ctx,
                event,
                &external_id,
                contact_id,
                topo,
                owner,
                patch,
                log,
            )
            .await?
        }
    };
    Ok(Disposition::Written { detail })
}

enum Verdict {
    Proceed,
    Blocked(String),
}

/// Run the stored quality-gate procedure for trigger-governed stage entry.
/// Gate transport errors fail open; a failed validation is resolved per the
/// trigger's quarantine mode.
#[allow(clippy::too_many_arguments)]
async fn apply_quality_gate(
    state: &AppState,
    event: &IntegrationEvent,
    trigger: Option<&InboundTrigger>,
    ctx: &RunContext,
    topo: &mut Option<ResolvedTopology>,
    existing: Option<&Card>,
    patch: &FieldPatch,
    log: &mut RunLog,
) -> Result<Verdict, ProcessError> {
    let Some(trigger) = trigger else {
        return Ok(Verdict::Proceed);
    };
    let Some(target) = *topo else {
        return Ok(Verdict::Proceed);
    };
    if trigger.bypass_validation || trigger.validation_level == ValidationLevel::None {
        return Ok(Verdict::Proceed);
    }

    let preview = compose_card_preview(event, existing, target, patch);
    let outcome = match state
        .store
        .validate_card_for_stage(
            &preview,
            target.stage_id,
            EXTERNAL_SOURCE_ACTIVE_CAMPAIGN,
            trigger.validation_level,
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::warn!(%error, "stage validation unavailable, failing open");
            log.push("[GATE] validation unavailable, fail-open");
            return Ok(Verdict::Proceed);
        }
    };
    if outcome.valid {
        return Ok(Verdict::Proceed);
    }
    if outcome.can_bypass {
        log.push("[GATE] invalid but bypassable, proceeding");
        return Ok(Verdict::Proceed);
    }

    let missing = outcome.missing_requirements;
    let (resolution, verdict) = match trigger.quarantine_mode {
        QuarantineMode::Reject => {
            log.push(format!("[GATE] rejected, missing: {}", missing.join(", ")));
            (
                ConflictResolution::Rejected,
                Verdict::Blocked(format!(
                    "stage requirements not met: {}",
                    missing.join(", ")
                )),
            )
        }
        QuarantineMode::Stage => match trigger
            .quarantine_stage_id
            .and_then(|stage_id| quarantine_redirect(ctx, stage_id))
        {
            Some(redirect) => {
                log.push(format!("[GATE] quarantined to stage {}", redirect.stage_id));
                *topo = Some(redirect);
                (ConflictResolution::Quarantined, Verdict::Proceed)
            }
            // No usable quarantine stage configured: degrade to force.
            None => {
                log.push("[GATE] quarantine stage unset, forcing through");
                (ConflictResolution::Forced, Verdict::Proceed)
            }
        },
        QuarantineMode::Force => {
            log.push(format!(
                "[GATE] forced through, missing: {}",
                missing.join(", ")
            ));
            (ConflictResolution::Forced, Verdict::Proceed)
        }
    };

    let actual_stage_id = match (&verdict, topo.as_ref()) {
        (Verdict::Blocked(_), _) => existing.and_then(|card| card.pipeline_stage_id),
        (Verdict::Proceed, placed) => placed.map(|t| t.stage_id),
    };
    let entry = ConflictLogEntry {
        id: Uuid::new_v4(),
        event_id: event.id,
        trigger_id: Some(trigger.id),
        conflict_type: "validation_failed".to_string(),
        target_stage_id: Some(target.stage_id),
        actual_stage_id,
        missing_requirements: missing,
        resolution,
        created_at: Utc::now(),
    };
    state.store.insert_conflict_log(entry).await?;
    Ok(verdict)
}

fn quarantine_redirect(ctx: &RunContext, stage_id: Uuid) -> Option<ResolvedTopology> {
    let stage = ctx.topology.stage(stage_id)?;
    Some(ResolvedTopology {
        stage_id,
        pipeline_id: stage.pipeline_id,
        fase: stage.fase,
        is_won: stage.is_won,
        is_lost: stage.is_lost,
    })
}

/// The card as it would look after the write, for the validation procedure.
fn compose_card_preview(
    event: &IntegrationEvent,
    existing: Option<&Card>,
    target: ResolvedTopology,
    patch: &FieldPatch,
) -> Value {
    let mut preview = existing
        .map(|card| serde_json::to_value(card).unwrap_or_else(|_| json!({})))
        .unwrap_or_else(|| json!({}));
    let Some(map) = preview.as_object_mut() else {
        return preview;
    };
    if let Some(titulo) = event.payload_non_empty(payload_keys::DEAL_TITLE) {
        map.insert("titulo".to_string(), json!(titulo));
    }
    if let Some(valor) = writer::parse_deal_value(event) {
        map.insert("valor_estimado".to_string(), json!(valor));
    }
    map.insert("pipeline_stage_id".to_string(), json!(target.stage_id));
    map.insert("pipeline_id".to_string(), json!(target.pipeline_id));
    for (column, value) in &patch.columns {
        map.insert(column.clone(), value.clone());
    }
    for (bucket_name, bucket) in [
        ("marketing_data", &patch.marketing_data),
        ("produto_data", &patch.produto_data),
        ("briefing_inicial", &patch.briefing_inicial),
    ] {
        if bucket.is_empty() {
            continue;
        }
        let slot = map
            .entry(bucket_name.to_string())
            .or_insert_with(|| json!({}));
        if let Some(slot_map) = slot.as_object_mut() {
            for (key, value) in bucket {
                slot_map.insert(key.clone(), value.clone());
            }
        }
    }
    preview
}
