//! Resolution stage: external identifiers to internal records. Contacts go
//! through a three-tier dedup waterfall; stages through trigger overrides,
//! the mapping table, and the new-lead fallback.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use funil_core::contact::split_name;
use funil_core::event::{EXTERNAL_SOURCE_ACTIVE_CAMPAIGN, payload_keys};
use funil_core::phone::normalize_phone;
use funil_core::topology::Fase;
use funil_core::trigger::InboundTrigger;
use funil_core::{Contact, ContactPatch, IntegrationEvent, ProcessError, RunMode};
use funil_store::IntegrationStore;

use crate::processor::{RunContext, RunLog};

/// Stage placement for this event, fully dereferenced against the topology.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedTopology {
    pub stage_id: Uuid,
    pub pipeline_id: Uuid,
    pub fase: Option<Fase>,
    pub is_won: bool,
    pub is_lost: bool,
}

/// Resolve where the event wants to place the card. `Ok(None)` means the
/// event carries no stage information and existing placement is kept.
pub fn resolve_topology(
    ctx: &RunContext,
    event: &IntegrationEvent,
    trigger: Option<&InboundTrigger>,
    log: &mut RunLog,
) -> Result<Option<ResolvedTopology>, ProcessError> {
    if let Some(stage_id) = trigger.and_then(|t| t.target_stage_id) {
        log.push(format!("[TRIGGER] stage override {stage_id}"));
        return dereference(ctx, stage_id).map(Some);
    }

    let Some(topo) = mapped_topology(ctx, event, log)? else {
        return Ok(None);
    };
    Ok(Some(apply_pipeline_override(ctx, trigger, topo, log)))
}

/// Stage placement from the mapping table and the new-lead fallback, before
/// any trigger pipeline override.
fn mapped_topology(
    ctx: &RunContext,
    event: &IntegrationEvent,
    log: &mut RunLog,
) -> Result<Option<ResolvedTopology>, ProcessError> {
    let external_pipeline_id = event.external_pipeline_id();
    let external_stage_id = event.external_stage_id();
    if let (Some(pipeline), Some(stage)) = (&external_pipeline_id, &external_stage_id) {
        if let Some(stage_id) = ctx
            .mappings
            .stage_for(event.integration_id, pipeline, stage)
        {
            return dereference(ctx, stage_id).map(Some);
        }
        if event.event_type.is_creation()
            && let Some(stage_id) = ctx.default_new_lead_stage
        {
            log.push(format!("[STAGE] unmapped, using new-lead default {stage_id}"));
            return dereference(ctx, stage_id).map(Some);
        }
        return Err(ProcessError::UnmappedStage {
            external_pipeline_id,
            external_stage_id,
        });
    }

    // No stage in the payload: creations still need somewhere to land.
    if event.event_type.is_creation() {
        if let Some(stage_id) = ctx.default_new_lead_stage {
            log.push(format!("[STAGE] no stage in payload, using new-lead default {stage_id}"));
            return dereference(ctx, stage_id).map(Some);
        }
        return Err(ProcessError::UnmappedStage {
            external_pipeline_id,
            external_stage_id,
        });
    }
    Ok(None)
}

/// A trigger with `target_pipeline_id` but no `target_stage_id` reroutes the
/// mapped placement into that pipeline's entry stage. With a stage override
/// the stage's own pipeline wins, so this only runs on mapped placements.
fn apply_pipeline_override(
    ctx: &RunContext,
    trigger: Option<&InboundTrigger>,
    topo: ResolvedTopology,
    log: &mut RunLog,
) -> ResolvedTopology {
    let Some(pipeline_id) = trigger.and_then(|t| t.target_pipeline_id) else {
        return topo;
    };
    if pipeline_id == topo.pipeline_id {
        return topo;
    }
    let redirected = ctx
        .topology
        .entry_stage_for_pipeline(pipeline_id)
        .and_then(|stage_id| dereference(ctx, stage_id).ok());
    match redirected {
        Some(redirect) => {
            log.push(format!(
                "[TRIGGER] pipeline override {pipeline_id}, routed to entry stage {}",
                redirect.stage_id
            ));
            redirect
        }
        None => {
            log.push(format!(
                "[TRIGGER] pipeline override {pipeline_id} has no entry stage, kept mapped stage"
            ));
            topo
        }
    }
}

fn dereference(ctx: &RunContext, stage_id: Uuid) -> Result<ResolvedTopology, ProcessError> {
    let stage = ctx
        .topology
        .stage(stage_id)
        .ok_or(ProcessError::UnresolvedTopology { stage_id })?;
    ctx.topology
        .pipeline(stage.pipeline_id)
        .ok_or(ProcessError::UnresolvedTopology { stage_id })?;
    Ok(ResolvedTopology {
        stage_id,
        pipeline_id: stage.pipeline_id,
        fase: stage.fase,
        is_won: stage.is_won,
        is_lost: stage.is_lost,
    })
}

/// Map the external deal owner to an internal user, when both sides exist.
pub fn resolve_owner(ctx: &RunContext, event: &IntegrationEvent) -> Option<Uuid> {
    event
        .external_owner_id()
        .and_then(|external| ctx.mappings.user_for(event.integration_id, &external))
}

/// Three-tier contact dedup: external link, then email, then the fuzzy phone
/// procedure (fail-open). Creates the contact when nothing matches, except in
/// shadow mode.
pub async fn resolve_contact(
    store: &Arc<dyn IntegrationStore>,
    mode: RunMode,
    event: &IntegrationEvent,
    log: &mut RunLog,
) -> Result<Option<Uuid>, ProcessError> {
    let external_id = event.payload_non_empty(payload_keys::CONTACT_ID);
    let email = event.payload_non_empty(payload_keys::CONTACT_EMAIL);
    let phone = event.payload_non_empty(payload_keys::CONTACT_PHONE);
    if external_id.is_none() && email.is_none() && phone.is_none() {
        return Ok(None);
    }

    if let Some(external) = &external_id
        && let Some(contact) = store
            .find_contact_by_external(EXTERNAL_SOURCE_ACTIVE_CAMPAIGN, external)
            .await?
    {
        return Ok(Some(contact.id));
    }

    if let Some(email) = &email
        && let Some(contact) = store.find_contact_by_email(email).await?
    {
        // Backfill the external link, but never steal a contact already
        // linked elsewhere.
        if contact.external_id.is_none()
            && let Some(external) = &external_id
            && !mode.is_shadow()
        {
            let patch = ContactPatch {
                external_id: Some(external.clone()),
                external_source: Some(EXTERNAL_SOURCE_ACTIVE_CAMPAIGN.to_string()),
                ..ContactPatch::default()
            };
            store.update_contact(contact.id, patch).await?;
            log.push("[CONTACT] matched by email, external link backfilled");
        }
        return Ok(Some(contact.id));
    }

    if let Some(phone) = &phone {
        match store.match_contact_by_phone(phone).await {
            Ok(Some(contact_id)) => {
                log.push("[CONTACT] matched by phone");
                return Ok(Some(contact_id));
            }
            Ok(None) => {}
            // Phone matching is best-effort; a broken procedure must not
            // stall the queue.
            Err(error) => {
                tracing::warn!(%error, "phone match unavailable, continuing without it");
                log.push("[CONTACT] phone match unavailable, skipped");
            }
        }
    }

    if mode.is_shadow() {
        log.push("[SHADOW] would create contact");
        return Ok(None);
    }

    let (nome, sobrenome) = contact_name(event);
    let contact = Contact {
        id: Uuid::new_v4(),
        external_id,
        external_source: Some(EXTERNAL_SOURCE_ACTIVE_CAMPAIGN.to_string()),
        email,
        phone: phone.clone(),
        nome,
        sobrenome,
        tags: Vec::new(),
        marketing_data: serde_json::Map::new(),
        created_at: Utc::now(),
    };
    let created = store.insert_contact(contact).await?;
    log.push("[CONTACT] created");
    if let Some(normalized) = phone.as_deref().and_then(normalize_phone) {
        store.upsert_phone_index(created.id, &normalized).await?;
    }
    Ok(Some(created.id))
}

/// First/last name from the payload; a lone first name holding a full name
/// is split on its first space.
pub fn contact_name(event: &IntegrationEvent) -> (Option<String>, Option<String>) {
    let first = event.payload_non_empty(payload_keys::CONTACT_FIRST_NAME);
    let last = event.payload_non_empty(payload_keys::CONTACT_LAST_NAME);
    match (first, last) {
        (Some(first), None) => split_name(&first),
        pair => pair,
    }
}
