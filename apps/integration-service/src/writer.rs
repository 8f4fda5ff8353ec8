//! Entity writer: turns a resolved event plus its field patch into card and
//! contact writes, enforcing lost-forcing, anti-regression, and lock rules
//! that apply to the standard fields.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use funil_core::event::{EXTERNAL_SOURCE_ACTIVE_CAMPAIGN, payload_keys};
use funil_core::fields::{FieldContext, FieldPatch, map_event_fields};
use funil_core::mapping::MappingEntity;
use funil_core::origin::{payload_has_utm, resolve_origem};
use funil_core::phone::normalize_phone;
use funil_core::topology::Fase;
use funil_core::{Card, CardPatch, ContactPatch, IntegrationEvent, ProcessError, StatusComercial};
use funil_store::{IntegrationStore, LoopSafeWriter};

use crate::processor::{RunContext, RunLog};
use crate::recorder::Disposition;
use crate::resolver::{self, ResolvedTopology};

/// ActiveCampaign reports deal value in cents.
pub fn parse_deal_value(event: &IntegrationEvent) -> Option<f64> {
    let raw = event.payload_non_empty(payload_keys::DEAL_VALUE)?;
    let cents: f64 = raw.parse().ok()?;
    Some(cents / 100.0)
}

/// Fold the mapper's unmapped leftovers under `marketing_data.unmapped` so
/// nothing from the payload is silently dropped.
fn fold_unmapped(marketing_data: &mut Map<String, Value>, unmapped: Map<String, Value>) {
    if unmapped.is_empty() {
        return;
    }
    funil_store::merge_bucket_entry(
        marketing_data,
        funil_core::fields::UNMAPPED_BUCKET_KEY.to_string(),
        Value::Object(unmapped),
    );
}

pub async fn create_card(
    writer: &LoopSafeWriter,
    ctx: &RunContext,
    event: &IntegrationEvent,
    external_id: &str,
    contact_id: Option<Uuid>,
    topo: Option<ResolvedTopology>,
    owner: Option<Uuid>,
    patch: FieldPatch,
    log: &mut RunLog,
) -> Result<String, ProcessError> {
    let mut topo = topo.ok_or(ProcessError::CreateWithoutTopology)?;

    // A deal already lost at the source lands straight on the lost stage.
    if event.reports_lost()
        && !topo.is_lost
        && let Some(lost_stage) = ctx.topology.lost_stage_for_pipeline(topo.pipeline_id)
    {
        log.push(format!("[LOST_FORCE] routed to lost stage {lost_stage}"));
        topo = resolved_stage(ctx, lost_stage).unwrap_or(topo);
    }

    let status = if topo.is_lost || event.reports_lost() {
        StatusComercial::Perdido
    } else if topo.is_won {
        StatusComercial::Ganho
    } else {
        StatusComercial::Aberto
    };

    let titulo = event
        .payload_non_empty(payload_keys::DEAL_TITLE)
        .unwrap_or_else(|| format!("Negócio {external_id}"));
    let origem = resolve_origem(
        event.payload_non_empty(payload_keys::DEAL_ORIGIN).as_deref(),
        payload_has_utm(&event.payload),
        EXTERNAL_SOURCE_ACTIVE_CAMPAIGN,
    );

    let mut marketing_data = patch.marketing_data;
    fold_unmapped(&mut marketing_data, patch.unmapped);

    let mut card = Card {
        id: Uuid::new_v4(),
        external_id: Some(external_id.to_string()),
        external_source: Some(EXTERNAL_SOURCE_ACTIVE_CAMPAIGN.to_string()),
        titulo,
        valor_estimado: parse_deal_value(event),
        status_comercial: status,
        pipeline_stage_id: Some(topo.stage_id),
        pipeline_id: Some(topo.pipeline_id),
        produto: ctx
            .topology
            .pipeline(topo.pipeline_id)
            .and_then(|pipeline| pipeline.produto.clone()),
        dono_atual_id: owner,
        sdr_id: None,
        planner_id: None,
        posvenda_id: None,
        contato_id: contact_id,
        origem: Some(origem),
        marketing_data,
        produto_data: patch.produto_data,
        briefing_inicial: patch.briefing_inicial,
        locked_fields: Map::new(),
        created_at: event.external_created_at().unwrap_or_else(Utc::now),
    };
    if let Some(owner) = owner {
        route_owner_fields(&mut card, owner, topo.fase);
    }

    let created = writer.insert_card(card).await?;

    // Mapped column targets live outside the typed card shape; they follow
    // as a patch against the new row.
    if !patch.columns.is_empty() {
        let column_patch = CardPatch {
            columns: patch.columns,
            ..CardPatch::default()
        };
        writer.update_card(created.id, column_patch).await?;
    }
    log_skips(&patch.skipped, log);
    Ok(format!("card created at stage {}", topo.stage_id))
}

pub async fn update_card(
    writer: &LoopSafeWriter,
    ctx: &RunContext,
    event: &IntegrationEvent,
    card: &Card,
    contact_id: Option<Uuid>,
    topo: Option<ResolvedTopology>,
    owner: Option<Uuid>,
    patch: FieldPatch,
    log: &mut RunLog,
) -> Result<String, ProcessError> {
    let mut update = CardPatch::default();
    let mut final_stage_fase = card
        .pipeline_stage_id
        .and_then(|stage| ctx.topology.stage(stage))
        .and_then(|stage| stage.fase);

    if let Some(titulo) = event.payload_non_empty(payload_keys::DEAL_TITLE) {
        if card.is_locked("titulo") {
            log.push("[FIELD] titulo locked, kept");
        } else if !card.titulo.trim().is_empty()
            && standard_field_protected(ctx, event, payload_keys::DEAL_TITLE)
        {
            log.push("[FIELD] titulo protected, kept");
        } else {
            update.titulo = Some(titulo);
        }
    }
    if let Some(valor) = parse_deal_value(event) {
        if card.is_locked("valor_estimado") {
            log.push("[FIELD] valor_estimado locked, kept");
        } else if card.valor_estimado.is_some()
            && standard_field_protected(ctx, event, payload_keys::DEAL_VALUE)
        {
            log.push("[FIELD] valor_estimado protected, kept");
        } else {
            update.valor_estimado = Some(valor);
        }
    }

    if event.reports_lost() {
        let pipeline_id = topo.map(|t| t.pipeline_id).or(card.pipeline_id);
        if let Some(lost_stage) =
            pipeline_id.and_then(|pipeline| ctx.topology.lost_stage_for_pipeline(pipeline))
        {
            log.push(format!("[LOST_FORCE] routed to lost stage {lost_stage}"));
            update.pipeline_stage_id = Some(lost_stage);
            update.pipeline_id = pipeline_id;
            final_stage_fase = ctx
                .topology
                .stage(lost_stage)
                .and_then(|stage| stage.fase);
        }
        update.status_comercial = Some(StatusComercial::Perdido);
    } else if let Some(target) = topo {
        match card.pipeline_stage_id {
            Some(current) if ctx.topology.would_regress(current, target.stage_id) => {
                // Stage, pipeline, and any won status ride together; all are
                // withheld when the move would pull the card backwards.
                log.push(format!(
                    "[DONT_REGRESS] kept stage {current}, rejected move to {}",
                    target.stage_id
                ));
            }
            _ => {
                update.pipeline_stage_id = Some(target.stage_id);
                update.pipeline_id = Some(target.pipeline_id);
                if card.produto.is_none() {
                    update.produto = ctx
                        .topology
                        .pipeline(target.pipeline_id)
                        .and_then(|pipeline| pipeline.produto.clone());
                }
                if target.is_won {
                    update.status_comercial = Some(StatusComercial::Ganho);
                } else if target.is_lost {
                    update.status_comercial = Some(StatusComercial::Perdido);
                }
                final_stage_fase = target.fase;
            }
        }
    }

    if let Some(owner) = owner {
        update.set_owner_for_fase(owner, final_stage_fase);
    }
    if card.contato_id.is_none() {
        update.contato_id = contact_id;
    }

    update.columns = patch.columns;
    update.produto_data = patch.produto_data;
    update.briefing_inicial = patch.briefing_inicial;
    update.marketing_data = patch.marketing_data;
    fold_unmapped(&mut update.marketing_data, patch.unmapped);
    log_skips(&patch.skipped, log);

    if update.is_empty() {
        log.push("no effective changes");
        return Ok("card unchanged".to_string());
    }
    writer.update_card(card.id, update).await?;
    Ok("card updated".to_string())
}

/// Standard deal fields bypass the per-key mapper, so a protected mapping
/// (`sync_always = false`) declared on one of their payload keys is honored
/// here instead.
fn standard_field_protected(ctx: &RunContext, event: &IntegrationEvent, key: &str) -> bool {
    let pipeline = event.external_pipeline_id();
    ctx.mappings
        .field_for(
            event.integration_id,
            key,
            MappingEntity::Deal,
            pipeline.as_deref(),
        )
        .is_some_and(|mapping| !mapping.sync_always)
}

fn route_owner_fields(card: &mut Card, owner: Uuid, fase: Option<Fase>) {
    card.dono_atual_id = Some(owner);
    match fase {
        Some(Fase::Sdr) => card.sdr_id = Some(owner),
        Some(Fase::Planner) => card.planner_id = Some(owner),
        Some(Fase::PosVenda) => card.posvenda_id = Some(owner),
        None => {}
    }
}

fn resolved_stage(ctx: &RunContext, stage_id: Uuid) -> Option<ResolvedTopology> {
    let stage = ctx.topology.stage(stage_id)?;
    Some(ResolvedTopology {
        stage_id,
        pipeline_id: stage.pipeline_id,
        fase: stage.fase,
        is_won: stage.is_won,
        is_lost: stage.is_lost,
    })
}

fn log_skips(skipped: &[funil_core::fields::SkippedField], log: &mut RunLog) {
    for skip in skipped {
        log.push(format!("[FIELD] {} skipped ({:?})", skip.key, skip.reason));
    }
}

/// Contact-entity events sync the contact record alone; no card is touched.
pub async fn sync_contact_event(
    store: &Arc<dyn IntegrationStore>,
    ctx: &RunContext,
    event: &IntegrationEvent,
    log: &mut RunLog,
) -> Result<Disposition, ProcessError> {
    let contact_id = resolver::resolve_contact(store, ctx.mode, event, log).await?;

    // Protected mappings compare against the stored record, so the resolved
    // contact is read back before mapping. Contacts carry no per-field locks.
    let existing_contact = match contact_id {
        Some(id) => store.find_contact_by_id(id).await?,
        None => None,
    };
    let existing_json = existing_contact
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|error| ProcessError::transient(error.to_string()))?;

    let empty_locks = Map::new();
    let fctx = FieldContext {
        integration_id: event.integration_id,
        external_pipeline_id: None,
        entity: MappingEntity::Contact,
        mappings: &ctx.mappings,
        existing: existing_json.as_ref(),
        locked_fields: &empty_locks,
    };
    let field_patch = map_event_fields(&event.payload, &fctx);
    log_skips(&field_patch.skipped, log);

    if ctx.mode.is_shadow() {
        log.push("[SHADOW] writes suppressed");
        return Ok(Disposition::Shadow {
            detail: "contact sync simulated".to_string(),
        });
    }

    let Some(contact_id) = contact_id else {
        // Nothing to key the contact on; resolve_contact creates one when
        // any identifier is present.
        return Ok(Disposition::OutOfScope {
            detail: "contact event without identifiers".to_string(),
        });
    };

    let (nome, sobrenome) = resolver::contact_name(event);
    let mut marketing_data = field_patch.marketing_data;
    // Contacts have a single bucket; everything non-column lands there.
    for (key, value) in field_patch.produto_data {
        funil_store::merge_bucket_entry(&mut marketing_data, key, value);
    }
    for (key, value) in field_patch.briefing_inicial {
        funil_store::merge_bucket_entry(&mut marketing_data, key, value);
    }
    fold_unmapped(&mut marketing_data, field_patch.unmapped);

    let patch = ContactPatch {
        email: event.payload_non_empty(payload_keys::CONTACT_EMAIL),
        phone: event.payload_non_empty(payload_keys::CONTACT_PHONE),
        nome,
        sobrenome,
        external_id: None,
        external_source: None,
        columns: field_patch.columns,
        marketing_data,
    };
    if !patch.is_empty() {
        store.update_contact(contact_id, patch).await?;
        if let Some(normalized) = event
            .payload_non_empty(payload_keys::CONTACT_PHONE)
            .as_deref()
            .and_then(normalize_phone)
        {
            store.upsert_phone_index(contact_id, &normalized).await?;
        }
    }
    Ok(Disposition::Written {
        detail: "contact synced".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use funil_core::event::{EntityType, EventStatus, EventType};
    use serde_json::json;

    fn event_with_value(raw: Value) -> IntegrationEvent {
        let mut payload = Map::new();
        payload.insert(payload_keys::DEAL_VALUE.to_string(), raw);
        IntegrationEvent {
            id: Uuid::new_v4(),
            integration_id: Uuid::new_v4(),
            entity_type: EntityType::Deal,
            event_type: EventType::DealUpdate,
            payload,
            status: EventStatus::Pending,
            attempts: 0,
            next_retry_at: None,
            matched_trigger_id: None,
            processing_log: String::new(),
            processed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn deal_value_converts_from_cents() {
        assert_eq!(parse_deal_value(&event_with_value(json!("150000"))), Some(1500.0));
        assert_eq!(parse_deal_value(&event_with_value(json!(2550))), Some(25.5));
        assert_eq!(parse_deal_value(&event_with_value(json!("abc"))), None);
        assert_eq!(parse_deal_value(&event_with_value(json!(""))), None);
    }

    #[test]
    fn unmapped_leftovers_nest_under_marketing_data() {
        let mut marketing = Map::new();
        let mut unmapped = Map::new();
        unmapped.insert("campo_x".to_string(), json!("v"));
        fold_unmapped(&mut marketing, unmapped);
        assert_eq!(marketing["unmapped"]["campo_x"], json!("v"));

        // Second fold merges rather than replacing.
        let mut more = Map::new();
        more.insert("campo_y".to_string(), json!("w"));
        fold_unmapped(&mut marketing, more);
        assert_eq!(marketing["unmapped"]["campo_x"], json!("v"));
        assert_eq!(marketing["unmapped"]["campo_y"], json!("w"));
    }
}
