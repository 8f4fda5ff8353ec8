//! The field mapper: translates external payload fields into internal
//! storage locations, honoring per-record locks, per-mapping protection, and
//! the empty-value non-destruction rule. Pure: callers pass the existing
//! record as JSON and merge the resulting patch themselves.

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::event::payload_keys;
use crate::mapping::{FieldMapping, MappingEntity, MappingIndex, StorageLocation};

/// Sub-bucket of `marketing_data` that keeps payload fields nothing is
/// mapped for. Kept for traceability, never discarded.
pub const UNMAPPED_BUCKET_KEY: &str = "unmapped";

/// Standard keys the entity writer consumes directly; the field mapper never
/// touches them.
const RESERVED_KEYS: &[&str] = &[
    payload_keys::DEAL_ID,
    payload_keys::DEAL_TITLE,
    payload_keys::DEAL_VALUE,
    payload_keys::DEAL_PIPELINE,
    payload_keys::DEAL_STAGE,
    payload_keys::DEAL_OWNER,
    payload_keys::DEAL_STATUS,
    payload_keys::DEAL_CDATE,
    payload_keys::DEAL_ORIGIN,
    payload_keys::CONTACT_ID,
    payload_keys::CONTACT_EMAIL,
    payload_keys::CONTACT_PHONE,
    payload_keys::CONTACT_FIRST_NAME,
    payload_keys::CONTACT_LAST_NAME,
    payload_keys::MANUAL_SYNC,
];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Locked,
    Protected,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedField {
    pub key: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FieldPatch {
    pub columns: Map<String, Value>,
    pub produto_data: Map<String, Value>,
    pub marketing_data: Map<String, Value>,
    pub briefing_inicial: Map<String, Value>,
    pub unmapped: Map<String, Value>,
    pub skipped: Vec<SkippedField>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
            && self.produto_data.is_empty()
            && self.marketing_data.is_empty()
            && self.briefing_inicial.is_empty()
            && self.unmapped.is_empty()
    }
}

/// Empty in the "must not overwrite data" sense: null, blank string, or an
/// empty collection.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(raw) => raw.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Secondary resolver for keys predating database-driven routing. Mapping
/// rows with an explicit `storage_location` always win; this only catches
/// the `__bucket__.`-prefixed legacy notation.
pub fn legacy_storage_for_key(key: &str) -> Option<(StorageLocation, &str)> {
    key.strip_prefix("__produto_data__.")
        .map(|stripped| (StorageLocation::ProdutoData, stripped))
        .or_else(|| {
            key.strip_prefix("__marketing_data__.")
                .map(|stripped| (StorageLocation::MarketingData, stripped))
        })
        .or_else(|| {
            key.strip_prefix("__briefing_inicial__.")
                .map(|stripped| (StorageLocation::BriefingInicial, stripped))
        })
}

/// Strip a legacy bucket prefix from a mapped field key, if present.
pub fn de_prefixed_key(field_key: &str) -> &str {
    legacy_storage_for_key(field_key).map_or(field_key, |(_, stripped)| stripped)
}

/// Whether the existing record already holds a non-empty value for a key:
/// top level first, then the nested-document fallback.
pub fn existing_non_empty(
    existing: Option<&Value>,
    top_key: &str,
    bucket: Option<(&str, &str)>,
) -> bool {
    let Some(record) = existing else {
        return false;
    };
    if record.get(top_key).is_some_and(|value| !is_empty_value(value)) {
        return true;
    }
    if let Some((bucket_name, nested_key)) = bucket {
        return record
            .get(bucket_name)
            .and_then(|bucket_value| bucket_value.get(nested_key))
            .is_some_and(|value| !is_empty_value(value));
    }
    false
}

#[derive(Debug, Clone, Copy)]
pub struct FieldContext<'a> {
    pub integration_id: Uuid,
    pub external_pipeline_id: Option<&'a str>,
    pub entity: MappingEntity,
    pub mappings: &'a MappingIndex,
    /// Existing record serialized to JSON, for protection checks. `None` on
    /// creation.
    pub existing: Option<&'a Value>,
    pub locked_fields: &'a Map<String, Value>,
}

impl FieldContext<'_> {
    fn is_locked(&self, key: &str) -> bool {
        self.locked_fields.get(key) == Some(&Value::Bool(true))
    }
}

/// Map every non-reserved payload field. Precedence per field, highest
/// first: record lock, mapping protection (`sync_always = false` with an
/// existing non-empty value), empty-value skip, apply.
pub fn map_event_fields(payload: &Map<String, Value>, ctx: &FieldContext<'_>) -> FieldPatch {
    let mut patch = FieldPatch::default();
    for (key, value) in payload {
        if is_reserved_key(key) {
            continue;
        }
        match ctx
            .mappings
            .field_for(ctx.integration_id, key, ctx.entity, ctx.external_pipeline_id)
        {
            Some(mapping) => apply_mapped(&mut patch, ctx, mapping, value),
            None => match legacy_storage_for_key(key) {
                Some((location, stripped)) => {
                    apply_routed(&mut patch, ctx, location, stripped, value);
                }
                None => {
                    patch.unmapped.insert(key.clone(), value.clone());
                }
            },
        }
    }
    patch
}

fn apply_mapped(
    patch: &mut FieldPatch,
    ctx: &FieldContext<'_>,
    mapping: &FieldMapping,
    value: &Value,
) {
    let target_key = de_prefixed_key(&mapping.field_key).to_string();
    if ctx.is_locked(&mapping.field_key) || ctx.is_locked(&target_key) {
        patch.skipped.push(SkippedField {
            key: target_key,
            reason: SkipReason::Locked,
        });
        return;
    }
    if mapping.storage_location == StorageLocation::Column {
        let column = mapping
            .db_column_name
            .clone()
            .unwrap_or_else(|| target_key.clone());
        if ctx.is_locked(&column) {
            patch.skipped.push(SkippedField {
                key: column,
                reason: SkipReason::Locked,
            });
            return;
        }
        if !mapping.sync_always
            && existing_non_empty(ctx.existing, &column, Some(("marketing_data", &target_key)))
        {
            patch.skipped.push(SkippedField {
                key: column,
                reason: SkipReason::Protected,
            });
            return;
        }
        if is_empty_value(value) {
            patch.skipped.push(SkippedField {
                key: column,
                reason: SkipReason::Empty,
            });
            return;
        }
        patch.columns.insert(column, value.clone());
        return;
    }

    let bucket_name = mapping.storage_location.as_str();
    if !mapping.sync_always
        && existing_non_empty(ctx.existing, &target_key, Some((bucket_name, &target_key)))
    {
        patch.skipped.push(SkippedField {
            key: target_key,
            reason: SkipReason::Protected,
        });
        return;
    }
    if is_empty_value(value) {
        patch.skipped.push(SkippedField {
            key: target_key,
            reason: SkipReason::Empty,
        });
        return;
    }
    bucket_of(patch, mapping.storage_location).insert(target_key, value.clone());
}

/// Apply a value routed by the legacy prefix resolver. Legacy keys carry no
/// mapping row, so only the lock and empty-value rules apply.
fn apply_routed(
    patch: &mut FieldPatch,
    ctx: &FieldContext<'_>,
    location: StorageLocation,
    key: &str,
    value: &Value,
) {
    if ctx.is_locked(key) {
        patch.skipped.push(SkippedField {
            key: key.to_string(),
            reason: SkipReason::Locked,
        });
        return;
    }
    if is_empty_value(value) {
        patch.skipped.push(SkippedField {
            key: key.to_string(),
            reason: SkipReason::Empty,
        });
        return;
    }
    bucket_of(patch, location).insert(key.to_string(), value.clone());
}

fn bucket_of(patch: &mut FieldPatch, location: StorageLocation) -> &mut Map<String, Value> {
    match location {
        StorageLocation::ProdutoData => &mut patch.produto_data,
        StorageLocation::BriefingInicial => &mut patch.briefing_inicial,
        // Column routing is handled before this point; treat a stray column
        // location as marketing data rather than dropping the value.
        StorageLocation::MarketingData | StorageLocation::Column => &mut patch.marketing_data,
    }
}
