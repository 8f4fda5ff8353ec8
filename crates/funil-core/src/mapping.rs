use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a mapped field value lands on the card/contact record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLocation {
    Column,
    ProdutoData,
    MarketingData,
    BriefingInicial,
}

impl StorageLocation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Column => "column",
            Self::ProdutoData => "produto_data",
            Self::MarketingData => "marketing_data",
            Self::BriefingInicial => "briefing_inicial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingEntity {
    Deal,
    Contact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMapping {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub external_pipeline_id: String,
    pub external_stage_id: String,
    pub stage_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMapping {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub external_user_id: String,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub external_field_id: String,
    /// When set, the mapping only applies to events from this external
    /// pipeline. Unscoped mappings apply globally.
    #[serde(default)]
    pub external_pipeline_id: Option<String>,
    pub field_key: String,
    pub entity_type: MappingEntity,
    pub direction: MappingDirection,
    pub storage_location: StorageLocation,
    #[serde(default)]
    pub db_column_name: Option<String>,
    /// `false` protects an existing non-empty local value from overwrite.
    #[serde(default = "default_sync_always")]
    pub sync_always: bool,
}

const fn default_sync_always() -> bool {
    true
}

/// Mapping tables loaded once per invocation, keyed for O(1) lookup.
/// Outbound field mappings are dropped at build time; this processor only
/// consumes the inbound direction.
#[derive(Debug, Clone, Default)]
pub struct MappingIndex {
    stage_by_external: HashMap<(Uuid, String, String), Uuid>,
    user_by_external: HashMap<(Uuid, String), Uuid>,
    fields_by_external: HashMap<(Uuid, String), Vec<FieldMapping>>,
}

impl MappingIndex {
    pub fn new(
        stage_mappings: Vec<StageMapping>,
        user_mappings: Vec<UserMapping>,
        field_mappings: Vec<FieldMapping>,
    ) -> Self {
        let mut index = Self::default();
        for mapping in stage_mappings {
            index.stage_by_external.insert(
                (
                    mapping.integration_id,
                    mapping.external_pipeline_id,
                    mapping.external_stage_id,
                ),
                mapping.stage_id,
            );
        }
        for mapping in user_mappings {
            index
                .user_by_external
                .insert((mapping.integration_id, mapping.external_user_id), mapping.user_id);
        }
        for mapping in field_mappings {
            if mapping.direction != MappingDirection::Inbound {
                continue;
            }
            index
                .fields_by_external
                .entry((mapping.integration_id, mapping.external_field_id.clone()))
                .or_default()
                .push(mapping);
        }
        index
    }

    pub fn stage_for(
        &self,
        integration_id: Uuid,
        external_pipeline_id: &str,
        external_stage_id: &str,
    ) -> Option<Uuid> {
        self.stage_by_external
            .get(&(
                integration_id,
                external_pipeline_id.to_string(),
                external_stage_id.to_string(),
            ))
            .copied()
    }

    pub fn user_for(&self, integration_id: Uuid, external_user_id: &str) -> Option<Uuid> {
        self.user_by_external
            .get(&(integration_id, external_user_id.to_string()))
            .copied()
    }

    /// Resolve the field mapping for an external field. A mapping scoped to
    /// the event's pipeline wins over an unscoped one; a mapping scoped to a
    /// different pipeline never applies.
    pub fn field_for(
        &self,
        integration_id: Uuid,
        external_field_id: &str,
        entity: MappingEntity,
        external_pipeline_id: Option<&str>,
    ) -> Option<&FieldMapping> {
        let candidates = self
            .fields_by_external
            .get(&(integration_id, external_field_id.to_string()))?;
        let mut global = None;
        for mapping in candidates {
            if mapping.entity_type != entity {
                continue;
            }
            match (mapping.external_pipeline_id.as_deref(), external_pipeline_id) {
                (Some(scope), Some(pipeline)) if scope == pipeline => return Some(mapping),
                (Some(_), _) => {}
                (None, _) => global = global.or(Some(mapping)),
            }
        }
        global
    }
}
