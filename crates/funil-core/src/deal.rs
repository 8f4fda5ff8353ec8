use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::topology::Fase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusComercial {
    Aberto,
    Ganho,
    Perdido,
}

impl StatusComercial {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aberto => "aberto",
            Self::Ganho => "ganho",
            Self::Perdido => "perdido",
        }
    }
}

/// An internal sales-pipeline opportunity, mirrored from an external CRM
/// deal. The three nested buckets hold mapped custom fields; `locked_fields`
/// holds per-key user locks that no inbound write may cross.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub external_source: Option<String>,
    pub titulo: String,
    #[serde(default)]
    pub valor_estimado: Option<f64>,
    pub status_comercial: StatusComercial,
    #[serde(default)]
    pub pipeline_stage_id: Option<Uuid>,
    #[serde(default)]
    pub pipeline_id: Option<Uuid>,
    #[serde(default)]
    pub produto: Option<String>,
    #[serde(default)]
    pub dono_atual_id: Option<Uuid>,
    #[serde(default)]
    pub sdr_id: Option<Uuid>,
    #[serde(default)]
    pub planner_id: Option<Uuid>,
    #[serde(default)]
    pub posvenda_id: Option<Uuid>,
    #[serde(default)]
    pub contato_id: Option<Uuid>,
    #[serde(default)]
    pub origem: Option<String>,
    #[serde(default)]
    pub marketing_data: Map<String, Value>,
    #[serde(default)]
    pub produto_data: Map<String, Value>,
    #[serde(default)]
    pub briefing_inicial: Map<String, Value>,
    #[serde(default)]
    pub locked_fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Card {
    pub fn is_locked(&self, key: &str) -> bool {
        self.locked_fields.get(key) == Some(&Value::Bool(true))
    }
}

/// Partial card update. `None` fields are left untouched; bucket maps are
/// merged key-by-key into the stored buckets rather than replacing them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CardPatch {
    pub titulo: Option<String>,
    pub valor_estimado: Option<f64>,
    pub status_comercial: Option<StatusComercial>,
    pub pipeline_stage_id: Option<Uuid>,
    pub pipeline_id: Option<Uuid>,
    pub produto: Option<String>,
    pub dono_atual_id: Option<Uuid>,
    pub sdr_id: Option<Uuid>,
    pub planner_id: Option<Uuid>,
    pub posvenda_id: Option<Uuid>,
    pub contato_id: Option<Uuid>,
    pub origem: Option<String>,
    /// Mapped `storage_location = column` assignments, keyed by column name.
    pub columns: Map<String, Value>,
    pub marketing_data: Map<String, Value>,
    pub produto_data: Map<String, Value>,
    pub briefing_inicial: Map<String, Value>,
}

impl CardPatch {
    pub fn is_empty(&self) -> bool {
        self.titulo.is_none()
            && self.valor_estimado.is_none()
            && self.status_comercial.is_none()
            && self.pipeline_stage_id.is_none()
            && self.pipeline_id.is_none()
            && self.produto.is_none()
            && self.dono_atual_id.is_none()
            && self.sdr_id.is_none()
            && self.planner_id.is_none()
            && self.posvenda_id.is_none()
            && self.contato_id.is_none()
            && self.origem.is_none()
            && self.columns.is_empty()
            && self.marketing_data.is_empty()
            && self.produto_data.is_empty()
            && self.briefing_inicial.is_empty()
    }

    /// Route the resolved owner into the role field matching the target
    /// stage's fase. The three role fields are mutually exclusive per event.
    pub fn set_owner_for_fase(&mut self, owner_id: Uuid, fase: Option<Fase>) {
        self.dono_atual_id = Some(owner_id);
        match fase {
            Some(Fase::Sdr) => self.sdr_id = Some(owner_id),
            Some(Fase::Planner) => self.planner_id = Some(owner_id),
            Some(Fase::PosVenda) => self.posvenda_id = Some(owner_id),
            None => {}
        }
    }
}
