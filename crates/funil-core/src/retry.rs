//! Per-event error taxonomy and the retry/backoff schedule.
//!
//! Classification is carried by the error type itself, raised at the point
//! of failure — retry policy never inspects message text.

use chrono::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Transient failures are retried up to this many attempts; the final
/// attempt's failure is terminal.
pub const MAX_ATTEMPTS: i32 = 3;

const BASE_BACKOFF_MINUTES: i64 = 2;
const MAX_BACKOFF_MINUTES: i64 = 30;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// No stage mapping (nor fallback) covers the event's external
    /// (pipeline, stage) pair. Retrying cannot fix a missing mapping.
    #[error(
        "unmapped stage: external pipeline {external_pipeline_id:?}, stage {external_stage_id:?}"
    )]
    UnmappedStage {
        external_pipeline_id: Option<String>,
        external_stage_id: Option<String>,
    },

    /// A mapped stage points at topology that does not exist.
    #[error("unresolved topology: stage {stage_id} or its pipeline not found")]
    UnresolvedTopology { stage_id: Uuid },

    #[error("integration {integration_id} not found")]
    IntegrationNotFound { integration_id: Uuid },

    /// Card creation reached the writer without resolved topology.
    #[error("cannot create card without resolved pipeline/stage")]
    CreateWithoutTopology,

    /// A deal event whose payload never identifies the external deal.
    #[error("event payload carries no external deal id")]
    MissingExternalId,

    /// Anything else: network blips, transient write conflicts. Retried with
    /// exponential backoff.
    #[error("{0}")]
    Transient(String),
}

impl ProcessError {
    pub const fn is_permanent(&self) -> bool {
        !matches!(self, Self::Transient(_))
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::Transient(detail.into())
    }
}

/// Backoff before retry number `attempt + 1`, where `attempt` is the count
/// of failures so far (1-based): 2min, 8min, then capped at 30min.
pub fn retry_delay(attempt: i32) -> Duration {
    let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(0).min(8);
    let minutes = BASE_BACKOFF_MINUTES.saturating_mul(4i64.saturating_pow(exponent));
    Duration::minutes(minutes.min(MAX_BACKOFF_MINUTES))
}
