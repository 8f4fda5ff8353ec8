//! Outcome recorder: folds each event's processing result into a terminal
//! status update, scheduling retries for transient failures.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use funil_core::retry::{MAX_ATTEMPTS, ProcessError, retry_delay};
use funil_core::{EventStatus, IntegrationEvent};
use funil_store::{EventOutcome, IntegrationStore};

use crate::processor::BatchStats;

/// What the pipeline decided for one event. Errors travel separately as
/// [`ProcessError`].
#[derive(Debug)]
pub enum Disposition {
    /// Entity writes landed.
    Written { detail: String },
    /// Shadow mode: everything resolved, no writes issued.
    Shadow { detail: String },
    /// Entity or event type outside this deployment's processing scope.
    OutOfScope { detail: String },
    /// The trigger allowlist had no matching rule.
    TriggerBlocked { detail: String },
    /// The quality gate rejected the write.
    GateBlocked { detail: String },
}

#[derive(Debug, Serialize)]
pub struct EventResult {
    pub event_id: Uuid,
    pub status: EventStatus,
    pub detail: String,
}

/// Persist the outcome for one event and update the batch stats. A failed
/// outcome write is counted as an error but never aborts the batch.
pub async fn record(
    store: &Arc<dyn IntegrationStore>,
    event: &IntegrationEvent,
    result: Result<Disposition, ProcessError>,
    run_log: String,
    matched_trigger_id: Option<Uuid>,
    stats: &mut BatchStats,
) -> EventResult {
    let now = Utc::now();
    let run_number = event.attempts + 1;
    let mut attempts = event.attempts;
    let mut next_retry_at = None;
    let mut processed_at = Some(now);

    let (status, detail) = match result {
        Ok(Disposition::Written { detail }) => {
            stats.eligible += 1;
            stats.updated += 1;
            (EventStatus::Processed, detail)
        }
        Ok(Disposition::Shadow { detail }) => {
            stats.eligible += 1;
            stats.processed_shadow += 1;
            (EventStatus::ProcessedShadow, detail)
        }
        Ok(Disposition::OutOfScope { detail }) => {
            stats.ignored += 1;
            (EventStatus::Ignored, detail)
        }
        Ok(Disposition::TriggerBlocked { detail }) => {
            stats.eligible += 1;
            stats.ignored += 1;
            stats.ignored_by_trigger += 1;
            (EventStatus::Ignored, detail)
        }
        Ok(Disposition::GateBlocked { detail }) => {
            stats.eligible += 1;
            stats.blocked += 1;
            (EventStatus::Blocked, detail)
        }
        Err(error) => {
            stats.eligible += 1;
            stats.errors += 1;
            attempts += 1;
            // An event that already reached a processed status never drops
            // back into the pending queue; a failed reprocess is terminal.
            let already_settled = matches!(
                event.status,
                EventStatus::Processed | EventStatus::ProcessedShadow
            );
            let terminal = already_settled || error.is_permanent() || attempts >= MAX_ATTEMPTS;
            if terminal {
                (EventStatus::Failed, error.to_string())
            } else {
                next_retry_at = Some(now + retry_delay(attempts));
                processed_at = None;
                (EventStatus::Pending, format!("{error} (will retry)"))
            }
        }
    };

    let processing_log = append_log(&event.processing_log, run_number, &run_log, &detail);
    let outcome = EventOutcome {
        status,
        processing_log,
        attempts,
        next_retry_at,
        matched_trigger_id: matched_trigger_id.or(event.matched_trigger_id),
        processed_at,
    };
    if let Err(error) = store.record_event_outcome(event.id, outcome).await {
        tracing::error!(event_id = %event.id, %error, "failed to record event outcome");
        stats.errors += 1;
    }

    EventResult {
        event_id: event.id,
        status,
        detail,
    }
}

/// Each invocation appends one line so retry history survives in the log.
fn append_log(previous: &str, run_number: i32, run_log: &str, detail: &str) -> String {
    let mut line = format!("[attempt {run_number}] {detail}");
    if !run_log.is_empty() {
        line.push_str(" :: ");
        line.push_str(run_log);
    }
    if previous.is_empty() {
        line
    } else {
        format!("{previous}\n{line}")
    }
}
