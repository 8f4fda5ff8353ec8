//! Domain model and pure decision logic for the Funil inbound integration
//! processor. Everything here is I/O-free: the service crate loads state
//! through `funil-store` and threads it into these functions.

pub mod conflict;
pub mod contact;
pub mod deal;
pub mod event;
pub mod fields;
pub mod mapping;
pub mod mode;
pub mod origin;
pub mod phone;
pub mod retry;
pub mod topology;
pub mod trigger;

pub use conflict::{ConflictLogEntry, ConflictResolution, ValidationOutcome};
pub use contact::{Contact, ContactPatch};
pub use deal::{Card, CardPatch, StatusComercial};
pub use event::{EntityType, EventStatus, EventType, IntegrationEvent};
pub use fields::FieldPatch;
pub use mapping::{FieldMapping, MappingIndex, StageMapping, StorageLocation, UserMapping};
pub use mode::RunMode;
pub use retry::ProcessError;
pub use topology::{Fase, Pipeline, PipelinePhase, PipelineStage, StageRank, TopologyIndex};
pub use trigger::{ActionType, InboundTrigger, QuarantineMode, TriggerDecision, ValidationLevel};
