use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stages without a linked phase sort after every linked phase so they can
/// never block an inbound move by accident.
pub const UNLINKED_PHASE_ORDER: i32 = i32::MAX;

/// Role grouping of a stage. Decides which role-specific owner field an
/// inbound owner lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fase {
    #[serde(rename = "SDR")]
    Sdr,
    #[serde(rename = "Planner")]
    Planner,
    #[serde(rename = "Pós-venda")]
    PosVenda,
}

impl Fase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sdr => "SDR",
            Self::Planner => "Planner",
            Self::PosVenda => "Pós-venda",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub nome: String,
    #[serde(default)]
    pub produto: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub nome: String,
    #[serde(default)]
    pub fase: Option<Fase>,
    #[serde(default)]
    pub is_won: bool,
    #[serde(default)]
    pub is_lost: bool,
    #[serde(default)]
    pub ordem: i32,
    #[serde(default)]
    pub phase_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelinePhase {
    pub id: Uuid,
    pub order_index: i32,
}

/// Position of a stage in the funnel's total order. Derived `Ord` compares
/// `phase_order` first, then `ordem`, which is exactly the regression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StageRank {
    pub phase_order: i32,
    pub ordem: i32,
}

/// Pipeline topology loaded once per invocation and shared read-only across
/// the batch, with O(1) lookups instead of repeated scans.
#[derive(Debug, Clone, Default)]
pub struct TopologyIndex {
    pipelines: HashMap<Uuid, Pipeline>,
    stages: HashMap<Uuid, PipelineStage>,
    phases: HashMap<Uuid, PipelinePhase>,
}

impl TopologyIndex {
    pub fn new(
        pipelines: Vec<Pipeline>,
        stages: Vec<PipelineStage>,
        phases: Vec<PipelinePhase>,
    ) -> Self {
        Self {
            pipelines: pipelines.into_iter().map(|p| (p.id, p)).collect(),
            stages: stages.into_iter().map(|s| (s.id, s)).collect(),
            phases: phases.into_iter().map(|p| (p.id, p)).collect(),
        }
    }

    pub fn stage(&self, stage_id: Uuid) -> Option<&PipelineStage> {
        self.stages.get(&stage_id)
    }

    pub fn pipeline(&self, pipeline_id: Uuid) -> Option<&Pipeline> {
        self.pipelines.get(&pipeline_id)
    }

    pub fn pipeline_of_stage(&self, stage_id: Uuid) -> Option<&Pipeline> {
        self.stage(stage_id)
            .and_then(|stage| self.pipelines.get(&stage.pipeline_id))
    }

    pub fn rank(&self, stage_id: Uuid) -> Option<StageRank> {
        let stage = self.stage(stage_id)?;
        let phase_order = stage
            .phase_id
            .and_then(|phase_id| self.phases.get(&phase_id))
            .map_or(UNLINKED_PHASE_ORDER, |phase| phase.order_index);
        Some(StageRank {
            phase_order,
            ordem: stage.ordem,
        })
    }

    /// Won and lost stages terminate the funnel; inbound events must not move
    /// a card off them.
    pub fn is_terminal(&self, stage_id: Uuid) -> bool {
        self.stage(stage_id)
            .is_some_and(|stage| stage.is_won || stage.is_lost)
    }

    /// The designated lost stage of a pipeline. Lowest `ordem` wins if a
    /// pipeline carries more than one.
    pub fn lost_stage_for_pipeline(&self, pipeline_id: Uuid) -> Option<Uuid> {
        self.stages
            .values()
            .filter(|stage| stage.pipeline_id == pipeline_id && stage.is_lost)
            .min_by_key(|stage| stage.ordem)
            .map(|stage| stage.id)
    }

    /// The entry stage of a pipeline: its lowest-ranked non-terminal stage.
    pub fn entry_stage_for_pipeline(&self, pipeline_id: Uuid) -> Option<Uuid> {
        self.stages
            .values()
            .filter(|stage| {
                stage.pipeline_id == pipeline_id && !stage.is_won && !stage.is_lost
            })
            .min_by_key(|stage| (self.rank(stage.id), stage.id))
            .map(|stage| stage.id)
    }

    /// Whether moving from `current` to `target` would regress the card.
    /// Terminal current stages never move; otherwise the target must not rank
    /// strictly below the current stage. Unknown stages cannot be judged and
    /// are not treated as regressions.
    pub fn would_regress(&self, current: Uuid, target: Uuid) -> bool {
        if current == target {
            return false;
        }
        if self.is_terminal(current) {
            return true;
        }
        match (self.rank(current), self.rank(target)) {
            (Some(current_rank), Some(target_rank)) => target_rank < current_rank,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn topology() -> TopologyIndex {
        let pipeline = Pipeline {
            id: uuid(1),
            nome: "Comercial".to_string(),
            produto: Some("consultoria".to_string()),
        };
        let phases = vec![
            PipelinePhase {
                id: uuid(10),
                order_index: 1,
            },
            PipelinePhase {
                id: uuid(11),
                order_index: 2,
            },
        ];
        let stage = |id: u128, ordem: i32, phase: Option<u128>, won: bool, lost: bool| {
            PipelineStage {
                id: uuid(id),
                pipeline_id: uuid(1),
                nome: format!("stage-{id}"),
                fase: Some(Fase::Sdr),
                is_won: won,
                is_lost: lost,
                ordem,
                phase_id: phase.map(uuid),
            }
        };
        TopologyIndex::new(
            vec![pipeline],
            vec![
                stage(100, 1, Some(10), false, false),
                stage(101, 2, Some(10), false, false),
                stage(102, 1, Some(11), false, false),
                stage(103, 9, Some(11), true, false),
                stage(104, 10, Some(11), false, true),
                stage(105, 1, None, false, false),
            ],
            phases,
        )
    }

    #[test]
    fn rank_orders_by_phase_then_ordem() {
        let topo = topology();
        let early = topo.rank(uuid(101)).expect("rank");
        let later = topo.rank(uuid(102)).expect("rank");
        assert!(early < later, "phase order dominates ordem");
    }

    #[test]
    fn unlinked_phase_sorts_last() {
        let topo = topology();
        let unlinked = topo.rank(uuid(105)).expect("rank");
        assert_eq!(unlinked.phase_order, UNLINKED_PHASE_ORDER);
        assert!(topo.rank(uuid(103)).expect("rank") < unlinked);
    }

    #[test]
    fn terminal_stages_never_move() {
        let topo = topology();
        assert!(topo.would_regress(uuid(103), uuid(104)));
        assert!(topo.would_regress(uuid(104), uuid(100)));
    }

    #[test]
    fn backward_moves_are_regressions_forward_moves_are_not() {
        let topo = topology();
        assert!(topo.would_regress(uuid(102), uuid(101)));
        assert!(!topo.would_regress(uuid(100), uuid(101)));
        assert!(!topo.would_regress(uuid(101), uuid(101)));
    }

    #[test]
    fn lost_stage_lookup_prefers_lowest_ordem() {
        let topo = topology();
        assert_eq!(topo.lost_stage_for_pipeline(uuid(1)), Some(uuid(104)));
        assert_eq!(topo.lost_stage_for_pipeline(uuid(99)), None);
    }

    #[test]
    fn entry_stage_is_lowest_ranked_non_terminal() {
        let topo = topology();
        assert_eq!(topo.entry_stage_for_pipeline(uuid(1)), Some(uuid(100)));
        assert_eq!(topo.entry_stage_for_pipeline(uuid(99)), None);
    }
}
