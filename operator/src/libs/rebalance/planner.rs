//! Turns rebalance candidates into ordered batches with a rollback plan

use vpsie_autoscaler::conf::RebalanceStrategy;

use super::analyzer::RebalanceCandidate;

/// What a batch does to the nodes it names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp {
    /// Provision a replacement, drain the original, terminate it
    Replace,
    /// Provision replacements only
    Provision,
    /// Cordon the originals without draining them yet
    Cordon,
    /// Drain the originals and terminate them
    DrainAndTerminate,
}

/// One ordered step of a rebalance plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBatch {
    /// What this batch does
    pub op: BatchOp,
    /// The candidate nodes this batch covers
    pub nodes: Vec<String>,
}

/// The ordered steps taken when a plan is abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStep {
    /// Stop executing further batches
    Pause,
    /// Uncordon originals that were cordoned but not terminated
    UncordonOriginals,
    /// Terminate replacements that never took over
    TerminateOrphans,
    /// Verify the cluster health threshold still holds
    VerifyHealth,
    /// Mark the plan failed in the report
    MarkFailed,
}

/// How to unwind a partially executed plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackPlan {
    /// The steps to run in order
    pub steps: Vec<RollbackStep>,
}

impl Default for RollbackPlan {
    fn default() -> Self {
        RollbackPlan {
            steps: vec![
                RollbackStep::Pause,
                RollbackStep::UncordonOriginals,
                RollbackStep::TerminateOrphans,
                RollbackStep::VerifyHealth,
                RollbackStep::MarkFailed,
            ],
        }
    }
}

/// A full rebalance plan for one group
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    /// The group this plan replaces nodes in
    pub group: String,
    /// The candidates keyed into the batches by node name
    pub candidates: Vec<RebalanceCandidate>,
    /// The ordered batches to execute
    pub batches: Vec<NodeBatch>,
    /// How to unwind when a batch fails
    pub rollback: RollbackPlan,
}

/// How many nodes the widest batch of a strategy touches at once
///
/// # Arguments
///
/// * `strategy` - The replacement strategy
/// * `batch_size` - The configured rolling batch size
/// * `candidates` - How many candidates the plan covers
pub fn widest_batch(strategy: RebalanceStrategy, batch_size: usize, candidates: usize) -> usize {
    match strategy {
        RebalanceStrategy::Rolling => batch_size.max(1).min(candidates),
        // surge and blue-green touch the full set at once
        RebalanceStrategy::Surge | RebalanceStrategy::BlueGreen => candidates,
    }
}

/// Produce the ordered batches for a strategy
///
/// # Arguments
///
/// * `group` - The group the plan belongs to
/// * `candidates` - The candidates to replace
/// * `strategy` - The replacement strategy
/// * `batch_size` - The rolling batch size
pub fn plan(
    group: &str,
    candidates: Vec<RebalanceCandidate>,
    strategy: RebalanceStrategy,
    batch_size: usize,
) -> RebalancePlan {
    let names: Vec<String> = candidates
        .iter()
        .map(|candidate| candidate.node.clone())
        .collect();
    let batches = match strategy {
        // strictly sequential replacement, the safe default
        RebalanceStrategy::Rolling => names
            .chunks(batch_size.max(1))
            .map(|chunk| NodeBatch {
                op: BatchOp::Replace,
                nodes: chunk.to_vec(),
            })
            .collect(),
        // everything new first, then everything old out
        RebalanceStrategy::Surge => vec![
            NodeBatch {
                op: BatchOp::Provision,
                nodes: names.clone(),
            },
            NodeBatch {
                op: BatchOp::DrainAndTerminate,
                nodes: names,
            },
        ],
        // the green set comes up, blue is fenced off, then drained
        RebalanceStrategy::BlueGreen => vec![
            NodeBatch {
                op: BatchOp::Provision,
                nodes: names.clone(),
            },
            NodeBatch {
                op: BatchOp::Cordon,
                nodes: names.clone(),
            },
            NodeBatch {
                op: BatchOp::DrainAndTerminate,
                nodes: names,
            },
        ],
    };
    RebalancePlan {
        group: group.to_owned(),
        candidates,
        batches,
        rollback: RollbackPlan::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpsie_autoscaler::client::Offering;
    use vpsie_autoscaler::models::conversions::Requests;

    /// Build a candidate for a node name
    fn candidate(node: &str) -> RebalanceCandidate {
        RebalanceCandidate {
            node: node.to_owned(),
            current: Offering {
                id: "m2.large".to_owned(),
                price_hourly: 1.0,
                cpu: 8,
                memory_mb: 16384,
                disk_gb: 80,
            },
            target: Offering {
                id: "m2.small".to_owned(),
                price_hourly: 0.3,
                cpu: 2,
                memory_mb: 4096,
                disk_gb: 40,
            },
            footprint: Requests { cpu: 500, memory: 512 },
        }
    }

    #[test]
    fn rolling_replaces_one_batch_at_a_time() {
        let plan = plan(
            "pool-a",
            vec![candidate("n1"), candidate("n2"), candidate("n3")],
            RebalanceStrategy::Rolling,
            1,
        );
        assert_eq!(plan.batches.len(), 3);
        assert!(plan.batches.iter().all(|batch| batch.op == BatchOp::Replace));
        assert!(plan.batches.iter().all(|batch| batch.nodes.len() == 1));
    }

    #[test]
    fn surge_provisions_everything_before_draining() {
        let plan = plan(
            "pool-a",
            vec![candidate("n1"), candidate("n2")],
            RebalanceStrategy::Surge,
            1,
        );
        let ops: Vec<BatchOp> = plan.batches.iter().map(|batch| batch.op).collect();
        assert_eq!(ops, [BatchOp::Provision, BatchOp::DrainAndTerminate]);
        assert_eq!(plan.batches[0].nodes, ["n1", "n2"]);
    }

    #[test]
    fn blue_green_fences_blue_before_the_drain() {
        let plan = plan(
            "pool-a",
            vec![candidate("n1"), candidate("n2")],
            RebalanceStrategy::BlueGreen,
            1,
        );
        let ops: Vec<BatchOp> = plan.batches.iter().map(|batch| batch.op).collect();
        assert_eq!(
            ops,
            [BatchOp::Provision, BatchOp::Cordon, BatchOp::DrainAndTerminate]
        );
    }

    #[test]
    fn rollback_steps_run_in_a_fixed_order() {
        let rollback = RollbackPlan::default();
        assert_eq!(
            rollback.steps,
            [
                RollbackStep::Pause,
                RollbackStep::UncordonOriginals,
                RollbackStep::TerminateOrphans,
                RollbackStep::VerifyHealth,
                RollbackStep::MarkFailed,
            ]
        );
    }

    #[test]
    fn widest_batch_tracks_the_strategy() {
        assert_eq!(widest_batch(RebalanceStrategy::Rolling, 2, 5), 2);
        assert_eq!(widest_batch(RebalanceStrategy::Rolling, 2, 1), 1);
        assert_eq!(widest_batch(RebalanceStrategy::Surge, 1, 5), 5);
        assert_eq!(widest_batch(RebalanceStrategy::BlueGreen, 1, 4), 4);
    }
}
