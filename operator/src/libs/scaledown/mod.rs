//! The engine deciding which nodes are safe to remove and draining them

mod candidates;
mod drain;
mod engine;
mod simulate;
mod utilization;

pub use candidates::{pods_by_node, Candidate};
pub use engine::ScaleDownEngine;
pub use simulate::{simulate, Blocked, Constraint, SimNode};
pub use utilization::{collect, KubeMetrics, NodeUsage, Sample, UtilizationCache, UtilizationSource};
