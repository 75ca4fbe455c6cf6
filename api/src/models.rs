//! Wrappers for all objects within the autoscaler

pub mod conditions;
pub mod conversions;
pub mod instances;
pub mod labels;
pub mod nodegroups;

pub use conditions::{ConditionKind, NodeGroupCondition};
pub use instances::{
    InstanceError, InstancePhase, InstanceResources, VPSInstance, VPSInstanceSpec,
    VPSInstanceStatus,
};
pub use nodegroups::{
    InstanceSummary, NodeGroup, NodeGroupSpec, NodeGroupStatus, ScaleDownPolicy,
};
