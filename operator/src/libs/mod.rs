//! The libraries backing the autoscaler operator

pub mod controller;
pub mod crds;
pub mod events;
pub mod groups;
pub mod instances;
pub mod k8s;
pub mod rebalance;
pub mod scaledown;
pub mod shared;
pub mod trace;

pub use shared::Shared;
