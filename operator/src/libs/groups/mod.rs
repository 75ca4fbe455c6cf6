//! The pool level reconciler for node groups

pub mod capacity;
pub mod reconcile;

pub use reconcile::{error_policy, reconcile};
