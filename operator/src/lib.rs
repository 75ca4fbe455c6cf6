//! The VPSie cluster autoscaler control plane
//!
//! Exposed as a library so integration tests can drive the reconcilers and
//! engines directly.

#[macro_use]
extern crate serde_derive;

pub mod args;
pub mod libs;
