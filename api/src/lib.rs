//! The VPSie autoscaler data model, config, and provider clients

#[macro_use]
extern crate serde_derive;

pub mod client;
pub mod conf;
pub mod models;

// expose test utilities if that feature is enabled
#[cfg(feature = "test-utilities")]
pub mod test_utilities;

pub use client::{Error, Vpsie, VpsieProvider};
pub use conf::Conf;
