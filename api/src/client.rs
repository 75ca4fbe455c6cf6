//! The typed error and clients for the VPSie API

mod error;
mod traits;
mod vpsie;

pub use error::Error;
pub use traits::{
    Offering, VmCreateRequest, VmStatus, VmSummary, VpsieNodeGroup, VpsieNodeGroupRequest,
    VpsieProvider,
};
pub use vpsie::Vpsie;
