//! The capability interface the autoscaler consumes VPSie through
//!
//! The core never touches a concrete client. Everything that provisions or
//! tears down VMs takes an `Arc<dyn VpsieProvider>` so tests can swap in the
//! mock from `test_utilities`.

use async_trait::async_trait;
use chrono::prelude::*;
use tokio_util::sync::CancellationToken;

use super::Error;

/// The lifecycle status VPSie reports for a VM
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// The VM is being built
    Creating,
    /// The VM is up
    Running,
    /// The VM is stopped
    Stopped,
    /// The VM is being torn down
    Deleting,
    /// VPSie reported a status we do not track
    #[serde(other)]
    Unknown,
}

/// A VM as listed by VPSie
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VmSummary {
    /// The numeric id of this VM
    pub id: i64,
    /// The hostname assigned to this VM
    pub hostname: String,
    /// The primary IP of this VM if assigned
    #[serde(default)]
    pub ip: Option<String>,
    /// The lifecycle status of this VM
    pub status: VmStatus,
    /// When this VM was created
    pub created_at: DateTime<Utc>,
}

/// A request to create a VM
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VmCreateRequest {
    /// The hostname to assign
    pub hostname: String,
    /// The offering to provision
    pub offering_id: String,
    /// The datacenter to provision in
    pub datacenter_id: String,
    /// The cluster this VM joins
    pub resource_identifier: String,
    /// The OS image to install
    #[serde(default)]
    pub os_image_id: Option<String>,
    /// The Kubernetes version to install
    pub kubernetes_version: String,
    /// The ssh keys to authorize
    #[serde(default)]
    pub ssh_key_ids: Vec<String>,
    /// The provider side node group to attach to
    pub vpsie_group_id: i64,
    /// The project to bill against if any
    #[serde(default)]
    pub project: Option<String>,
}

/// An instance offering with its specs and hourly price
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Offering {
    /// The id of this offering
    pub id: String,
    /// The hourly price of this offering
    pub price_hourly: f64,
    /// The number of cpu cores
    pub cpu: i64,
    /// The amount of memory in mebibytes
    pub memory_mb: i64,
    /// The amount of disk in gigabytes
    pub disk_gb: i64,
}

/// A provider side Kubernetes node group
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VpsieNodeGroup {
    /// The numeric id of this group
    pub id: i64,
    /// The name of this group
    pub name: String,
    /// How many nodes VPSie counts in this group
    #[serde(default)]
    pub node_count: i32,
}

/// A request to create a provider side Kubernetes node group
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VpsieNodeGroupRequest {
    /// The name of the group to create
    pub name: String,
    /// The cluster this group belongs to
    pub resource_identifier: String,
    /// The VPSie package id sizing nodes in this group
    pub kube_size_id: String,
    /// The datacenter this group provisions in
    pub datacenter_id: String,
}

/// The VPSie capabilities the autoscaler consumes
///
/// Every call takes a cancellation token so shutdown and leader loss stop
/// in flight work at the next suspension point. Errors are classified with
/// [`Error::is_transient`] so callers know whether to back off or give up.
#[async_trait]
pub trait VpsieProvider: Send + Sync {
    /// List all VMs visible to these credentials
    async fn list_vms(&self, ctx: &CancellationToken) -> Result<Vec<VmSummary>, Error>;

    /// Request a new VM
    ///
    /// Returns the VM id when VPSie assigns one synchronously. `None` means
    /// the request was accepted asynchronously and the VM must be resolved by
    /// discovery later.
    async fn create_vm(
        &self,
        ctx: &CancellationToken,
        req: &VmCreateRequest,
    ) -> Result<Option<i64>, Error>;

    /// Delete a VM by id
    ///
    /// Deleting a VM that is already gone succeeds.
    async fn delete_vm(&self, ctx: &CancellationToken, id: i64) -> Result<(), Error>;

    /// Get a single offering with its specs and pricing
    async fn get_offering(&self, ctx: &CancellationToken, id: &str) -> Result<Offering, Error>;

    /// List all offerings with their specs and pricing
    async fn list_offerings(&self, ctx: &CancellationToken) -> Result<Vec<Offering>, Error>;

    /// List the provider side Kubernetes node groups of a cluster
    async fn list_k8s_groups(
        &self,
        ctx: &CancellationToken,
        resource_identifier: &str,
    ) -> Result<Vec<VpsieNodeGroup>, Error>;

    /// Create a provider side Kubernetes node group
    async fn create_k8s_group(
        &self,
        ctx: &CancellationToken,
        req: &VpsieNodeGroupRequest,
    ) -> Result<(), Error>;

    /// Reauthenticate after a credential rotation
    async fn refresh_credentials(&self, ctx: &CancellationToken) -> Result<(), Error>;
}
