//! A mock VPSie provider for exercising the autoscaler without a real API

use async_trait::async_trait;
use chrono::prelude::*;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::{
    Error, Offering, VmCreateRequest, VmStatus, VmSummary, VpsieNodeGroup, VpsieNodeGroupRequest,
    VpsieProvider,
};

/// Build a running VM summary for tests
///
/// # Arguments
///
/// * `id` - The VM id to set
/// * `hostname` - The hostname to set
/// * `ip` - The ip to set
pub fn running_vm(id: i64, hostname: &str, ip: &str) -> VmSummary {
    VmSummary {
        id,
        hostname: hostname.to_owned(),
        ip: Some(ip.to_owned()),
        status: VmStatus::Running,
        created_at: Utc::now(),
    }
}

/// The mutable state behind the mock
#[derive(Default)]
struct MockState {
    /// The VMs the mock currently knows about
    vms: Vec<VmSummary>,
    /// The provider side node groups the mock currently knows about
    groups: Vec<VpsieNodeGroup>,
    /// The offerings the mock serves
    offerings: Vec<Offering>,
    /// The next id to assign
    next_id: i64,
    /// Whether creates are accepted without returning an id
    async_create: bool,
    /// How many upcoming creates should fail with a transient error
    fail_creates: u32,
    /// How many creates have been attempted
    create_calls: u32,
    /// Every VM id a delete was issued for
    delete_calls: Vec<i64>,
    /// How many credential refreshes have been requested
    refreshes: u32,
}

/// A VPSie provider that runs entirely in memory
#[derive(Default)]
pub struct MockVpsie {
    /// The state of this mock
    state: Mutex<MockState>,
}

impl MockVpsie {
    /// Build an empty mock
    pub fn new() -> Self {
        MockVpsie::default()
    }

    /// Make upcoming creates return success without an id
    pub async fn set_async_create(&self, on: bool) {
        self.state.lock().await.async_create = on;
    }

    /// Make the next N creates fail with a transient error
    ///
    /// # Arguments
    ///
    /// * `count` - How many creates should fail
    pub async fn fail_next_creates(&self, count: u32) {
        self.state.lock().await.fail_creates = count;
    }

    /// Add a VM the mock should list
    ///
    /// # Arguments
    ///
    /// * `vm` - The VM to add
    pub async fn push_vm(&self, vm: VmSummary) {
        self.state.lock().await.vms.push(vm);
    }

    /// Add an offering the mock should serve
    ///
    /// # Arguments
    ///
    /// * `offering` - The offering to add
    pub async fn push_offering(&self, offering: Offering) {
        self.state.lock().await.offerings.push(offering);
    }

    /// Add a provider side node group the mock should list
    ///
    /// # Arguments
    ///
    /// * `group` - The group to add
    pub async fn push_group(&self, group: VpsieNodeGroup) {
        self.state.lock().await.groups.push(group);
    }

    /// Get how many creates have been attempted
    pub async fn create_calls(&self) -> u32 {
        self.state.lock().await.create_calls
    }

    /// Get every VM id a delete was issued for
    pub async fn delete_calls(&self) -> Vec<i64> {
        self.state.lock().await.delete_calls.clone()
    }

    /// Get how many credential refreshes have been requested
    pub async fn refreshes(&self) -> u32 {
        self.state.lock().await.refreshes
    }
}

#[async_trait]
impl VpsieProvider for MockVpsie {
    /// List all VMs the mock knows about
    async fn list_vms(&self, _ctx: &CancellationToken) -> Result<Vec<VmSummary>, Error> {
        Ok(self.state.lock().await.vms.clone())
    }

    /// Create a VM in memory
    async fn create_vm(
        &self,
        _ctx: &CancellationToken,
        req: &VmCreateRequest,
    ) -> Result<Option<i64>, Error> {
        let mut state = self.state.lock().await;
        state.create_calls += 1;
        // burn through any injected failures first
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(Error::Vpsie {
                code: StatusCode::SERVICE_UNAVAILABLE,
                msg: Some("injected create failure".to_owned()),
            });
        }
        // async mode accepts the request without assigning an id
        if state.async_create {
            return Ok(None);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.vms.push(VmSummary {
            id,
            hostname: req.hostname.clone(),
            ip: Some(format!("10.0.0.{}", id)),
            status: VmStatus::Running,
            created_at: Utc::now(),
        });
        Ok(Some(id))
    }

    /// Delete a VM in memory
    async fn delete_vm(&self, _ctx: &CancellationToken, id: i64) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.delete_calls.push(id);
        // deleting an already gone VM still succeeds
        state.vms.retain(|vm| vm.id != id);
        Ok(())
    }

    /// Get a single offering
    async fn get_offering(&self, _ctx: &CancellationToken, id: &str) -> Result<Offering, Error> {
        let state = self.state.lock().await;
        state
            .offerings
            .iter()
            .find(|offering| offering.id == id)
            .cloned()
            .ok_or(Error::Vpsie {
                code: StatusCode::NOT_FOUND,
                msg: Some(format!("no offering {id}")),
            })
    }

    /// List all offerings
    async fn list_offerings(&self, _ctx: &CancellationToken) -> Result<Vec<Offering>, Error> {
        Ok(self.state.lock().await.offerings.clone())
    }

    /// List the provider side node groups
    async fn list_k8s_groups(
        &self,
        _ctx: &CancellationToken,
        _resource_identifier: &str,
    ) -> Result<Vec<VpsieNodeGroup>, Error> {
        Ok(self.state.lock().await.groups.clone())
    }

    /// Create a provider side node group in memory
    async fn create_k8s_group(
        &self,
        _ctx: &CancellationToken,
        req: &VpsieNodeGroupRequest,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.groups.push(VpsieNodeGroup {
            id,
            name: req.name.clone(),
            node_count: 0,
        });
        Ok(())
    }

    /// Count a credential refresh
    async fn refresh_credentials(&self, _ctx: &CancellationToken) -> Result<(), Error> {
        self.state.lock().await.refreshes += 1;
        Ok(())
    }
}
