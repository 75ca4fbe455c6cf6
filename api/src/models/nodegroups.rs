//! The pool level custom resource the autoscaler scales

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube_derive::CustomResource;
use schemars::JsonSchema;

use super::conditions::NodeGroupCondition;
use super::instances::InstancePhase;
use crate::client::Error;

/// Helps serde default scale down to enabled
fn default_scale_down_enabled() -> bool {
    true
}

/// Helps serde default the scale down cooldown to 10 minutes
fn default_cooldown_seconds() -> u64 {
    600
}

/// Helps serde default the post scale up stabilization window to 10 minutes
fn default_stabilization_seconds() -> u64 {
    600
}

/// The scale down policy of a node group
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleDownPolicy {
    /// Whether utilization based scale down is enabled for this group
    #[serde(default = "default_scale_down_enabled")]
    pub enabled: bool,
    /// How long after a scale down before another may run in seconds
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// How long after a scale up before a scale down may run in seconds
    #[serde(default = "default_stabilization_seconds")]
    pub stabilization_seconds: u64,
}

impl Default for ScaleDownPolicy {
    fn default() -> Self {
        ScaleDownPolicy {
            enabled: default_scale_down_enabled(),
            cooldown_seconds: default_cooldown_seconds(),
            stabilization_seconds: default_stabilization_seconds(),
        }
    }
}

/// NodeGroup CRD definition
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "autoscaler.vpsie.com",
    version = "v1alpha1",
    kind = "NodeGroup",
    plural = "nodegroups",
    shortname = "ng",
    status = "NodeGroupStatus",
    namespaced,
    doc = "Custom resource representing a scalable pool of VPSie backed workers"
)]
#[kube(printcolumn = "{\"jsonPath\": \".spec.minNodes\", \"name\": \"MIN\", \"type\": \"integer\"}")]
#[kube(printcolumn = "{\"jsonPath\": \".spec.maxNodes\", \"name\": \"MAX\", \"type\": \"integer\"}")]
#[kube(printcolumn = "{\"jsonPath\": \".status.currentNodes\", \"name\": \"CURRENT\", \"type\": \"integer\"}")]
#[kube(printcolumn = "{\"jsonPath\": \".status.readyNodes\", \"name\": \"READY\", \"type\": \"integer\"}")]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    /// The smallest number of nodes this group may hold
    pub min_nodes: i32,
    /// The largest number of nodes this group may hold
    pub max_nodes: i32,
    /// The instance offerings this group may provision from
    pub offering_ids: Vec<String>,
    /// The offering to prefer when several fit
    #[serde(default)]
    pub preferred_instance_type: Option<String>,
    /// The datacenter to provision in
    pub datacenter_id: String,
    /// The VPSie side cluster identifier
    pub resource_identifier: String,
    /// The OS image to provision with
    #[serde(default)]
    pub os_image_id: Option<String>,
    /// The Kubernetes version to install (vX.Y.Z)
    pub kubernetes_version: String,
    /// The VPSie package id used when creating the provider side group
    pub kube_size_id: String,
    /// The ssh keys to authorize on new VMs
    #[serde(default)]
    pub ssh_key_ids: Vec<String>,
    /// The scale down policy for this group
    #[serde(default)]
    pub scale_down_policy: ScaleDownPolicy,
    /// How many instances to create per scale up step
    ///
    /// Parsed for forward compatibility. Creation is sequential today.
    #[serde(default)]
    pub scale_up_batch_size: Option<i32>,
}

/// A one line summary of an owned instance
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    /// The name of the instance
    pub name: String,
    /// The current phase of the instance
    pub phase: InstancePhase,
    /// The numeric VPSie VM id (0 until discovered)
    pub vpsie_instance_id: i64,
    /// The Kubernetes node bound to the instance if any
    #[serde(default)]
    pub node_name: Option<String>,
}

/// The status of a NodeGroup
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    /// How many live instances this group owns
    #[serde(default)]
    pub current_nodes: i32,
    /// How many instances this group is driving toward
    #[serde(default)]
    pub desired_nodes: i32,
    /// How many owned instances are Ready
    #[serde(default)]
    pub ready_nodes: i32,
    /// The numeric id of the provider side node group (0 until created)
    #[serde(default)]
    pub vpsie_group_id: i64,
    /// When this group last scaled in either direction
    #[serde(default)]
    pub last_scale_time: Option<Time>,
    /// When this group last scaled up
    #[serde(default)]
    pub last_scale_up_time: Option<Time>,
    /// When this group last scaled down
    #[serde(default)]
    pub last_scale_down_time: Option<Time>,
    /// The generation last acted on
    #[serde(default)]
    pub observed_generation: i64,
    /// A summary of every owned instance
    #[serde(default)]
    pub instances: Vec<InstanceSummary>,
    /// The conditions of this group
    #[serde(default)]
    pub conditions: Vec<NodeGroupCondition>,
}

impl NodeGroupSpec {
    /// Validate the invariants user input must hold
    ///
    /// Violations are terminal for the current generation. The reconciler
    /// surfaces them as an Error condition and refuses to scale until the
    /// spec is edited.
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_nodes < 0 {
            return Err(Error::Validation(format!(
                "minNodes must not be negative: {}",
                self.min_nodes
            )));
        }
        if self.max_nodes < 1 {
            return Err(Error::Validation(format!(
                "maxNodes must be at least 1: {}",
                self.max_nodes
            )));
        }
        if self.min_nodes > self.max_nodes {
            return Err(Error::Validation(format!(
                "minNodes {} exceeds maxNodes {}",
                self.min_nodes, self.max_nodes
            )));
        }
        if self.offering_ids.is_empty() {
            return Err(Error::Validation(
                "at least one offering id is required".to_owned(),
            ));
        }
        if self.datacenter_id.is_empty() {
            return Err(Error::Validation("datacenterId is required".to_owned()));
        }
        if self.resource_identifier.is_empty() {
            return Err(Error::Validation(
                "resourceIdentifier is required".to_owned(),
            ));
        }
        if self.kube_size_id.is_empty() {
            return Err(Error::Validation("kubeSizeId is required".to_owned()));
        }
        // versions must look like vX.Y.Z
        let version = match self.kubernetes_version.strip_prefix('v') {
            Some(version) => version,
            None => {
                return Err(Error::Validation(format!(
                    "kubernetesVersion must start with v: {}",
                    self.kubernetes_version
                )));
            }
        };
        semver::Version::parse(version)?;
        Ok(())
    }
}

impl NodeGroup {
    /// Check whether this group has been asked to go away
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Get the provider side group id if one has been captured
    pub fn vpsie_group_id(&self) -> i64 {
        self.status
            .as_ref()
            .map(|status| status.vpsie_group_id)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a valid spec to mutate in tests
    fn valid_spec() -> NodeGroupSpec {
        NodeGroupSpec {
            min_nodes: 1,
            max_nodes: 5,
            offering_ids: vec!["m2.small".to_owned()],
            preferred_instance_type: None,
            datacenter_id: "us-east-1".to_owned(),
            resource_identifier: "cluster-77".to_owned(),
            os_image_id: Some("ubuntu-22.04".to_owned()),
            kubernetes_version: "v1.30.2".to_owned(),
            kube_size_id: "ks-4".to_owned(),
            ssh_key_ids: Vec::default(),
            scale_down_policy: ScaleDownPolicy::default(),
            scale_up_batch_size: None,
        }
    }

    #[test]
    fn a_valid_spec_passes() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn min_must_not_exceed_max() {
        let mut spec = valid_spec();
        spec.min_nodes = 6;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn max_must_be_at_least_one() {
        let mut spec = valid_spec();
        spec.min_nodes = 0;
        spec.max_nodes = 0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn min_equal_max_is_a_fixed_size_pool() {
        let mut spec = valid_spec();
        spec.min_nodes = 3;
        spec.max_nodes = 3;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn offerings_must_not_be_empty() {
        let mut spec = valid_spec();
        spec.offering_ids.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn versions_must_be_v_prefixed_semver() {
        let mut spec = valid_spec();
        spec.kubernetes_version = "1.30.2".to_owned();
        assert!(spec.validate().is_err());
        spec.kubernetes_version = "v1.30".to_owned();
        assert!(spec.validate().is_err());
        spec.kubernetes_version = "v1.30.2".to_owned();
        assert!(spec.validate().is_ok());
    }
}
