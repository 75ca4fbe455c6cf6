//! The per VM custom resource and its phase state machine

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use std::fmt;
use std::str::FromStr;

/// The phases a VPSInstance moves through from request to removal
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum InstancePhase {
    /// The instance exists but no VM has been requested yet
    #[default]
    Pending,
    /// A VM create has been submitted to VPSie
    Provisioning,
    /// VPSie reports the VM as running
    Provisioned,
    /// The VM has been matched to a Kubernetes node that is not Ready yet
    Joining,
    /// The bound node is Ready and carries the management labels
    Ready,
    /// Pods are being evicted ahead of termination
    Draining,
    /// The provider side delete has been requested
    Terminating,
    /// The VM is confirmed gone and the object may be removed
    Deleting,
    /// The instance hit an unrecoverable error
    Failed,
}

impl InstancePhase {
    /// Check whether this phase sits between creation and Ready
    ///
    /// Sequential scale up blocks while any owned instance is transitional.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            InstancePhase::Pending
                | InstancePhase::Provisioning
                | InstancePhase::Provisioned
                | InstancePhase::Joining
        )
    }

    /// Check whether this phase is part of the teardown path
    pub fn is_terminating(self) -> bool {
        matches!(
            self,
            InstancePhase::Draining | InstancePhase::Terminating | InstancePhase::Deleting
        )
    }

    /// Check whether a transition from this phase to the next is legal
    ///
    /// Failed is sticky. The only way out is the teardown path that a delete
    /// request starts.
    ///
    /// # Arguments
    ///
    /// * `next` - The phase to transition to
    pub fn can_transition(self, next: InstancePhase) -> bool {
        match (self, next) {
            // the forward path from request to Ready
            (InstancePhase::Pending, InstancePhase::Provisioning) => true,
            (InstancePhase::Provisioning, InstancePhase::Provisioning) => true,
            (InstancePhase::Provisioning, InstancePhase::Provisioned) => true,
            (InstancePhase::Provisioned, InstancePhase::Joining) => true,
            (InstancePhase::Joining, InstancePhase::Ready) => true,
            // every phase may start draining when a delete lands
            (_, InstancePhase::Draining) => !matches!(
                self,
                InstancePhase::Terminating | InstancePhase::Deleting
            ),
            // the teardown path itself
            (InstancePhase::Draining, InstancePhase::Terminating) => true,
            (InstancePhase::Terminating, InstancePhase::Deleting) => true,
            // anything but teardown may fail out
            (_, InstancePhase::Failed) => !matches!(
                self,
                InstancePhase::Failed | InstancePhase::Deleting
            ),
            _ => false,
        }
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstancePhase::Pending => write!(f, "Pending"),
            InstancePhase::Provisioning => write!(f, "Provisioning"),
            InstancePhase::Provisioned => write!(f, "Provisioned"),
            InstancePhase::Joining => write!(f, "Joining"),
            InstancePhase::Ready => write!(f, "Ready"),
            InstancePhase::Draining => write!(f, "Draining"),
            InstancePhase::Terminating => write!(f, "Terminating"),
            InstancePhase::Deleting => write!(f, "Deleting"),
            InstancePhase::Failed => write!(f, "Failed"),
        }
    }
}

impl FromStr for InstancePhase {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "Pending" => Ok(InstancePhase::Pending),
            "Provisioning" => Ok(InstancePhase::Provisioning),
            "Provisioned" => Ok(InstancePhase::Provisioned),
            "Joining" => Ok(InstancePhase::Joining),
            "Ready" => Ok(InstancePhase::Ready),
            "Draining" => Ok(InstancePhase::Draining),
            "Terminating" => Ok(InstancePhase::Terminating),
            "Deleting" => Ok(InstancePhase::Deleting),
            "Failed" => Ok(InstancePhase::Failed),
            _ => Err(()),
        }
    }
}

/// The resources VPSie reports for a provisioned VM
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResources {
    /// The number of cpu cores
    pub cpu: i64,
    /// The amount of memory in mebibytes
    pub memory_mb: i64,
    /// The amount of disk in gigabytes
    pub disk_gb: i64,
}

/// The persisted error payload of a failed or retrying instance
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceError {
    /// A machine readable error code
    pub code: String,
    /// A human readable message
    pub message: String,
    /// When this error was recorded
    pub timestamp: Option<Time>,
    /// How many times the failing operation has been retried
    pub retries: u32,
}

impl InstanceError {
    /// Build a new instance error stamped with the current time
    ///
    /// # Arguments
    ///
    /// * `code` - A machine readable error code
    /// * `message` - A human readable message
    /// * `retries` - How many times the failing operation has been retried
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M, retries: u32) -> Self {
        InstanceError {
            code: code.into(),
            message: message.into(),
            timestamp: Some(Time(Utc::now())),
            retries,
        }
    }
}

/// VPSInstance CRD definition
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "autoscaler.vpsie.com",
    version = "v1alpha1",
    kind = "VPSInstance",
    plural = "vpsinstances",
    shortname = "vpsi",
    status = "VPSInstanceStatus",
    namespaced,
    doc = "Custom resource representing a single VPSie backed worker VM"
)]
#[kube(printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\"}")]
#[kube(printcolumn = "{\"jsonPath\": \".spec.nodeGroup\", \"name\": \"GROUP\", \"type\": \"string\"}")]
#[kube(printcolumn = "{\"jsonPath\": \".spec.vpsieInstanceId\", \"name\": \"VM-ID\", \"type\": \"integer\"}")]
#[serde(rename_all = "camelCase")]
pub struct VPSInstanceSpec {
    /// The numeric VPSie VM id (0 until discovered)
    #[serde(default)]
    pub vpsie_instance_id: i64,
    /// The offering this VM was requested with
    pub offering_id: String,
    /// The name of the owning node group
    pub node_group: String,
    /// The datacenter to provision in
    pub datacenter_id: String,
    /// The VPSie side cluster identifier
    pub resource_identifier: String,
    /// An optional VPSie project to bill against
    #[serde(default)]
    pub project: Option<String>,
    /// The OS image to provision with
    #[serde(default)]
    pub os_image_id: Option<String>,
    /// The Kubernetes version to install
    pub kubernetes_version: String,
    /// The ssh keys to authorize on the VM
    #[serde(default)]
    pub ssh_key_ids: Vec<String>,
    /// The numeric VPSie node group id this VM belongs to
    #[serde(default)]
    pub vpsie_group_id: i64,
    /// The IP addresses VPSie assigned (may be empty until discovered)
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    /// The expected Kubernetes node name if known ahead of join
    #[serde(default)]
    pub node_name: Option<String>,
}

/// The status of a VPSInstance
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VPSInstanceStatus {
    /// The current phase of this instance
    #[serde(default)]
    pub phase: InstancePhase,
    /// The hostname VPSie assigned to the VM
    #[serde(default)]
    pub hostname: Option<String>,
    /// The primary IP of the VM
    #[serde(default)]
    pub ip: Option<String>,
    /// The resources VPSie reports for the VM
    #[serde(default)]
    pub resources: Option<InstanceResources>,
    /// When this instance was created
    #[serde(default)]
    pub created_at: Option<Time>,
    /// When this instance first reached Ready
    #[serde(default)]
    pub ready_at: Option<Time>,
    /// When the provider side VM was confirmed gone
    #[serde(default)]
    pub deleted_at: Option<Time>,
    /// The generation last acted on
    #[serde(default)]
    pub observed_generation: i64,
    /// The persisted error payload if any
    #[serde(default)]
    pub error: Option<InstanceError>,
    /// The Kubernetes node bound to this instance
    #[serde(default)]
    pub node_name: Option<String>,
}

impl VPSInstance {
    /// Get the current phase of this instance
    pub fn phase(&self) -> InstancePhase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    /// Check whether this instance has been asked to go away
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// All phases in declaration order
    const ALL: [InstancePhase; 9] = [
        InstancePhase::Pending,
        InstancePhase::Provisioning,
        InstancePhase::Provisioned,
        InstancePhase::Joining,
        InstancePhase::Ready,
        InstancePhase::Draining,
        InstancePhase::Terminating,
        InstancePhase::Deleting,
        InstancePhase::Failed,
    ];

    #[test]
    fn forward_path_is_exactly_the_happy_path() {
        use InstancePhase::*;
        assert!(Pending.can_transition(Provisioning));
        assert!(Provisioning.can_transition(Provisioning));
        assert!(Provisioning.can_transition(Provisioned));
        assert!(Provisioned.can_transition(Joining));
        assert!(Joining.can_transition(Ready));
        // no skipping stages
        assert!(!Pending.can_transition(Provisioned));
        assert!(!Provisioning.can_transition(Joining));
        assert!(!Provisioned.can_transition(Ready));
        // no going backwards
        assert!(!Ready.can_transition(Joining));
        assert!(!Provisioned.can_transition(Provisioning));
    }

    #[test]
    fn every_live_phase_may_start_draining() {
        use InstancePhase::*;
        for phase in [Pending, Provisioning, Provisioned, Joining, Ready, Failed] {
            assert!(phase.can_transition(Draining), "{phase} should drain");
        }
        assert!(!Terminating.can_transition(Draining));
        assert!(!Deleting.can_transition(Draining));
    }

    #[test]
    fn teardown_runs_in_order() {
        use InstancePhase::*;
        assert!(Draining.can_transition(Terminating));
        assert!(Terminating.can_transition(Deleting));
        assert!(!Draining.can_transition(Deleting));
        assert!(!Deleting.can_transition(Terminating));
    }

    #[test]
    fn failed_is_sticky() {
        use InstancePhase::*;
        for next in ALL {
            // deletion is the single way out of Failed
            let allowed = next == Draining;
            assert_eq!(Failed.can_transition(next), allowed, "Failed -> {next}");
        }
        // teardown phases never fail out mid removal
        assert!(!Deleting.can_transition(Failed));
        assert!(Terminating.can_transition(Failed));
    }

    #[test]
    fn transitional_phases_block_sequential_scale_up() {
        use InstancePhase::*;
        let transitional: Vec<_> = ALL.iter().filter(|p| p.is_transitional()).collect();
        assert_eq!(
            transitional,
            [&Pending, &Provisioning, &Provisioned, &Joining]
        );
        let terminating: Vec<_> = ALL.iter().filter(|p| p.is_terminating()).collect();
        assert_eq!(terminating, [&Draining, &Terminating, &Deleting]);
    }

    #[test]
    fn phases_round_trip_through_strings() {
        for phase in ALL {
            assert_eq!(phase.to_string().parse::<InstancePhase>().unwrap(), phase);
        }
        assert!("Unknown".parse::<InstancePhase>().is_err());
    }
}
