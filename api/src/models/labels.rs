//! The label and annotation conventions the autoscaler acts through
//!
//! Every resource the autoscaler touches must carry the managed label. Events
//! for unlabeled resources are dropped so externally created pools are never
//! modified.

use kube::core::ObjectMeta;
use std::collections::BTreeMap;

/// The gate label required on every resource the autoscaler acts on
pub const MANAGED: &str = "autoscaler/managed";
/// The label tying an instance or node to its owning node group
pub const NODE_GROUP: &str = "autoscaler/nodegroup";
/// The claim label tying a node to the instance it backs
pub const VPSIE_NODE: &str = "autoscaler/vpsienode";
/// The label carrying the numeric VPSie VM id on a bound node
pub const VPS_ID: &str = "autoscaler/vps-id";
/// The label carrying the offering id on a bound node
pub const OFFERING: &str = "autoscaler/offering";
/// The annotation marking an instance whose VM was accepted without an id
pub const CREATION_REQUESTED: &str = "autoscaler/creation-requested";

/// The finalizer held on node groups until their instances are gone
pub const GROUP_FINALIZER: &str = "nodegroups.autoscaler.vpsie.com/finalizer";
/// The finalizer held on instances until the provider side VM is gone
pub const INSTANCE_FINALIZER: &str = "vpsinstances.autoscaler.vpsie.com/finalizer";

/// Check whether a resource carries the managed gate label
///
/// # Arguments
///
/// * `meta` - The metadata of the resource to check
pub fn is_managed(meta: &ObjectMeta) -> bool {
    // resources without labels are never ours
    let labels = match &meta.labels {
        Some(labels) => labels,
        None => return false,
    };
    labels.get(MANAGED).map(String::as_str) == Some("true")
}

/// Get the owning node group name from a resources labels
///
/// # Arguments
///
/// * `meta` - The metadata of the resource to check
pub fn group_of(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(NODE_GROUP))
        .map(String::as_str)
}

/// Get the instance name a node is claimed by if any
///
/// # Arguments
///
/// * `meta` - The metadata of the node to check
pub fn claimed_by(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(VPSIE_NODE))
        .map(String::as_str)
}

/// Get the offering id recorded on a node if any
///
/// # Arguments
///
/// * `meta` - The metadata of the node to check
pub fn offering_of(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(OFFERING))
        .map(String::as_str)
}

/// Check whether an instance has asked for async creation discovery
///
/// # Arguments
///
/// * `meta` - The metadata of the instance to check
pub fn creation_requested(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(CREATION_REQUESTED))
        .map(String::as_str)
        == Some("true")
}

/// Build the labels stamped onto a new instance
///
/// # Arguments
///
/// * `group` - The name of the owning node group
pub fn instance_labels(group: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED.to_owned(), "true".to_owned());
    labels.insert(NODE_GROUP.to_owned(), group.to_owned());
    labels
}

/// Build the management labels applied to a node at join time
///
/// # Arguments
///
/// * `group` - The name of the owning node group
/// * `instance` - The name of the instance the node backs
/// * `vps_id` - The numeric VPSie VM id behind the node
/// * `offering` - The offering id the node was provisioned with
pub fn node_labels(
    group: &str,
    instance: &str,
    vps_id: i64,
    offering: &str,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED.to_owned(), "true".to_owned());
    labels.insert(NODE_GROUP.to_owned(), group.to_owned());
    labels.insert(VPSIE_NODE.to_owned(), instance.to_owned());
    labels.insert(VPS_ID.to_owned(), vps_id.to_string());
    labels.insert(OFFERING.to_owned(), offering.to_owned());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build metadata with the given label pairs
    fn meta_with(labels: &[(&str, &str)]) -> ObjectMeta {
        let map = labels
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        ObjectMeta {
            labels: Some(map),
            ..Default::default()
        }
    }

    #[test]
    fn unlabeled_resources_are_not_managed() {
        assert!(!is_managed(&ObjectMeta::default()));
        assert!(!is_managed(&meta_with(&[("app", "web")])));
        assert!(!is_managed(&meta_with(&[(MANAGED, "false")])));
    }

    #[test]
    fn managed_gate_requires_the_exact_value() {
        assert!(is_managed(&meta_with(&[(MANAGED, "true")])));
        assert!(!is_managed(&meta_with(&[(MANAGED, "True")])));
    }

    #[test]
    fn node_labels_carry_the_claim() {
        let labels = node_labels("pool-a", "pool-a-1f2e3d4c", 42, "m2.small");
        assert_eq!(labels.get(VPSIE_NODE).unwrap(), "pool-a-1f2e3d4c");
        assert_eq!(labels.get(VPS_ID).unwrap(), "42");
        assert_eq!(labels.get(OFFERING).unwrap(), "m2.small");
        assert_eq!(labels.get(MANAGED).unwrap(), "true");
    }
}
