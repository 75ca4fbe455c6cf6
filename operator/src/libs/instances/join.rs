//! Binds provisioned VMs to their Kubernetes nodes
//!
//! Matching is IP first because the IP stays stable while names drift
//! between what VPSie reports and what the kubelet registered.

use k8s_openapi::api::core::v1::Node;
use vpsie_autoscaler::models::{labels, VPSInstance};
use vpsie_autoscaler::Error;

use super::super::k8s::Nodes;
use super::super::Shared;

/// Find the node backing an instance
///
/// Tried in order: a node reporting the instances internal IP, a node named
/// like the specs expected node name, a node named like the VPSie hostname.
///
/// # Arguments
///
/// * `nodes` - The cluster nodes to search
/// * `ip` - The instances IP if known
/// * `spec_name` - The expected node name from the spec if any
/// * `hostname` - The hostname VPSie assigned if known
pub fn match_node<'a>(
    nodes: &'a [Node],
    ip: Option<&str>,
    spec_name: Option<&str>,
    hostname: Option<&str>,
) -> Option<&'a Node> {
    if let Some(ip) = ip {
        if let Some(node) = nodes
            .iter()
            .find(|node| Nodes::internal_ip(node) == Some(ip))
        {
            return Some(node);
        }
    }
    for key in [spec_name, hostname].into_iter().flatten() {
        if let Some(node) = nodes
            .iter()
            .find(|node| node.metadata.name.as_deref() == Some(key))
        {
            return Some(node);
        }
    }
    None
}

/// Stamp the management labels onto a bound node
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `instance` - The instance the node backs
/// * `node` - The name of the node to label
pub async fn bind(shared: &Shared, instance: &VPSInstance, node: &str) -> Result<(), Error> {
    let name = instance.metadata.name.as_deref().unwrap_or_default();
    let wanted = labels::node_labels(
        &instance.spec.node_group,
        name,
        instance.spec.vpsie_instance_id,
        &instance.spec.offering_id,
    );
    Nodes::new(&shared.client).label(node, &wanted).await
}
