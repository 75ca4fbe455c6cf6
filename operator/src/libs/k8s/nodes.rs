use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, ObjectList, Patch, PatchParams};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{event, instrument, Level};
use vpsie_autoscaler::models::labels;
use vpsie_autoscaler::Error;

/// How many times to retry a conflicted node patch before giving up
const PATCH_RETRIES: u32 = 3;

/// Wrapper for node api routes in k8s
pub struct Nodes {
    /// API client for node commands in k8s
    api: Api<Node>,
}

impl Nodes {
    /// Build a new wrapper for k8s functions regarding nodes
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    pub fn new(client: &kube::Client) -> Self {
        // nodes are cluster scoped
        let api: Api<Node> = Api::all(client.clone());
        Nodes { api }
    }

    /// List all nodes in this cluster
    ///
    /// # Arguments
    ///
    /// * `labels` - The labels to restrict to
    pub async fn list(&self, labels: &[&str]) -> Result<ObjectList<Node>, Error> {
        // build list params
        let params = ListParams::default();
        // insert any label filters into list params
        let params = labels
            .iter()
            .fold(params, |params, label| params.labels(label));
        // get list of all matching nodes
        Ok(self.api.list(&params).await?)
    }

    /// List the managed nodes of a single node group
    ///
    /// # Arguments
    ///
    /// * `group` - The name of the node group to list nodes for
    pub async fn list_group(&self, group: &str) -> Result<ObjectList<Node>, Error> {
        let managed = format!("{}=true", labels::MANAGED);
        let owned = format!("{}={}", labels::NODE_GROUP, group);
        self.list(&[managed.as_str(), owned.as_str()]).await
    }

    /// Get a node by name returning None on 404
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the node to get
    pub async fn get_opt(&self, name: &str) -> Result<Option<Node>, Error> {
        Ok(self.api.get_opt(name).await?)
    }

    /// Mark a node unschedulable ahead of a drain
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the node to cordon
    #[instrument(name = "k8s::Nodes::cordon", skip(self))]
    pub async fn cordon(&self, name: &str) -> Result<(), Error> {
        // a node that is already gone needs no fence
        match self.api.cordon(name).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Mark a node schedulable again after an aborted replacement
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the node to uncordon
    #[instrument(name = "k8s::Nodes::uncordon", skip(self))]
    pub async fn uncordon(&self, name: &str) -> Result<(), Error> {
        match self.api.uncordon(name).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Delete a node object
    ///
    /// Deleting a node that is already gone succeeds.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the node to delete
    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Apply a set of labels to a node with retry on conflict
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the node to label
    /// * `labels` - The labels to create/overwrite
    #[instrument(name = "k8s::Nodes::label", skip(self, labels))]
    pub async fn label(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<(), Error> {
        for attempt in 0..PATCH_RETRIES {
            // read the node fresh so our patch is built on the latest version
            let node = self.api.get(name).await?;
            // build a label patch guarded by the observed resource version
            let patch = json!({
                "metadata": {
                    "resourceVersion": node.metadata.resource_version,
                    "labels": labels,
                }
            });
            let params = PatchParams {
                field_manager: Some("vpsie-autoscaler".to_owned()),
                ..Default::default()
            };
            match self.api.patch(name, &params, &Patch::Merge(&patch)).await {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    // someone else moved the node, read it again and retry
                    event!(Level::INFO, node = name, attempt, msg = "label conflict");
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }
        Err(Error::new(format!(
            "Failed to label node {name} after {PATCH_RETRIES} attempts"
        )))
    }

    /// Check whether a node reports Ready=True
    ///
    /// # Arguments
    ///
    /// * `node` - The node to check
    pub fn is_ready(node: &Node) -> bool {
        node.status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|cond| cond.type_ == "Ready" && cond.status == "True")
            })
            .unwrap_or(false)
    }

    /// Check whether a node accepts new pods
    ///
    /// # Arguments
    ///
    /// * `node` - The node to check
    pub fn is_schedulable(node: &Node) -> bool {
        !node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false)
    }

    /// Get the internal IP of a node if it reports one
    ///
    /// # Arguments
    ///
    /// * `node` - The node to read addresses from
    pub fn internal_ip(node: &Node) -> Option<&str> {
        node.status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .and_then(|addresses| {
                addresses
                    .iter()
                    .find(|address| address.type_ == "InternalIP")
            })
            .map(|address| address.address.as_str())
    }

    /// Check whether a node reports the given IP on any interface
    ///
    /// # Arguments
    ///
    /// * `node` - The node to read addresses from
    /// * `ip` - The IP to look for
    pub fn has_ip(node: &Node, ip: &str) -> bool {
        node.status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .map(|addresses| {
                addresses.iter().any(|address| {
                    (address.type_ == "InternalIP" || address.type_ == "ExternalIP")
                        && address.address == ip
                })
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeSpec, NodeStatus};

    /// Build a node with the given readiness and addresses
    fn node(ready: bool, internal: Option<&str>, external: Option<&str>) -> Node {
        let mut addresses = Vec::new();
        if let Some(ip) = internal {
            addresses.push(NodeAddress {
                type_: "InternalIP".to_owned(),
                address: ip.to_owned(),
            });
        }
        if let Some(ip) = external {
            addresses.push(NodeAddress {
                type_: "ExternalIP".to_owned(),
                address: ip.to_owned(),
            });
        }
        Node {
            status: Some(NodeStatus {
                addresses: Some(addresses),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_owned(),
                    status: if ready { "True" } else { "False" }.to_owned(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn readiness_follows_the_ready_condition() {
        assert!(Nodes::is_ready(&node(true, None, None)));
        assert!(!Nodes::is_ready(&node(false, None, None)));
        assert!(!Nodes::is_ready(&Node::default()));
    }

    #[test]
    fn cordoned_nodes_are_unschedulable() {
        let mut cordoned = node(true, None, None);
        cordoned.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });
        assert!(!Nodes::is_schedulable(&cordoned));
        assert!(Nodes::is_schedulable(&node(true, None, None)));
    }

    #[test]
    fn ip_matching_covers_internal_and_external() {
        let node = node(true, Some("10.0.0.5"), Some("203.0.113.9"));
        assert!(Nodes::has_ip(&node, "10.0.0.5"));
        assert!(Nodes::has_ip(&node, "203.0.113.9"));
        assert!(!Nodes::has_ip(&node, "10.0.0.6"));
        assert_eq!(Nodes::internal_ip(&node), Some("10.0.0.5"));
    }
}
