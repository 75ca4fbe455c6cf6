//! The scale down engine consulted by the pool reconciler and the rebalancer

use chrono::prelude::*;
use chrono::Duration;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};
use vpsie_autoscaler::conf::ScaleDown;
use vpsie_autoscaler::Error;

use super::super::k8s::{Nodes, Pods};
use super::candidates::{self, Candidate};
use super::drain;
use super::simulate::{simulate, SimNode};
use super::utilization::UtilizationCache;

/// Decides which nodes may be removed and empties them when asked
pub struct ScaleDownEngine {
    /// The node api wrapper
    nodes: Nodes,
    /// The pod api wrapper
    pods: Pods,
    /// The scale down settings
    conf: ScaleDown,
    /// The utilization cache fed by the metric collector
    utilization: Arc<UtilizationCache>,
}

impl ScaleDownEngine {
    /// Build a new scale down engine
    ///
    /// # Arguments
    ///
    /// * `client` - A client for the Kubernetes API
    /// * `conf` - The scale down settings
    /// * `utilization` - The utilization cache fed by the metric collector
    pub fn new(client: kube::Client, conf: ScaleDown, utilization: Arc<UtilizationCache>) -> Self {
        ScaleDownEngine {
            nodes: Nodes::new(&client),
            pods: Pods::new(&client),
            conf,
            utilization,
        }
    }

    /// Find the nodes of a group that are safe to remove
    ///
    /// Every candidate passed the exclusion rules and the per pod
    /// schedulability simulation against the nodes that would remain. Blocked
    /// candidates are logged with the pod and constraint that refused them.
    ///
    /// # Arguments
    ///
    /// * `group` - The name of the node group to find candidates in
    /// * `require_underutilized` - Whether candidates must have stayed under
    ///   the utilization thresholds for the full observation window
    /// * `ctx` - The token cancelled on shutdown
    #[instrument(name = "ScaleDownEngine::candidates", skip(self, _ctx), err(Debug))]
    pub async fn candidates(
        &self,
        group: &str,
        require_underutilized: bool,
        _ctx: &CancellationToken,
    ) -> Result<Vec<Candidate>, Error> {
        let group_nodes = self.nodes.list_group(group).await?;
        let all_nodes = self.nodes.list(&[]).await?;
        let all_pods: Vec<Pod> = self.pods.list_all().await?.items;
        let pdbs = self.pods.pdbs().await?.items;
        let grouped = candidates::pods_by_node(&all_pods);
        let now = Utc::now();
        let window = Duration::seconds(self.conf.observation_window as i64);
        // a node silent for two sample ticks counts as unreachable
        let stale_after = Duration::seconds(2 * self.conf.sample_interval as i64);
        let empty = Vec::default();
        let mut found = Vec::new();
        for node in &group_nodes {
            let name = match node.metadata.name.as_deref() {
                Some(name) => name,
                None => continue,
            };
            let on_node = grouped.get(name).unwrap_or(&empty);
            if require_underutilized {
                // unreachable nodes cannot be reasoned about
                if self.utilization.stale(name, stale_after, now) {
                    event!(Level::INFO, node = name, msg = "skipping unreachable node");
                    continue;
                }
                if !self.utilization.underutilized(
                    name,
                    self.conf.cpu_threshold,
                    self.conf.memory_threshold,
                    window,
                    now,
                ) {
                    continue;
                }
            }
            // hard exclusions before the expensive simulation
            if let Some(reason) = candidates::exclusion(node, on_node, &all_pods, &pdbs) {
                event!(
                    Level::INFO,
                    counter = "scale_down_blocked_total",
                    node = name,
                    reason,
                    msg = "scale down blocked"
                );
                continue;
            }
            // every evictable pod must fit somewhere on the surviving nodes
            let evictable = Pods::evictable(on_node.iter().cloned());
            let mut remaining: Vec<SimNode> = all_nodes
                .iter()
                .filter(|other| other.metadata.name.as_deref() != Some(name))
                .filter(|other| Nodes::is_ready(other) && Nodes::is_schedulable(other))
                .map(|other| {
                    let pods = other
                        .metadata
                        .name
                        .as_deref()
                        .and_then(|other_name| grouped.get(other_name))
                        .cloned()
                        .unwrap_or_default();
                    SimNode::from_node(other, pods)
                })
                .collect();
            match simulate(&evictable, &mut remaining) {
                Ok(()) => found.push(Candidate {
                    node: name.to_owned(),
                    not_ready: !Nodes::is_ready(node),
                    created: node.metadata.creation_timestamp.clone().map(|time| time.0),
                    utilization: self.utilization.composite(name),
                }),
                Err(blocked) => event!(
                    Level::INFO,
                    counter = "scale_down_blocked_total",
                    node = name,
                    pod = %blocked.pod,
                    reason = %blocked.constraint,
                    msg = "scale down blocked"
                ),
            }
        }
        candidates::prioritize(&mut found);
        Ok(found)
    }

    /// Drain a node ahead of its removal
    ///
    /// # Arguments
    ///
    /// * `node` - The name of the node to drain
    /// * `ctx` - The token cancelled on shutdown
    pub async fn drain(&self, node: &str, ctx: &CancellationToken) -> Result<(), Error> {
        drain::drain(&self.nodes, &self.pods, node, &self.conf, ctx).await
    }

    /// Put a node back into rotation after an aborted removal
    ///
    /// # Arguments
    ///
    /// * `node` - The name of the node to uncordon
    pub async fn uncordon(&self, node: &str) -> Result<(), Error> {
        self.nodes.uncordon(node).await
    }
}
