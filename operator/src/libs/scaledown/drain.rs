//! Cordon and evict orchestration for node removal

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};
use vpsie_autoscaler::conf::ScaleDown;
use vpsie_autoscaler::Error;

use super::super::k8s::{EvictOutcome, Nodes, Pods};

/// Drain every evictable pod off a node
///
/// The node is cordoned first. Evictions honor disruption budgets so denied
/// pods are retried until the drain budget runs out. On timeout the node is
/// left cordoned for the operator to inspect and an error is returned.
///
/// # Arguments
///
/// * `nodes` - The node api wrapper
/// * `pods` - The pod api wrapper
/// * `node` - The name of the node to drain
/// * `conf` - The scale down settings
/// * `ctx` - The token cancelled on shutdown
#[instrument(name = "scaledown::drain", skip(nodes, pods, conf, ctx), err(Debug))]
pub async fn drain(
    nodes: &Nodes,
    pods: &Pods,
    node: &str,
    conf: &ScaleDown,
    ctx: &CancellationToken,
) -> Result<(), Error> {
    // stop new pods landing on the node while we empty it
    nodes.cordon(node).await?;
    let deadline = Instant::now() + Duration::from_secs(conf.drain_timeout);
    loop {
        // find whatever still needs to move
        let listing = pods.on_node(node).await?;
        let evictable = Pods::evictable(listing);
        if evictable.is_empty() {
            event!(Level::INFO, node, msg = "drained");
            return Ok(());
        }
        // issue an eviction for every remaining pod
        let mut denied = 0;
        for pod in &evictable {
            let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
            let name = match pod.metadata.name.as_deref() {
                Some(name) => name,
                None => continue,
            };
            // denied evictions stay in the list and get retried next pass
            if pods.evict(namespace, name).await? == EvictOutcome::Denied {
                denied += 1;
            }
        }
        if denied > 0 {
            event!(Level::INFO, node, denied, msg = "waiting on disruption budgets");
        }
        if Instant::now() >= deadline {
            return Err(Error::new(format!(
                "Drain of {} timed out with {} pods left",
                node,
                evictable.len()
            )));
        }
        // wait before polling again, bailing on cancellation
        tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(conf.eviction_retry)) => {}
        }
    }
}
