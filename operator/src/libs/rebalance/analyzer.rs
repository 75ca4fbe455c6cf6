//! Finds nodes whose workload would be cheaper on another offering

use k8s_openapi::api::core::v1::Pod;
use tracing::{event, Level};
use vpsie_autoscaler::client::Offering;
use vpsie_autoscaler::models::{conversions, conversions::Requests, labels, NodeGroup};
use vpsie_autoscaler::Error;

use super::super::k8s::{Nodes, Pods};
use super::super::scaledown::pods_by_node;
use super::super::Shared;
use super::costs::{fits, CostCache};

/// A node with a strictly cheaper offering that still fits its workload
#[derive(Debug, Clone)]
pub struct RebalanceCandidate {
    /// The name of the node to replace
    pub node: String,
    /// The offering the node runs on today
    pub current: Offering,
    /// The cheaper offering to replace it with
    pub target: Offering,
    /// The resource footprint the node carries
    pub footprint: Requests,
}

/// Total the requests of everything running on a node
///
/// Daemonset pods ride along to the replacement node so they count too.
///
/// # Arguments
///
/// * `pods` - The pods on the node
pub fn node_footprint(pods: &[Pod]) -> Result<Requests, Error> {
    let mut total = Requests::default();
    for pod in pods {
        if Pods::is_finished(pod) {
            continue;
        }
        let requests = conversions::pod_requests(pod)?;
        total.cpu += requests.cpu;
        total.memory += requests.memory;
    }
    Ok(total)
}

/// Pick the cheapest alternative offering that fits a footprint
///
/// Only offerings undercutting the current price by at least the savings
/// threshold qualify.
///
/// # Arguments
///
/// * `current` - The offering the node runs on today
/// * `footprint` - The footprint the alternative must hold
/// * `offerings` - The offerings on the table
/// * `min_savings` - The minimum relative savings (0.15 means 15%)
pub fn best_alternative(
    current: &Offering,
    footprint: &Requests,
    offerings: &[Offering],
    min_savings: f64,
) -> Option<Offering> {
    offerings
        .iter()
        .filter(|alt| alt.id != current.id)
        .filter(|alt| fits(alt, footprint))
        .filter(|alt| alt.price_hourly < current.price_hourly * (1.0 - min_savings))
        .min_by(|a, b| {
            a.price_hourly
                .partial_cmp(&b.price_hourly)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
}

/// Analyze every node of a group for a cheaper fit
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `costs` - The offering price cache
/// * `group` - The group to analyze
/// * `min_savings` - The minimum relative savings to act on
pub async fn analyze_group(
    shared: &Shared,
    costs: &CostCache,
    group: &NodeGroup,
    min_savings: f64,
) -> Result<Vec<RebalanceCandidate>, Error> {
    let name = group.metadata.name.clone().unwrap_or_default();
    let nodes = Nodes::new(&shared.client).list_group(&name).await?;
    let all_pods = Pods::new(&shared.client).list_all().await?.items;
    let grouped = pods_by_node(&all_pods);
    // the groups spec bounds which offerings we may move to
    let offerings = shared.provider.list_offerings(&shared.shutdown).await?;
    let allowed: Vec<Offering> = offerings
        .into_iter()
        .filter(|offering| group.spec.offering_ids.iter().any(|id| id == &offering.id))
        .collect();
    let empty = Vec::default();
    let mut found = Vec::new();
    for node in &nodes {
        let node_name = match node.metadata.name.as_deref() {
            Some(node_name) => node_name,
            None => continue,
        };
        // nodes without an offering label were not provisioned by us
        let offering_id = match labels::offering_of(&node.metadata) {
            Some(offering_id) => offering_id.to_owned(),
            None => continue,
        };
        let current = costs.offering(&shared.shutdown, &offering_id).await?;
        let footprint = node_footprint(grouped.get(node_name).unwrap_or(&empty))?;
        if let Some(target) = best_alternative(&current, &footprint, &allowed, min_savings) {
            event!(
                Level::INFO,
                node = node_name,
                current = %current.id,
                target = %target.id,
                msg = "cheaper offering found"
            );
            found.push(RebalanceCandidate {
                node: node_name.to_owned(),
                current,
                target,
                footprint,
            });
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an offering
    fn offering(id: &str, price: f64, cpu: i64, memory_mb: i64) -> Offering {
        Offering {
            id: id.to_owned(),
            price_hourly: price,
            cpu,
            memory_mb,
            disk_gb: 40,
        }
    }

    #[test]
    fn alternatives_must_fit_and_undercut_by_the_threshold() {
        let current = offering("m2.large", 1.00, 8, 16384);
        let footprint = Requests { cpu: 3000, memory: 6144 };
        let offerings = vec![
            // cheaper but too small
            offering("m2.tiny", 0.10, 1, 1024),
            // fits but barely cheaper
            offering("m2.medium", 0.90, 4, 8192),
            // fits and clearly cheaper
            offering("m2.small-plus", 0.50, 4, 8192),
        ];
        let best = best_alternative(&current, &footprint, &offerings, 0.15).unwrap();
        assert_eq!(best.id, "m2.small-plus");
    }

    #[test]
    fn the_cheapest_qualifying_offering_wins() {
        let current = offering("m2.large", 1.00, 8, 16384);
        let footprint = Requests { cpu: 1000, memory: 2048 };
        let offerings = vec![
            offering("a", 0.60, 4, 8192),
            offering("b", 0.40, 2, 4096),
            offering("c", 0.50, 4, 4096),
        ];
        let best = best_alternative(&current, &footprint, &offerings, 0.15).unwrap();
        assert_eq!(best.id, "b");
    }

    #[test]
    fn no_candidate_when_nothing_qualifies() {
        let current = offering("m2.small", 0.30, 2, 4096);
        let footprint = Requests { cpu: 1500, memory: 3072 };
        // the only other offering does not fit
        let offerings = vec![current.clone(), offering("m2.tiny", 0.10, 1, 1024)];
        assert!(best_alternative(&current, &footprint, &offerings, 0.15).is_none());
    }
}
