//! Safety gates that run before any rebalance plan is produced

use chrono::prelude::*;
use chrono::Duration;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use std::collections::HashMap;
use vpsie_autoscaler::conf::MaintenanceWindow;
use vpsie_autoscaler::models::{conversions, conversions::Requests, NodeGroup};
use vpsie_autoscaler::Error;

use super::super::k8s::Nodes;

/// Check whether enough of the cluster is Ready to tolerate churn
///
/// # Arguments
///
/// * `nodes` - Every node in the cluster
/// * `min_healthy_percent` - The percentage of Ready nodes required
pub fn cluster_healthy(nodes: &[Node], min_healthy_percent: f64) -> bool {
    if nodes.is_empty() {
        return false;
    }
    let ready = nodes.iter().filter(|node| Nodes::is_ready(node)).count();
    let percent = ready as f64 / nodes.len() as f64 * 100.0;
    percent >= min_healthy_percent
}

/// Check whether a group is settled enough to rebalance
///
/// The group must hold at least its minimum and must not have scaled in
/// either direction within the cooldown.
///
/// # Arguments
///
/// * `group` - The group to check
/// * `cooldown` - How long after any scaling event to wait in seconds
/// * `now` - The current time
pub fn group_healthy(group: &NodeGroup, cooldown: u64, now: DateTime<Utc>) -> bool {
    let status = match &group.status {
        Some(status) => status,
        None => return false,
    };
    if status.current_nodes < group.spec.min_nodes {
        return false;
    }
    match &status.last_scale_time {
        Some(last) => now - last.0 >= Duration::seconds(cooldown as i64),
        None => true,
    }
}

/// Check whether disruption budgets allow a batch of this width
///
/// Conservative on purpose. With any budget present batches cap at two
/// nodes, and at one node once a budget pins minAvailable or maxUnavailable.
///
/// # Arguments
///
/// * `batch` - How many nodes the widest batch replaces at once
/// * `pdbs` - Every disruption budget in the cluster
pub fn pdb_batch_allowed(batch: usize, pdbs: &[PodDisruptionBudget]) -> bool {
    if pdbs.is_empty() {
        return true;
    }
    if batch > 2 {
        return false;
    }
    let pinned = pdbs.iter().any(|pdb| {
        pdb.spec
            .as_ref()
            .map(|spec| spec.min_available.is_some() || spec.max_unavailable.is_some())
            .unwrap_or(false)
    });
    if pinned {
        return batch <= 1;
    }
    true
}

/// Total the unused allocatable of the nodes that stay behind
///
/// Only ready, schedulable nodes outside the candidate set count.
///
/// # Arguments
///
/// * `nodes` - Every node in the cluster
/// * `pods_by_node` - Every pod grouped by node name
/// * `excluded` - The candidate nodes being replaced
pub fn aggregate_free(
    nodes: &[Node],
    pods_by_node: &HashMap<String, Vec<Pod>>,
    excluded: &[&str],
) -> Result<Requests, Error> {
    let empty = Vec::default();
    let mut free = Requests::default();
    for node in nodes {
        let name = match node.metadata.name.as_deref() {
            Some(name) => name,
            None => continue,
        };
        if excluded.contains(&name) {
            continue;
        }
        if !Nodes::is_ready(node) || !Nodes::is_schedulable(node) {
            continue;
        }
        let allocatable = match conversions::node_allocatable(node)? {
            Some(allocatable) => allocatable,
            None => continue,
        };
        // subtract what the node already promised away
        let mut used = Requests::default();
        for pod in pods_by_node.get(name).unwrap_or(&empty) {
            let requests = conversions::pod_requests(pod)?;
            used.cpu += requests.cpu;
            used.memory += requests.memory;
        }
        free.cpu += allocatable.cpu.saturating_sub(used.cpu);
        free.memory += allocatable.memory.saturating_sub(used.memory);
    }
    Ok(free)
}

/// Check whether the displaced workload fits the remaining headroom
///
/// # Arguments
///
/// * `displaced` - The total requests coming off the candidate nodes
/// * `factor` - The safety factor applied to the displaced amount
/// * `free` - The aggregate unused allocatable of the surviving nodes
pub fn capacity_fits(displaced: Requests, factor: f64, free: Requests) -> bool {
    let needed_cpu = (displaced.cpu as f64 * factor).ceil() as u64;
    let needed_memory = (displaced.memory as f64 * factor).ceil() as u64;
    needed_cpu <= free.cpu && needed_memory <= free.memory
}

/// Check whether today falls inside a maintenance window
///
/// No windows means rebalancing is always allowed. Time of day bounds are
/// parsed but only the day gate is enforced.
///
/// # Arguments
///
/// * `windows` - The configured maintenance windows
/// * `now` - The current time
pub fn day_allowed(windows: &[MaintenanceWindow], now: DateTime<Utc>) -> bool {
    if windows.is_empty() {
        return true;
    }
    let today = match now.weekday() {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    };
    windows.iter().any(|window| {
        window
            .days
            .iter()
            .any(|day| day.to_lowercase().starts_with(today))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::api::policy::v1::PodDisruptionBudgetSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use vpsie_autoscaler::models::{NodeGroupSpec, NodeGroupStatus};

    /// Build a node that is ready or not
    fn node(ready: bool) -> Node {
        Node {
            status: Some(NodeStatus {
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

    /// Build a pdb, optionally pinning minAvailable
    fn pdb(pinned: bool) -> PodDisruptionBudget {
        PodDisruptionBudget {
            spec: Some(PodDisruptionBudgetSpec {
                min_available: pinned.then(|| IntOrString::Int(1)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn cluster_health_is_a_ready_percentage() {
        let nodes = vec![node(true), node(true), node(true), node(false)];
        assert!(cluster_healthy(&nodes, 75.0));
        assert!(!cluster_healthy(&nodes, 80.0));
        assert!(!cluster_healthy(&[], 1.0));
    }

    #[test]
    fn groups_in_cooldown_are_not_touched() {
        let mut group = NodeGroup::new("pool-a", NodeGroupSpec {
            min_nodes: 1,
            max_nodes: 5,
            ..Default::default()
        });
        let now = Utc::now();
        group.status = Some(NodeGroupStatus {
            current_nodes: 3,
            last_scale_time: Some(Time(now - Duration::seconds(120))),
            ..Default::default()
        });
        assert!(!group_healthy(&group, 3600, now));
        group.status.as_mut().unwrap().last_scale_time = Some(Time(now - Duration::seconds(7200)));
        assert!(group_healthy(&group, 3600, now));
        // below the floor nothing moves
        group.status.as_mut().unwrap().current_nodes = 0;
        assert!(!group_healthy(&group, 3600, now));
    }

    #[test]
    fn pdb_rules_narrow_the_batch() {
        // no budgets, any width goes
        assert!(pdb_batch_allowed(5, &[]));
        // any budget caps batches at two
        assert!(pdb_batch_allowed(2, &[pdb(false)]));
        assert!(!pdb_batch_allowed(3, &[pdb(false)]));
        // a pinned budget caps them at one
        assert!(pdb_batch_allowed(1, &[pdb(true)]));
        assert!(!pdb_batch_allowed(2, &[pdb(true)]));
    }

    #[test]
    fn the_safety_factor_inflates_the_displaced_load() {
        let displaced = Requests { cpu: 1000, memory: 1000 };
        let free = Requests { cpu: 1100, memory: 1300 };
        // 1.2x of 1000 is 1200 which only memory can absorb
        assert!(!capacity_fits(displaced, 1.2, free));
        let free = Requests { cpu: 1200, memory: 1200 };
        assert!(capacity_fits(displaced, 1.2, free));
    }

    #[test]
    fn day_gates_accept_prefixes_and_default_open() {
        let now = Utc::now();
        assert!(day_allowed(&[], now));
        let every_day = MaintenanceWindow {
            days: vec![
                "Monday".to_owned(),
                "Tuesday".to_owned(),
                "Wednesday".to_owned(),
                "Thursday".to_owned(),
                "Friday".to_owned(),
                "Saturday".to_owned(),
                "Sunday".to_owned(),
            ],
            start: None,
            end: None,
        };
        assert!(day_allowed(&[every_day], now));
        let never = MaintenanceWindow {
            days: Vec::default(),
            start: None,
            end: None,
        };
        assert!(!day_allowed(&[never], now));
    }
}
