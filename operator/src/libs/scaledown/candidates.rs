//! Candidate identification and ordering for scale down

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use chrono::prelude::*;
use std::collections::HashMap;

use super::super::k8s::{Nodes, Pods};

/// A node that passed every scale down safety check
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The name of the node
    pub node: String,
    /// Whether the node is currently not Ready
    pub not_ready: bool,
    /// When the node was created
    pub created: Option<DateTime<Utc>>,
    /// The composite utilization of the node
    pub utilization: f64,
}

/// Check whether a pod is the last replica of a system service
///
/// Removing the node under such a pod would take the service to zero
/// replicas while it reschedules, so its node is excluded.
///
/// # Arguments
///
/// * `pod` - The pod to check
/// * `all_pods` - Every pod in the cluster
pub fn singleton_system_pod(pod: &Pod, all_pods: &[Pod]) -> bool {
    if pod.metadata.namespace.as_deref() != Some("kube-system") {
        return false;
    }
    // daemonset pods respawn on the surviving nodes
    if Pods::is_daemonset(pod) {
        return false;
    }
    // an unowned system pod has nothing to respawn it
    let owner = match pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|owners| owners.first())
    {
        Some(owner) => owner,
        None => return true,
    };
    // count the live replicas sharing this pods owner
    let replicas = all_pods
        .iter()
        .filter(|other| !Pods::is_finished(other))
        .filter(|other| {
            other
                .metadata
                .owner_references
                .as_ref()
                .map(|owners| owners.iter().any(|o| o.uid == owner.uid))
                .unwrap_or(false)
        })
        .count();
    replicas <= 1
}

/// Check whether any disruption budget over a pod is already exhausted
///
/// # Arguments
///
/// * `pod` - The pod to check
/// * `pdbs` - Every disruption budget in the cluster
pub fn pdb_exhausted(pod: &Pod, pdbs: &[PodDisruptionBudget]) -> bool {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    pdbs.iter()
        .filter(|pdb| pdb.metadata.namespace.as_deref() == Some(namespace))
        .filter(|pdb| {
            // only budgets whose selector covers this pod apply
            pdb.spec
                .as_ref()
                .and_then(|spec| spec.selector.as_ref())
                .and_then(|selector| selector.match_labels.as_ref())
                .map(|matches| {
                    matches
                        .iter()
                        .all(|(key, value)| labels.get(key) == Some(value))
                })
                .unwrap_or(false)
        })
        .any(|pdb| {
            pdb.status
                .as_ref()
                .map(|status| status.disruptions_allowed == 0)
                .unwrap_or(false)
        })
}

/// Check whether a node is excluded from scale down outright
///
/// Returns the reason when excluded so it can be logged and counted.
///
/// # Arguments
///
/// * `node` - The node to check
/// * `pods_on_node` - The pods currently on that node
/// * `all_pods` - Every pod in the cluster
/// * `pdbs` - Every disruption budget in the cluster
pub fn exclusion(
    node: &Node,
    pods_on_node: &[Pod],
    all_pods: &[Pod],
    pdbs: &[PodDisruptionBudget],
) -> Option<&'static str> {
    // a cordoned node was taken out of rotation for some other reason
    if !Nodes::is_schedulable(node) {
        return Some("cordoned");
    }
    for pod in pods_on_node {
        if Pods::is_daemonset(pod) || Pods::is_mirror(pod) || Pods::is_finished(pod) {
            continue;
        }
        // local storage does not survive the move
        if Pods::has_local_storage(pod) {
            return Some("local storage");
        }
        if singleton_system_pod(pod, all_pods) {
            return Some("singleton system pod");
        }
        if pdb_exhausted(pod, pdbs) {
            return Some("pdb exhausted");
        }
    }
    None
}

/// Order candidates by removal preference
///
/// Not ready nodes go first, then the oldest, then the least utilized.
///
/// # Arguments
///
/// * `candidates` - The candidates to order
pub fn prioritize(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.not_ready
            .cmp(&a.not_ready)
            .then_with(|| a.created.cmp(&b.created))
            .then_with(|| {
                a.utilization
                    .partial_cmp(&b.utilization)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });
}

/// Group a cluster wide pod list by node name
///
/// # Arguments
///
/// * `pods` - The pods to group
pub fn pods_by_node(pods: &[Pod]) -> HashMap<String, Vec<Pod>> {
    let mut grouped: HashMap<String, Vec<Pod>> = HashMap::new();
    for pod in pods {
        if let Some(node) = pod.spec.as_ref().and_then(|spec| spec.node_name.clone()) {
            grouped.entry(node).or_default().push(pod.clone());
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::policy::v1::{PodDisruptionBudgetSpec, PodDisruptionBudgetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
    use kube::core::ObjectMeta;

    /// Build a pod in a namespace with labels and an owner uid
    fn pod(name: &str, namespace: &str, labels: &[(&str, &str)], owner: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                        .collect(),
                ),
                owner_references: owner.map(|uid| {
                    vec![OwnerReference {
                        uid: uid.to_owned(),
                        kind: "ReplicaSet".to_owned(),
                        controller: Some(true),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Build a pdb over app=<app> with the given allowance
    fn pdb(namespace: &str, app: &str, allowed: i32) -> PodDisruptionBudget {
        PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some(format!("{app}-pdb")),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(
                        [("app".to_owned(), app.to_owned())].into_iter().collect(),
                    ),
                    match_expressions: None,
                }),
                ..Default::default()
            }),
            status: Some(PodDisruptionBudgetStatus {
                disruptions_allowed: allowed,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn lone_system_replicas_block_their_node() {
        let lonely = pod("coredns-abc", "kube-system", &[], Some("uid-1"));
        let all = vec![lonely.clone()];
        assert!(singleton_system_pod(&lonely, &all));
        // a second replica of the same owner unblocks it
        let twin = pod("coredns-def", "kube-system", &[], Some("uid-1"));
        let all = vec![lonely.clone(), twin];
        assert!(!singleton_system_pod(&lonely, &all));
        // user namespace pods never count
        let user = pod("web-0", "default", &[], Some("uid-2"));
        assert!(!singleton_system_pod(&user, &[user.clone()]));
    }

    #[test]
    fn exhausted_pdbs_block_matching_pods_only() {
        let web = pod("web-0", "default", &[("app", "web")], None);
        let api = pod("api-0", "default", &[("app", "api")], None);
        let pdbs = vec![pdb("default", "web", 0), pdb("default", "api", 1)];
        assert!(pdb_exhausted(&web, &pdbs));
        assert!(!pdb_exhausted(&api, &pdbs));
        // namespaces partition budgets
        let other = pod("web-0", "prod", &[("app", "web")], None);
        assert!(!pdb_exhausted(&other, &pdbs));
    }

    #[test]
    fn not_ready_then_oldest_then_coldest() {
        let now = Utc::now();
        let mut candidates = vec![
            Candidate {
                node: "young-cold".to_owned(),
                not_ready: false,
                created: Some(now),
                utilization: 0.1,
            },
            Candidate {
                node: "old-warm".to_owned(),
                not_ready: false,
                created: Some(now - chrono::Duration::hours(5)),
                utilization: 0.4,
            },
            Candidate {
                node: "broken".to_owned(),
                not_ready: true,
                created: Some(now),
                utilization: 0.0,
            },
        ];
        prioritize(&mut candidates);
        let order: Vec<&str> = candidates.iter().map(|c| c.node.as_str()).collect();
        assert_eq!(order, ["broken", "old-warm", "young-cold"]);
    }
}
