//! Per pod schedulability simulation for scale down safety
//!
//! Before a node may be removed every evictable pod on it must have at least
//! one remaining node that could host it under the hard scheduling
//! constraints. Soft (preferred) constraints are ignored on purpose. Pods
//! placed during the simulation are remembered so later anti-affinity checks
//! see them.

use k8s_openapi::api::core::v1::{
    Node, Pod, PodAffinityTerm, Taint, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;
use std::fmt;

/// The topology key that always holds between pods on one node
const HOSTNAME_KEY: &str = "kubernetes.io/hostname";

/// The constraint class that blocked a pod from being rescheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// The pods tolerations do not cover a nodes taints
    Taints,
    /// The pods node selector does not match
    NodeSelector,
    /// The pods required node affinity does not match
    NodeAffinity,
    /// The pods required anti-affinity collides with a placed pod
    PodAntiAffinity,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Taints => write!(f, "tolerations"),
            Constraint::NodeSelector => write!(f, "node selector"),
            Constraint::NodeAffinity => write!(f, "node affinity"),
            Constraint::PodAntiAffinity => write!(f, "pod anti-affinity"),
        }
    }
}

/// Why a candidate node was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocked {
    /// The namespace/name of the pod that could not be rescheduled
    pub pod: String,
    /// The constraint class that could not be satisfied
    pub constraint: Constraint,
}

impl fmt::Display for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pod {} cannot be rescheduled ({})",
            self.pod, self.constraint
        )
    }
}

/// A node as the simulation sees it
#[derive(Debug, Clone)]
pub struct SimNode {
    /// The name of this node
    pub name: String,
    /// The labels on this node
    pub labels: BTreeMap<String, String>,
    /// The taints on this node
    pub taints: Vec<Taint>,
    /// The pods on this node including simulated placements
    pub pods: Vec<Pod>,
}

impl SimNode {
    /// Build a sim node from a live node and its pods
    ///
    /// # Arguments
    ///
    /// * `node` - The node to mirror
    /// * `pods` - The pods currently on that node
    pub fn from_node(node: &Node, pods: Vec<Pod>) -> Self {
        SimNode {
            name: node.metadata.name.clone().unwrap_or_default(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            taints: node
                .spec
                .as_ref()
                .and_then(|spec| spec.taints.clone())
                .unwrap_or_default(),
            pods,
        }
    }
}

/// Check whether one toleration matches one taint
///
/// # Arguments
///
/// * `toleration` - The toleration to check
/// * `taint` - The taint to check against
fn toleration_matches(toleration: &Toleration, taint: &Taint) -> bool {
    let operator = toleration.operator.as_deref().unwrap_or("Equal");
    // an empty key with Exists tolerates everything
    if toleration.key.as_deref().unwrap_or("").is_empty() {
        return operator == "Exists";
    }
    if toleration.key.as_deref() != Some(taint.key.as_str()) {
        return false;
    }
    // an empty effect matches any effect
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    match operator {
        // Exists tolerates any value
        "Exists" => true,
        // Equal and the default compare values
        _ => toleration.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or(""),
    }
}

/// Check whether a pods tolerations cover a nodes hard taints
///
/// PreferNoSchedule is soft and ignored.
///
/// # Arguments
///
/// * `tolerations` - The pods tolerations
/// * `taints` - The nodes taints
pub fn tolerates(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    taints
        .iter()
        .filter(|taint| taint.effect == "NoSchedule" || taint.effect == "NoExecute")
        .all(|taint| {
            tolerations
                .iter()
                .any(|toleration| toleration_matches(toleration, taint))
        })
}

/// Check whether a node carries every label a pods node selector demands
///
/// # Arguments
///
/// * `selector` - The pods node selector
/// * `labels` - The nodes labels
pub fn node_selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Check whether one node selector expression holds on a nodes labels
fn expression_matches(
    key: &str,
    operator: &str,
    values: Option<&Vec<String>>,
    labels: &BTreeMap<String, String>,
) -> bool {
    let actual = labels.get(key);
    match operator {
        "In" => match actual {
            Some(actual) => values.map(|values| values.contains(actual)).unwrap_or(false),
            None => false,
        },
        // absent labels satisfy NotIn
        "NotIn" => match actual {
            Some(actual) => values.map(|values| !values.contains(actual)).unwrap_or(true),
            None => true,
        },
        "Exists" => actual.is_some(),
        "DoesNotExist" => actual.is_none(),
        // unsupported operators never match
        _ => false,
    }
}

/// Check whether a pods required node affinity accepts a node
///
/// Terms are ORed and the expressions within a term are ANDed. Preferred
/// affinity is soft and ignored.
///
/// # Arguments
///
/// * `pod` - The pod whose affinity to check
/// * `labels` - The nodes labels
pub fn node_affinity_matches(pod: &Pod, labels: &BTreeMap<String, String>) -> bool {
    let required = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.affinity.as_ref())
        .and_then(|affinity| affinity.node_affinity.as_ref())
        .and_then(|node| node.required_during_scheduling_ignored_during_execution.as_ref());
    let selector = match required {
        Some(selector) => selector,
        // no required affinity accepts every node
        None => return true,
    };
    selector.node_selector_terms.iter().any(|term| {
        let expressions = match &term.match_expressions {
            Some(expressions) if !expressions.is_empty() => expressions,
            // a term without expressions matches nothing
            _ => return false,
        };
        expressions.iter().all(|expr| {
            expression_matches(&expr.key, &expr.operator, expr.values.as_ref(), labels)
        })
    })
}

/// Check whether a label selector matches a pods labels
fn label_selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    // all match labels must be present
    if let Some(matches) = &selector.match_labels {
        if !matches
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
        {
            return false;
        }
    }
    // and all match expressions must hold
    if let Some(expressions) = &selector.match_expressions {
        if !expressions.iter().all(|expr| {
            expression_matches(&expr.key, &expr.operator, expr.values.as_ref(), labels)
        }) {
            return false;
        }
    }
    true
}

/// Check whether one anti-affinity term collides with a placed pod
///
/// # Arguments
///
/// * `term` - The required anti-affinity term
/// * `pod_namespace` - The namespace of the pod being placed
/// * `node` - The node the pod would land on
fn term_collides(term: &PodAffinityTerm, pod_namespace: &str, node: &SimNode) -> bool {
    let selector = match &term.label_selector {
        Some(selector) => selector,
        // terms without a selector match nothing
        None => return false,
    };
    // the term only applies when the node is inside the topology domain
    if term.topology_key != HOSTNAME_KEY && !node.labels.contains_key(&term.topology_key) {
        return false;
    }
    // empty namespace lists scope the term to the pods own namespace
    let namespaces = term.namespaces.clone().unwrap_or_default();
    node.pods.iter().any(|placed| {
        let placed_namespace = placed.metadata.namespace.as_deref().unwrap_or("default");
        let in_scope = if namespaces.is_empty() {
            placed_namespace == pod_namespace
        } else {
            namespaces.iter().any(|ns| ns == placed_namespace)
        };
        let placed_labels = placed.metadata.labels.clone().unwrap_or_default();
        in_scope && label_selector_matches(selector, &placed_labels)
    })
}

/// Check whether a pods required anti-affinity allows landing on a node
///
/// Pods already on the node and pods placed earlier in the simulation both
/// count.
///
/// # Arguments
///
/// * `pod` - The pod being placed
/// * `node` - The node the pod would land on
pub fn anti_affinity_allows(pod: &Pod, node: &SimNode) -> bool {
    let required = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.affinity.as_ref())
        .and_then(|affinity| affinity.pod_anti_affinity.as_ref())
        .and_then(|anti| anti.required_during_scheduling_ignored_during_execution.as_ref());
    let terms = match required {
        Some(terms) => terms,
        None => return true,
    };
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    !terms.iter().any(|term| term_collides(term, namespace, node))
}

/// Check whether a single node can host a single pod
///
/// # Arguments
///
/// * `pod` - The pod to place
/// * `node` - The node to place it on
pub fn can_host(pod: &Pod, node: &SimNode) -> Result<(), Constraint> {
    let empty = Vec::default();
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.tolerations.as_ref())
        .unwrap_or(&empty);
    if !tolerates(tolerations, &node.taints) {
        return Err(Constraint::Taints);
    }
    let default_selector = BTreeMap::default();
    let selector = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_selector.as_ref())
        .unwrap_or(&default_selector);
    if !node_selector_matches(selector, &node.labels) {
        return Err(Constraint::NodeSelector);
    }
    if !node_affinity_matches(pod, &node.labels) {
        return Err(Constraint::NodeAffinity);
    }
    if !anti_affinity_allows(pod, node) {
        return Err(Constraint::PodAntiAffinity);
    }
    Ok(())
}

/// Simulate rescheduling every evictable pod onto the remaining nodes
///
/// Each placed pod is added to its nodes pod cache so later anti-affinity
/// checks observe it. The first pod with no home rejects the candidate.
///
/// # Arguments
///
/// * `evictable` - The pods that must find a new home
/// * `remaining` - The nodes that stay behind
pub fn simulate(evictable: &[Pod], remaining: &mut Vec<SimNode>) -> Result<(), Blocked> {
    for pod in evictable {
        let mut last_constraint = Constraint::Taints;
        let mut placed = false;
        for node in remaining.iter_mut() {
            match can_host(pod, node) {
                Ok(()) => {
                    // remember this placement for later anti-affinity checks
                    node.pods.push(pod.clone());
                    placed = true;
                    break;
                }
                Err(constraint) => last_constraint = constraint,
            }
        }
        if !placed {
            let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
            let name = pod.metadata.name.as_deref().unwrap_or("unknown");
            return Err(Blocked {
                pod: format!("{namespace}/{name}"),
                constraint: last_constraint,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodAntiAffinity, PodSpec};
    use kube::core::ObjectMeta;

    /// Build a toleration
    fn toleration(key: &str, operator: &str, value: Option<&str>, effect: &str) -> Toleration {
        Toleration {
            key: if key.is_empty() { None } else { Some(key.to_owned()) },
            operator: Some(operator.to_owned()),
            value: value.map(str::to_owned),
            effect: if effect.is_empty() { None } else { Some(effect.to_owned()) },
            toleration_seconds: None,
        }
    }

    /// Build a taint
    fn taint(key: &str, value: &str, effect: &str) -> Taint {
        Taint {
            key: key.to_owned(),
            value: Some(value.to_owned()),
            effect: effect.to_owned(),
            time_added: None,
        }
    }

    /// Build a bare sim node with the given taints
    fn sim_node(name: &str, taints: Vec<Taint>) -> SimNode {
        SimNode {
            name: name.to_owned(),
            labels: BTreeMap::new(),
            taints,
            pods: Vec::new(),
        }
    }

    /// Build a pod with labels and tolerations
    fn pod(name: &str, labels: &[(&str, &str)], tolerations: Vec<Toleration>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                tolerations: if tolerations.is_empty() { None } else { Some(tolerations) },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn matching_toleration_covers_a_taint() {
        let tolerations = vec![toleration("gpu", "Equal", Some("true"), "NoSchedule")];
        let taints = vec![taint("gpu", "true", "NoSchedule")];
        assert!(tolerates(&tolerations, &taints));
        // a different value no longer matches
        let taints = vec![taint("gpu", "false", "NoSchedule")];
        assert!(!tolerates(&tolerations, &taints));
    }

    #[test]
    fn wildcard_toleration_covers_any_taint() {
        let tolerations = vec![toleration("", "Exists", None, "")];
        let taints = vec![taint("special", "value", "NoSchedule")];
        assert!(tolerates(&tolerations, &taints));
    }

    #[test]
    fn exists_tolerations_ignore_values() {
        let tolerations = vec![toleration("gpu", "Exists", None, "NoSchedule")];
        assert!(tolerates(&tolerations, &[taint("gpu", "anything", "NoSchedule")]));
        assert!(!tolerates(&tolerations, &[taint("tpu", "anything", "NoSchedule")]));
    }

    #[test]
    fn prefer_no_schedule_taints_are_ignored() {
        let taints = vec![taint("gpu", "true", "PreferNoSchedule")];
        assert!(tolerates(&[], &taints));
        // untainted nodes accept anything
        assert!(tolerates(&[], &[]));
    }

    #[test]
    fn untolerated_no_execute_blocks() {
        let taints = vec![taint("maintenance", "true", "NoExecute")];
        assert!(!tolerates(&[], &taints));
    }

    #[test]
    fn node_selectors_require_every_pair() {
        let mut selector = BTreeMap::new();
        selector.insert("disk".to_owned(), "ssd".to_owned());
        let mut labels = BTreeMap::new();
        labels.insert("disk".to_owned(), "ssd".to_owned());
        labels.insert("zone".to_owned(), "a".to_owned());
        assert!(node_selector_matches(&selector, &labels));
        selector.insert("zone".to_owned(), "b".to_owned());
        assert!(!node_selector_matches(&selector, &labels));
    }

    #[test]
    fn required_node_affinity_ors_terms_and_ands_expressions() {
        let mut target = pod("web", &[], Vec::new());
        target.spec.as_mut().unwrap().affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![
                        NodeSelectorTerm {
                            match_expressions: Some(vec![NodeSelectorRequirement {
                                key: "zone".to_owned(),
                                operator: "In".to_owned(),
                                values: Some(vec!["a".to_owned(), "b".to_owned()]),
                            }]),
                            match_fields: None,
                        },
                        NodeSelectorTerm {
                            match_expressions: Some(vec![NodeSelectorRequirement {
                                key: "pool".to_owned(),
                                operator: "Exists".to_owned(),
                                values: None,
                            }]),
                            match_fields: None,
                        },
                    ],
                }),
                preferred_during_scheduling_ignored_during_execution: None,
            }),
            ..Default::default()
        });
        let mut labels = BTreeMap::new();
        labels.insert("zone".to_owned(), "c".to_owned());
        // neither term holds
        assert!(!node_affinity_matches(&target, &labels));
        // the second term holds through Exists
        labels.insert("pool".to_owned(), "x".to_owned());
        assert!(node_affinity_matches(&target, &labels));
        // NotIn treats missing labels as a match
        let expr_labels = BTreeMap::new();
        assert!(expression_matches("zone", "NotIn", Some(&vec!["a".to_owned()]), &expr_labels));
        assert!(!expression_matches("zone", "DoesNotExist", None, &labels));
    }

    #[test]
    fn anti_affinity_sees_simulated_placements() {
        // both pods refuse to share a node with app=web
        let anti = Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(
                            [("app".to_owned(), "web".to_owned())].into_iter().collect(),
                        ),
                        match_expressions: None,
                    }),
                    topology_key: HOSTNAME_KEY.to_owned(),
                    ..Default::default()
                }]),
                preferred_during_scheduling_ignored_during_execution: None,
            }),
            ..Default::default()
        };
        let mut web0 = pod("web-0", &[("app", "web")], Vec::new());
        web0.spec.as_mut().unwrap().affinity = Some(anti.clone());
        let mut web1 = pod("web-1", &[("app", "web")], Vec::new());
        web1.spec.as_mut().unwrap().affinity = Some(anti);
        // one empty node remains so the second placement must collide
        let mut remaining = vec![sim_node("n2", Vec::new())];
        let result = simulate(&[web0, web1], &mut remaining);
        let blocked = result.unwrap_err();
        assert_eq!(blocked.pod, "default/web-1");
        assert_eq!(blocked.constraint, Constraint::PodAntiAffinity);
    }

    #[test]
    fn anti_affinity_blocks_against_preexisting_pods() {
        let mut web0 = pod("web-0", &[("app", "web")], Vec::new());
        web0.spec.as_mut().unwrap().affinity = Some(Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(
                            [("app".to_owned(), "web".to_owned())].into_iter().collect(),
                        ),
                        match_expressions: None,
                    }),
                    topology_key: HOSTNAME_KEY.to_owned(),
                    ..Default::default()
                }]),
                preferred_during_scheduling_ignored_during_execution: None,
            }),
            ..Default::default()
        });
        // the remaining node already hosts web-1
        let mut n2 = sim_node("n2", Vec::new());
        n2.pods.push(pod("web-1", &[("app", "web")], Vec::new()));
        let mut remaining = vec![n2];
        let result = simulate(&[web0], &mut remaining);
        assert_eq!(result.unwrap_err().constraint, Constraint::PodAntiAffinity);
    }

    #[test]
    fn tolerated_pod_moves_off_a_tainted_node() {
        // infer-0 runs on a gpu node but the remaining node is untainted
        let infer = pod(
            "infer-0",
            &[],
            vec![toleration("gpu", "Equal", Some("true"), "NoSchedule")],
        );
        let mut remaining = vec![sim_node("n2", Vec::new())];
        assert!(simulate(&[infer.clone()], &mut remaining).is_ok());
        // swap the remaining node for a tainted one and drop the toleration
        let bare = pod("infer-0", &[], Vec::new());
        let mut remaining = vec![sim_node("n2", vec![taint("gpu", "true", "NoSchedule")])];
        let blocked = simulate(&[bare], &mut remaining).unwrap_err();
        assert_eq!(blocked.pod, "default/infer-0");
        assert_eq!(blocked.constraint, Constraint::Taints);
    }

    #[test]
    fn placement_is_monotone_under_node_addition() {
        let infer = pod(
            "infer-0",
            &[],
            vec![toleration("gpu", "Equal", Some("true"), "NoSchedule")],
        );
        // schedulable on the small set
        let mut small = vec![sim_node("n2", Vec::new())];
        assert!(simulate(std::slice::from_ref(&infer), &mut small).is_ok());
        // still schedulable with an extra node no matter its taints
        let mut larger = vec![
            sim_node("n3", vec![taint("gpu", "true", "NoSchedule")]),
            sim_node("n2", Vec::new()),
        ];
        assert!(simulate(&[infer], &mut larger).is_ok());
    }
}
