//! Pure capacity planning for node groups
//!
//! Everything here is arithmetic over already fetched state so the scaling
//! decisions can be tested without a cluster.

use chrono::prelude::*;
use chrono::Duration;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use rand::Rng;
use vpsie_autoscaler::models::{
    conditions::{self, ConditionKind},
    labels, InstancePhase, InstanceSummary, NodeGroup, NodeGroupSpec, NodeGroupStatus,
    ScaleDownPolicy, VPSInstance, VPSInstanceSpec,
};

/// What the pool reconciler should do this pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Create one instance
    Up,
    /// Remove this many instances
    Down(i32),
    /// Capacity matches, nothing to do
    Hold,
}

/// Clamp the stored desired count into the groups bounds
///
/// A group that has never scaled seeds its desired count at the minimum.
///
/// # Arguments
///
/// * `previous` - The previously stored desired count if any
/// * `min` - The groups minimum size
/// * `max` - The groups maximum size
pub fn clamp_desired(previous: Option<i32>, min: i32, max: i32) -> i32 {
    previous.unwrap_or(min).clamp(min, max)
}

/// Decide whether the group needs to add or remove capacity
///
/// # Arguments
///
/// * `current` - How many live instances the group owns
/// * `desired` - How many instances the group wants
/// * `min` - The groups minimum size
/// * `max` - The groups maximum size
pub fn decide(current: i32, desired: i32, min: i32, max: i32) -> ScaleDecision {
    if current < desired && current < max {
        return ScaleDecision::Up;
    }
    if current > desired && current > min {
        // never remove past the floor
        return ScaleDecision::Down((current - desired).min(current - min));
    }
    ScaleDecision::Hold
}

/// Check whether any owned instance is still between creation and Ready
///
/// Scale up is sequential. While one instance is in flight no further
/// instance may be created, otherwise a slow provider turns one missing node
/// into a runaway pool.
///
/// # Arguments
///
/// * `instances` - The live owned instances
pub fn any_transitional(instances: &[VPSInstance]) -> bool {
    instances
        .iter()
        .any(|instance| instance.phase().is_transitional())
}

/// Count the owned instances that reached Ready
///
/// # Arguments
///
/// * `instances` - The live owned instances
pub fn ready_count(instances: &[VPSInstance]) -> i32 {
    instances
        .iter()
        .filter(|instance| instance.phase() == InstancePhase::Ready)
        .count() as i32
}

/// Build the per instance summary list for the group status
///
/// # Arguments
///
/// * `instances` - The live owned instances
pub fn summarize(instances: &[VPSInstance]) -> Vec<InstanceSummary> {
    instances
        .iter()
        .map(|instance| InstanceSummary {
            name: instance.metadata.name.clone().unwrap_or_default(),
            phase: instance.phase(),
            vpsie_instance_id: instance.spec.vpsie_instance_id,
            node_name: instance
                .status
                .as_ref()
                .and_then(|status| status.node_name.clone()),
        })
        .collect()
}

/// Check whether the cooldown and stabilization windows have both passed
///
/// The cooldown runs from the last scale down, the stabilization window from
/// the last scale up. A group that never scaled has nothing to wait on.
///
/// # Arguments
///
/// * `policy` - The groups scale down policy
/// * `last_up` - When the group last scaled up
/// * `last_down` - When the group last scaled down
/// * `now` - The current time
pub fn windows_elapsed(
    policy: &ScaleDownPolicy,
    last_up: Option<&Time>,
    last_down: Option<&Time>,
    now: DateTime<Utc>,
) -> bool {
    if let Some(last_down) = last_down {
        if now - last_down.0 < Duration::seconds(policy.cooldown_seconds as i64) {
            return false;
        }
    }
    if let Some(last_up) = last_up {
        if now - last_up.0 < Duration::seconds(policy.stabilization_seconds as i64) {
            return false;
        }
    }
    true
}

/// Pick victims when the scale down engine cannot be consulted
///
/// Instances that never became Ready go first, then the oldest.
///
/// # Arguments
///
/// * `instances` - The live owned instances
/// * `count` - How many victims to pick
pub fn fallback_victims(instances: &[VPSInstance], count: usize) -> Vec<String> {
    let mut ordered: Vec<&VPSInstance> = instances.iter().collect();
    ordered.sort_by(|a, b| {
        let a_ready = a.phase() == InstancePhase::Ready;
        let b_ready = b.phase() == InstancePhase::Ready;
        let a_created = a.metadata.creation_timestamp.as_ref().map(|time| time.0);
        let b_created = b.metadata.creation_timestamp.as_ref().map(|time| time.0);
        a_ready.cmp(&b_ready).then_with(|| a_created.cmp(&b_created))
    });
    ordered
        .into_iter()
        .take(count)
        .filter_map(|instance| instance.metadata.name.clone())
        .collect()
}

/// Pick the offering a new instance should be provisioned with
///
/// # Arguments
///
/// * `spec` - The groups spec
pub fn pick_offering(spec: &NodeGroupSpec) -> &str {
    // the preferred type wins when it is actually offered
    if let Some(preferred) = &spec.preferred_instance_type {
        if spec.offering_ids.iter().any(|id| id == preferred) {
            return preferred;
        }
    }
    &spec.offering_ids[0]
}

/// Generate a new instance name under a group
///
/// # Arguments
///
/// * `group` - The name of the owning group
pub fn instance_name(group: &str) -> String {
    let suffix: u32 = rand::rng().random();
    format!("{}-{:08x}", group, suffix)
}

/// Build a new instance object under a group
///
/// The instance carries the managed labels and an owner reference so cascade
/// deletes and ownership watches work.
///
/// # Arguments
///
/// * `group` - The group to create under
/// * `namespace` - The namespace to create in
/// * `vpsie_group_id` - The provider side group id to attach to
/// * `offering` - The offering to provision with
pub fn new_instance(
    group: &NodeGroup,
    namespace: &str,
    vpsie_group_id: i64,
    offering: &str,
) -> VPSInstance {
    let group_name = group.metadata.name.clone().unwrap_or_default();
    let name = instance_name(&group_name);
    let spec = VPSInstanceSpec {
        vpsie_instance_id: 0,
        offering_id: offering.to_owned(),
        node_group: group_name.clone(),
        datacenter_id: group.spec.datacenter_id.clone(),
        resource_identifier: group.spec.resource_identifier.clone(),
        project: None,
        os_image_id: group.spec.os_image_id.clone(),
        kubernetes_version: group.spec.kubernetes_version.clone(),
        ssh_key_ids: group.spec.ssh_key_ids.clone(),
        vpsie_group_id,
        ip_addresses: Vec::default(),
        node_name: None,
    };
    let mut instance = VPSInstance::new(&name, spec);
    instance.metadata.namespace = Some(namespace.to_owned());
    instance.metadata.labels = Some(labels::instance_labels(&group_name));
    // the owner reference drives cascade deletes and our watches
    instance.metadata.owner_references = group.controller_owner_ref(&()).map(|owner| vec![owner]);
    instance
}

/// Map a node back to the instance that owns it
///
/// Tried in order: the bound node recorded in status, the expected node name
/// in the spec, the hostname VPSie assigned.
///
/// # Arguments
///
/// * `instances` - The live owned instances
/// * `node` - The node name to resolve
pub fn resolve_instance<'a>(instances: &'a [VPSInstance], node: &str) -> Option<&'a VPSInstance> {
    instances
        .iter()
        .find(|instance| {
            instance
                .status
                .as_ref()
                .and_then(|status| status.node_name.as_deref())
                == Some(node)
        })
        .or_else(|| {
            instances
                .iter()
                .find(|instance| instance.spec.node_name.as_deref() == Some(node))
        })
        .or_else(|| {
            instances.iter().find(|instance| {
                instance
                    .status
                    .as_ref()
                    .and_then(|status| status.hostname.as_deref())
                    == Some(node)
            })
        })
}

/// Count pending pods the scheduler has marked unschedulable
///
/// Any group below its maximum may absorb these by raising its desired
/// count.
///
/// # Arguments
///
/// * `pods` - The pods to scan
pub fn unschedulable_pods(pods: &[Pod]) -> usize {
    pods.iter()
        .filter(|pod| {
            pod.status
                .as_ref()
                .map(|status| status.phase.as_deref() == Some("Pending"))
                .unwrap_or(false)
        })
        .filter(|pod| {
            pod.status
                .as_ref()
                .and_then(|status| status.conditions.as_ref())
                .map(|conditions| {
                    conditions.iter().any(|cond| {
                        cond.type_ == "PodScheduled"
                            && cond.status == "False"
                            && cond.reason.as_deref() == Some("Unschedulable")
                    })
                })
                .unwrap_or(false)
        })
        .count()
}

/// Refresh the condition list from the groups observed state
///
/// # Arguments
///
/// * `status` - The status holding the condition list
/// * `min` - The groups minimum size
/// * `max` - The groups maximum size
/// * `error` - The reconcile error to surface if any
pub fn update_conditions(
    status: &mut NodeGroupStatus,
    min: i32,
    max: i32,
    error: Option<(&str, &str)>,
) {
    let scaling = status.current_nodes != status.desired_nodes;
    conditions::set(
        &mut status.conditions,
        ConditionKind::Scaling,
        scaling,
        if scaling { "CapacityMismatch" } else { "CapacityMatched" },
        format!(
            "current {} desired {}",
            status.current_nodes, status.desired_nodes
        ),
    );
    let ready = !scaling && status.ready_nodes == status.current_nodes;
    conditions::set(
        &mut status.conditions,
        ConditionKind::Ready,
        ready,
        if ready { "AllInstancesReady" } else { "InstancesNotReady" },
        format!("{}/{} ready", status.ready_nodes, status.current_nodes),
    );
    match error {
        Some((reason, message)) => conditions::set(
            &mut status.conditions,
            ConditionKind::Error,
            true,
            reason,
            message,
        ),
        None => conditions::set(
            &mut status.conditions,
            ConditionKind::Error,
            false,
            "Reconciled",
            "",
        ),
    }
    conditions::set(
        &mut status.conditions,
        ConditionKind::AtMinCapacity,
        status.current_nodes <= min,
        "Capacity",
        format!("current {} min {}", status.current_nodes, min),
    );
    conditions::set(
        &mut status.conditions,
        ConditionKind::AtMaxCapacity,
        status.current_nodes >= max,
        "Capacity",
        format!("current {} max {}", status.current_nodes, max),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use vpsie_autoscaler::models::VPSInstanceStatus;

    /// Build an instance in the given phase
    fn instance(name: &str, phase: InstancePhase, age_secs: i64) -> VPSInstance {
        let mut instance = VPSInstance::new(name, Default::default());
        instance.metadata = ObjectMeta {
            name: Some(name.to_owned()),
            creation_timestamp: Some(Time(Utc::now() - Duration::seconds(age_secs))),
            ..Default::default()
        };
        instance.status = Some(VPSInstanceStatus {
            phase,
            ..Default::default()
        });
        instance
    }

    #[test]
    fn desired_seeds_at_min_and_stays_in_bounds() {
        assert_eq!(clamp_desired(None, 2, 5), 2);
        assert_eq!(clamp_desired(Some(3), 2, 5), 3);
        assert_eq!(clamp_desired(Some(9), 2, 5), 5);
        assert_eq!(clamp_desired(Some(0), 2, 5), 2);
    }

    #[test]
    fn fixed_size_pools_never_scale() {
        assert_eq!(decide(3, 3, 3, 3), ScaleDecision::Hold);
        // even a drifted desired value cannot move a fixed pool
        assert_eq!(clamp_desired(Some(5), 3, 3), 3);
    }

    #[test]
    fn scaling_respects_the_bounds() {
        assert_eq!(decide(1, 3, 1, 5), ScaleDecision::Up);
        assert_eq!(decide(5, 3, 1, 5), ScaleDecision::Down(2));
        // the floor caps the removal count
        assert_eq!(decide(3, 0, 2, 5), ScaleDecision::Down(1));
        // at max nothing more is added
        assert_eq!(decide(5, 7, 1, 5), ScaleDecision::Hold);
    }

    #[test]
    fn transitional_instances_gate_sequential_scale_up() {
        let settled = vec![
            instance("a", InstancePhase::Ready, 100),
            instance("b", InstancePhase::Failed, 100),
        ];
        assert!(!any_transitional(&settled));
        let busy = vec![
            instance("a", InstancePhase::Ready, 100),
            instance("b", InstancePhase::Joining, 10),
        ];
        assert!(any_transitional(&busy));
    }

    #[test]
    fn windows_block_until_both_have_elapsed() {
        let policy = ScaleDownPolicy {
            enabled: true,
            cooldown_seconds: 600,
            stabilization_seconds: 300,
        };
        let now = Utc::now();
        let recent = Time(now - Duration::seconds(60));
        let old = Time(now - Duration::seconds(3600));
        // a fresh group has nothing to wait on
        assert!(windows_elapsed(&policy, None, None, now));
        // a recent scale down holds the cooldown
        assert!(!windows_elapsed(&policy, None, Some(&recent), now));
        // a recent scale up holds the stabilization window
        assert!(!windows_elapsed(&policy, Some(&recent), None, now));
        assert!(windows_elapsed(&policy, Some(&old), Some(&old), now));
    }

    #[test]
    fn fallback_victims_prefer_broken_then_oldest() {
        let instances = vec![
            instance("young-ready", InstancePhase::Ready, 100),
            instance("old-ready", InstancePhase::Ready, 5000),
            instance("stuck", InstancePhase::Provisioning, 50),
        ];
        let victims = fallback_victims(&instances, 2);
        assert_eq!(victims, ["stuck", "old-ready"]);
    }

    #[test]
    fn preferred_offerings_must_be_offered() {
        let mut spec = NodeGroupSpec {
            offering_ids: vec!["m2.small".to_owned(), "m2.large".to_owned()],
            preferred_instance_type: Some("m2.large".to_owned()),
            ..Default::default()
        };
        assert_eq!(pick_offering(&spec), "m2.large");
        spec.preferred_instance_type = Some("m9.huge".to_owned());
        assert_eq!(pick_offering(&spec), "m2.small");
    }

    #[test]
    fn instance_names_carry_an_eight_hex_suffix() {
        let name = instance_name("pool-a");
        let suffix = name.strip_prefix("pool-a-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn min_equal_max_reports_both_capacity_conditions() {
        let mut status = NodeGroupStatus {
            current_nodes: 3,
            desired_nodes: 3,
            ready_nodes: 3,
            ..Default::default()
        };
        update_conditions(&mut status, 3, 3, None);
        assert!(conditions::holds(&status.conditions, ConditionKind::AtMinCapacity));
        assert!(conditions::holds(&status.conditions, ConditionKind::AtMaxCapacity));
        assert!(conditions::holds(&status.conditions, ConditionKind::Ready));
        assert!(!conditions::holds(&status.conditions, ConditionKind::Scaling));
    }

    #[test]
    fn conditions_track_errors_and_scaling() {
        let mut status = NodeGroupStatus {
            current_nodes: 1,
            desired_nodes: 3,
            ready_nodes: 1,
            ..Default::default()
        };
        update_conditions(&mut status, 1, 5, Some(("VPSieAPIError", "boom")));
        assert!(conditions::holds(&status.conditions, ConditionKind::Scaling));
        assert!(conditions::holds(&status.conditions, ConditionKind::Error));
        assert!(!conditions::holds(&status.conditions, ConditionKind::Ready));
        // a clean pass clears the error
        update_conditions(&mut status, 1, 5, None);
        assert!(!conditions::holds(&status.conditions, ConditionKind::Error));
    }
}
