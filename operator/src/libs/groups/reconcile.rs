//! Reconciles node groups toward their desired capacity
//!
//! Each invocation performs at most one concrete action (create one
//! instance, remove one instance, or none) and requeues. Progress comes from
//! repeated reconciles, never from loops inside one.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, PostParams};
use kube::{Resource, ResourceExt};
use kube::runtime::controller::Action;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{event, instrument, Level};
use vpsie_autoscaler::client::VpsieNodeGroupRequest;
use vpsie_autoscaler::models::{
    conditions::{self, ConditionKind},
    labels, NodeGroup, NodeGroupStatus, VPSInstance,
};
use vpsie_autoscaler::Error;

use super::super::events::reasons;
use super::super::k8s::{add_finalizer, patch_status, remove_finalizer, Pods};
use super::super::Shared;
use super::capacity::{self, ScaleDecision};

/// Build the list params selecting the live members of a group
///
/// # Arguments
///
/// * `group` - The name of the group to select for
fn owned_params(group: &str) -> ListParams {
    ListParams::default().labels(&format!(
        "{}=true,{}={}",
        labels::MANAGED,
        labels::NODE_GROUP,
        group
    ))
}

/// List the owned instances that still hold capacity
///
/// Instances with a deletion timestamp are already terminating. Counting
/// them would double subtract capacity on repeated reconciles.
///
/// # Arguments
///
/// * `api` - The instance api to list through
/// * `group` - The name of the group to list for
async fn list_owned(api: &Api<VPSInstance>, group: &str) -> Result<Vec<VPSInstance>, Error> {
    let listing = api.list(&owned_params(group)).await?;
    Ok(listing
        .items
        .into_iter()
        .filter(|instance| instance.metadata.deletion_timestamp.is_none())
        .collect())
}

/// Delete every owned instance then lift the group finalizer
///
/// # Arguments
///
/// * `group` - The group being torn down
/// * `groups_api` - The group api to patch through
/// * `instances_api` - The instance api to delete through
/// * `fast` - The fast requeue interval
async fn cascade_delete(
    group: &NodeGroup,
    groups_api: &Api<NodeGroup>,
    instances_api: &Api<VPSInstance>,
    fast: Duration,
) -> Result<Action, Error> {
    let name = group.name_any();
    let listing = instances_api.list(&owned_params(&name)).await?;
    if listing.items.is_empty() {
        // nothing left, the group may go
        remove_finalizer(groups_api, &name, &group.metadata, labels::GROUP_FINALIZER).await?;
        return Ok(Action::await_change());
    }
    // push a delete at everything not already on its way out
    for instance in &listing.items {
        if instance.metadata.deletion_timestamp.is_some() {
            continue;
        }
        if let Some(instance_name) = instance.metadata.name.as_deref() {
            match instances_api.delete(instance_name, &Default::default()).await {
                Ok(_) => (),
                Err(kube::Error::Api(ae)) if ae.code == 404 => (),
                Err(error) => return Err(error.into()),
            }
        }
    }
    Ok(Action::requeue(fast))
}

/// Make sure a provider side node group exists and learn its id
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `group` - The group needing a provider side id
async fn ensure_vpsie_group(shared: &Shared, group: &NodeGroup) -> Result<(i64, bool), Error> {
    let name = group.name_any();
    let cluster = &group.spec.resource_identifier;
    // reuse an existing provider group carrying our name
    let existing = shared
        .provider
        .list_k8s_groups(&shared.shutdown, cluster)
        .await?;
    if let Some(found) = existing.iter().find(|candidate| candidate.name == name) {
        return Ok((found.id, false));
    }
    // create it, then list again to learn the id VPSie assigned
    let req = VpsieNodeGroupRequest {
        name: name.clone(),
        resource_identifier: cluster.clone(),
        kube_size_id: group.spec.kube_size_id.clone(),
        datacenter_id: group.spec.datacenter_id.clone(),
    };
    shared.provider.create_k8s_group(&shared.shutdown, &req).await?;
    let listing = shared
        .provider
        .list_k8s_groups(&shared.shutdown, cluster)
        .await?;
    match listing.iter().find(|candidate| candidate.name == name) {
        Some(found) => Ok((found.id, true)),
        None => Err(Error::new(format!(
            "VPSie did not report group {name} after creation"
        ))),
    }
}

/// Create exactly one new instance under a group
///
/// # Arguments
///
/// * `group` - The group to create under
/// * `instances_api` - The instance api to create through
/// * `namespace` - The namespace to create in
/// * `vpsie_group_id` - The provider side group id to attach to
async fn create_instance(
    group: &NodeGroup,
    instances_api: &Api<VPSInstance>,
    namespace: &str,
    vpsie_group_id: i64,
) -> Result<String, Error> {
    let offering = capacity::pick_offering(&group.spec).to_owned();
    let instance = capacity::new_instance(group, namespace, vpsie_group_id, &offering);
    let name = instance.metadata.name.clone().unwrap_or_default();
    instances_api.create(&PostParams::default(), &instance).await?;
    Ok(name)
}

/// Drain and delete at most one instance of a group
///
/// The engine picks and empties the safest candidate. When the engine itself
/// fails the group falls back to deleting broken instances first, then the
/// oldest, without a drain.
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `group` - The group scaling down
/// * `instances` - The live owned instances
/// * `instances_api` - The instance api to delete through
async fn scale_down_one(
    shared: &Shared,
    group: &NodeGroup,
    instances: &[VPSInstance],
    instances_api: &Api<VPSInstance>,
) -> Result<bool, Error> {
    let name = group.name_any();
    let engine = shared.engine();
    let victim = match engine.candidates(&name, false, &shared.shutdown).await {
        Ok(candidates) => match candidates.first() {
            Some(candidate) => {
                // empty the node before the instance teardown starts
                engine.drain(&candidate.node, &shared.shutdown).await?;
                match capacity::resolve_instance(instances, &candidate.node) {
                    Some(instance) => instance.metadata.name.clone(),
                    None => {
                        // a drained node we cannot map back is an operational failure
                        event!(
                            Level::ERROR,
                            counter = "scale_down_unresolved_total",
                            node = %candidate.node,
                            msg = "drained node resolves to no instance"
                        );
                        None
                    }
                }
            }
            // every node is blocked, correct behavior is to do nothing
            None => None,
        },
        Err(error) => {
            event!(
                Level::WARN,
                msg = "scale down engine unavailable, using fallback",
                error = %error
            );
            capacity::fallback_victims(instances, 1).into_iter().next()
        }
    };
    match victim {
        Some(victim) => {
            match instances_api.delete(&victim, &Default::default()).await {
                Ok(_) => (),
                Err(kube::Error::Api(ae)) if ae.code == 404 => (),
                Err(error) => return Err(error.into()),
            }
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Write the status back guarded by the pre mutation snapshot
///
/// Returns false when someone else won the write. The caller requeues and
/// acts on the fresh object instead of retrying in line.
async fn commit(
    api: &Api<NodeGroup>,
    name: &str,
    snapshot: Option<&String>,
    status: &NodeGroupStatus,
) -> Result<bool, Error> {
    match patch_status(api, name, snapshot, status).await {
        Ok(_) => Ok(true),
        Err(error) if error.is_conflict() => {
            event!(Level::INFO, group = name, msg = "status conflict, requeueing");
            Ok(false)
        }
        Err(error) => Err(error),
    }
}

/// Pick the error condition reason for a failure
fn failure_reason(error: &Error) -> &'static str {
    match error {
        Error::K8s(_) | Error::K8sConfig(_) => "KubernetesAPIError",
        _ => "VPSieAPIError",
    }
}

/// Reconcile a single node group
///
/// # Arguments
///
/// * `group` - The group being reconciled
/// * `shared` - The shared reconciler state
#[instrument(name = "groups::reconcile", skip_all, fields(group = %group.name_any()), err(Debug))]
pub async fn reconcile(group: Arc<NodeGroup>, shared: Arc<Shared>) -> Result<Action, Error> {
    let requeue = Duration::from_secs(shared.conf.autoscaler.controllers.requeue);
    let fast = Duration::from_secs(shared.conf.autoscaler.controllers.fast_requeue);
    // groups must be namespaced so their instances have a home
    let namespace = match group.namespace() {
        Some(namespace) => namespace,
        None => return Err(Error::new("NodeGroup resources must be namespaced")),
    };
    let name = group.name_any();
    // never touch anything without the managed gate
    if !labels::is_managed(&group.metadata) {
        return Ok(Action::await_change());
    }
    let groups_api: Api<NodeGroup> = Api::namespaced(shared.client.clone(), &namespace);
    let instances_api: Api<VPSInstance> = Api::namespaced(shared.client.clone(), &namespace);
    // tear everything down once deletion is requested
    if group.deletion_requested() {
        return cascade_delete(&group, &groups_api, &instances_api, fast).await;
    }
    // the finalizer must be on before we create anything
    if add_finalizer(&groups_api, &name, &group.metadata, labels::GROUP_FINALIZER).await? {
        return Ok(Action::requeue(fast));
    }
    // snapshot before any mutation, the closing patch rides on this version
    let snapshot = group.metadata.resource_version.clone();
    let mut status = group.status.clone().unwrap_or_default();
    status.observed_generation = group.metadata.generation.unwrap_or_default();
    // a broken spec freezes scaling until the user edits it
    if let Err(error) = group.spec.validate() {
        let message = error.msg().unwrap_or_default();
        shared
            .events
            .warning(&group.object_ref(&()), reasons::VALIDATION_FAILED, message.clone())
            .await;
        conditions::set(
            &mut status.conditions,
            ConditionKind::Error,
            true,
            "ValidationFailed",
            message,
        );
        commit(&groups_api, &name, snapshot.as_ref(), &status).await?;
        return Ok(Action::await_change());
    }
    // make sure the provider side group exists before any VM is requested
    if status.vpsie_group_id == 0 {
        match ensure_vpsie_group(&shared, &group).await {
            Ok((id, created)) => {
                status.vpsie_group_id = id;
                if created {
                    shared
                        .events
                        .normal(
                            &group.object_ref(&()),
                            reasons::GROUP_CREATED,
                            format!("created VPSie node group {id} for {name}"),
                        )
                        .await;
                }
            }
            Err(error) => {
                let message = error.msg().unwrap_or_default();
                conditions::set(
                    &mut status.conditions,
                    ConditionKind::Error,
                    true,
                    failure_reason(&error),
                    message,
                );
                // persist what we know, then back off through the error policy
                let _ = commit(&groups_api, &name, snapshot.as_ref(), &status).await;
                return Err(error);
            }
        }
    }
    // live owned instances only, terminating ones no longer hold capacity
    let instances = list_owned(&instances_api, &name).await?;
    status.current_nodes = instances.len() as i32;
    status.ready_nodes = capacity::ready_count(&instances);
    status.instances = capacity::summarize(&instances);
    let min = group.spec.min_nodes;
    let max = group.spec.max_nodes;
    let previous = group.status.as_ref().map(|status| status.desired_nodes);
    let mut desired = capacity::clamp_desired(previous, min, max);
    let current = status.current_nodes;
    // at most one concrete action below
    let mut acted = false;
    let mut failure: Option<Error> = None;
    match capacity::decide(current, desired, min, max) {
        ScaleDecision::Up => {
            if capacity::any_transitional(&instances) {
                // sequential scale up, one instance in flight at a time
                status.desired_nodes = desired;
                capacity::update_conditions(&mut status, min, max, None);
                commit(&groups_api, &name, snapshot.as_ref(), &status).await?;
                return Ok(Action::requeue(fast));
            }
            match create_instance(&group, &instances_api, &namespace, status.vpsie_group_id).await {
                Ok(created) => {
                    shared
                        .events
                        .normal(
                            &group.object_ref(&()),
                            reasons::SCALING_UP,
                            format!("created instance {created} ({current} -> {desired})"),
                        )
                        .await;
                    let now = Time(Utc::now());
                    status.last_scale_up_time = Some(now.clone());
                    status.last_scale_time = Some(now);
                    acted = true;
                }
                Err(error) => {
                    shared
                        .events
                        .warning(
                            &group.object_ref(&()),
                            reasons::SCALE_UP_FAILED,
                            error.msg().unwrap_or_default(),
                        )
                        .await;
                    failure = Some(error);
                }
            }
        }
        ScaleDecision::Down(_) => {
            match scale_down_one(&shared, &group, &instances, &instances_api).await {
                Ok(true) => {
                    shared
                        .events
                        .normal(
                            &group.object_ref(&()),
                            reasons::SCALING_DOWN,
                            format!("removing one instance ({current} -> {desired})"),
                        )
                        .await;
                    let now = Time(Utc::now());
                    status.last_scale_down_time = Some(now.clone());
                    status.last_scale_time = Some(now);
                    acted = true;
                }
                Ok(false) => {
                    shared
                        .events
                        .normal(
                            &group.object_ref(&()),
                            reasons::SCALE_DOWN_BLOCKED,
                            "no instance can be removed safely".to_owned(),
                        )
                        .await;
                }
                Err(error) => failure = Some(error),
            }
        }
        ScaleDecision::Hold => {
            let policy = &group.spec.scale_down_policy;
            let windows = capacity::windows_elapsed(
                policy,
                status.last_scale_up_time.as_ref(),
                status.last_scale_down_time.as_ref(),
                Utc::now(),
            );
            if policy.enabled && current > min && windows {
                // ask the engine whether anything is going to waste
                let engine = shared.engine();
                match engine.candidates(&name, true, &shared.shutdown).await {
                    Ok(candidates) if !candidates.is_empty() => {
                        desired = (current - candidates.len() as i32).max(min);
                        match scale_down_one(&shared, &group, &instances, &instances_api).await {
                            Ok(true) => {
                                shared
                                    .events
                                    .normal(
                                        &group.object_ref(&()),
                                        reasons::SCALING_DOWN,
                                        format!(
                                            "{} underutilized nodes ({current} -> {desired})",
                                            candidates.len()
                                        ),
                                    )
                                    .await;
                                let now = Time(Utc::now());
                                status.last_scale_down_time = Some(now.clone());
                                status.last_scale_time = Some(now);
                                acted = true;
                            }
                            Ok(false) => (),
                            Err(error) => failure = Some(error),
                        }
                    }
                    Ok(_) => (),
                    Err(error) => {
                        event!(Level::WARN, group = %name, error = %error, msg = "candidate scan failed");
                    }
                }
            }
            // pending pods the scheduler gave up on may raise desired
            if !acted && failure.is_none() && current < max {
                let pods = Pods::new(&shared.client).list_all().await?;
                if capacity::unschedulable_pods(&pods.items) > 0 {
                    desired = (desired + 1).min(max);
                }
            }
        }
    }
    status.desired_nodes = desired;
    let condition_error = failure
        .as_ref()
        .map(|error| (failure_reason(error), error.msg().unwrap_or_default()));
    capacity::update_conditions(
        &mut status,
        min,
        max,
        condition_error
            .as_ref()
            .map(|(reason, message)| (*reason, message.as_str())),
    );
    if !commit(&groups_api, &name, snapshot.as_ref(), &status).await? {
        return Ok(Action::requeue(fast));
    }
    // surface the failure for backoff after the status made it out
    if let Some(error) = failure {
        return Err(error);
    }
    Ok(Action::requeue(if acted { fast } else { requeue }))
}

/// Handle errors in the reconcile process
///
/// Conflicts requeue immediately without marking an error, everything else
/// backs off.
///
/// # Arguments
///
/// * `group` - The group whose reconcile failed
/// * `error` - The error that was hit
/// * `shared` - The shared reconciler state
pub fn error_policy(group: Arc<NodeGroup>, error: &Error, shared: Arc<Shared>) -> Action {
    if error.is_conflict() {
        event!(Level::INFO, group = %group.name_any(), msg = "conflict, requeueing");
        return Action::requeue(Duration::from_secs(
            shared.conf.autoscaler.controllers.fast_requeue,
        ));
    }
    event!(
        Level::ERROR,
        group = %group.name_any(),
        error = %error,
        msg = "reconcile failed"
    );
    Action::requeue(Duration::from_secs(
        shared.conf.autoscaler.controllers.error_requeue,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpsie_autoscaler::models::{VPSInstanceSpec, VPSInstanceStatus};

    /// Build an instance bound to the given node identifiers
    fn bound(
        name: &str,
        status_node: Option<&str>,
        spec_node: Option<&str>,
        hostname: Option<&str>,
    ) -> VPSInstance {
        let mut instance = VPSInstance::new(
            name,
            VPSInstanceSpec {
                node_name: spec_node.map(str::to_owned),
                ..Default::default()
            },
        );
        instance.status = Some(VPSInstanceStatus {
            node_name: status_node.map(str::to_owned),
            hostname: hostname.map(str::to_owned),
            ..Default::default()
        });
        instance
    }

    #[test]
    fn resolution_tries_status_then_spec_then_hostname() {
        let instances = vec![
            bound("a", Some("node-1"), None, None),
            bound("b", None, Some("node-2"), None),
            bound("c", None, None, Some("node-3")),
        ];
        let hit = |node: &str| {
            capacity::resolve_instance(&instances, node)
                .and_then(|instance| instance.metadata.name.clone())
                .unwrap()
        };
        assert_eq!(hit("node-1"), "a");
        assert_eq!(hit("node-2"), "b");
        assert_eq!(hit("node-3"), "c");
        assert!(capacity::resolve_instance(&instances, "node-9").is_none());
    }

    #[test]
    fn status_binding_wins_over_hostname() {
        // one node name showing up under different keys resolves by priority
        let instances = vec![
            bound("by-hostname", None, None, Some("node-x")),
            bound("by-status", Some("node-x"), None, None),
        ];
        let found = capacity::resolve_instance(&instances, "node-x").unwrap();
        assert_eq!(found.metadata.name.as_deref(), Some("by-status"));
    }
}
