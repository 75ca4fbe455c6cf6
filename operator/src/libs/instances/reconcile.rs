//! Drives a single VPSInstance from request to Ready and back out again
//!
//! The reconciler picks one action per invocation based on the current phase
//! and requeues. Long waits are repeated reconciles against bounded windows,
//! never loops inside a single call.

use chrono::prelude::*;
use chrono::Duration as ChronoDuration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{event, instrument, Level};
use vpsie_autoscaler::client::VmCreateRequest;
use vpsie_autoscaler::models::{
    labels, InstanceError, InstancePhase, InstanceResources, VPSInstance, VPSInstanceStatus,
};
use vpsie_autoscaler::client::VmStatus;
use vpsie_autoscaler::Error;

use super::super::events::reasons;
use super::super::k8s::{add_finalizer, patch_status, remove_finalizer, Nodes};
use super::super::Shared;
use super::{discover, join};

/// Everything a phase handler needs in one place
struct Ctx<'a> {
    /// The shared reconciler state
    shared: &'a Shared,
    /// The instance api in this namespace
    api: &'a Api<VPSInstance>,
    /// The instance being reconciled
    instance: &'a VPSInstance,
    /// The name of the instance
    name: String,
    /// The fast requeue interval
    fast: Duration,
    /// The settled requeue interval
    requeue: Duration,
}

impl Ctx<'_> {
    /// Move an instance into Failed recording why
    ///
    /// # Arguments
    ///
    /// * `status` - The status to mutate
    /// * `code` - The machine readable failure code
    /// * `message` - The human readable failure message
    /// * `retries` - How many retries were burned before failing
    async fn fail(
        &self,
        status: &mut VPSInstanceStatus,
        code: &str,
        message: String,
        retries: u32,
    ) {
        event!(Level::ERROR, instance = %self.name, code, msg = %message);
        self.shared
            .events
            .warning(
                &self.instance.object_ref(&()),
                reasons::PHASE_FAILED,
                format!("{code}: {message}"),
            )
            .await;
        status.phase = InstancePhase::Failed;
        status.error = Some(InstanceError::new(code, message, retries));
    }

    /// Write the discovered VM identity into the spec
    ///
    /// Spec writes go through a standard update. The caller then patches
    /// status on the fresh resource version, restoring what the update reset.
    ///
    /// # Arguments
    ///
    /// * `id` - The VM id to record
    /// * `ips` - The IP addresses to record
    /// * `snapshot` - The resource version the closing status patch rides on
    async fn record_identity(
        &self,
        id: i64,
        ips: Vec<String>,
        snapshot: &mut Option<String>,
    ) -> Result<(), Error> {
        let mut updated = self.instance.clone();
        updated.spec.vpsie_instance_id = id;
        updated.spec.ip_addresses = ips;
        updated.status = None;
        let replaced = self
            .api
            .replace(&self.name, &PostParams::default(), &updated)
            .await?;
        *snapshot = replaced.metadata.resource_version;
        Ok(())
    }
}

/// Handle an instance in the Pending phase by requesting its VM
async fn pending(
    ctx: &Ctx<'_>,
    status: &mut VPSInstanceStatus,
    snapshot: &mut Option<String>,
) -> Result<Action, Error> {
    let spec = &ctx.instance.spec;
    let req = VmCreateRequest {
        hostname: ctx.name.clone(),
        offering_id: spec.offering_id.clone(),
        datacenter_id: spec.datacenter_id.clone(),
        resource_identifier: spec.resource_identifier.clone(),
        os_image_id: spec.os_image_id.clone(),
        kubernetes_version: spec.kubernetes_version.clone(),
        ssh_key_ids: spec.ssh_key_ids.clone(),
        vpsie_group_id: spec.vpsie_group_id,
        project: spec.project.clone(),
    };
    match ctx
        .shared
        .provider
        .create_vm(&ctx.shared.shutdown, &req)
        .await
    {
        Ok(Some(id)) => {
            // the id came back synchronously, persist it right away
            ctx.record_identity(id, Vec::default(), snapshot).await?;
            status.phase = InstancePhase::Provisioning;
            status.error = None;
            ctx.shared
                .events
                .normal(
                    &ctx.instance.object_ref(&()),
                    reasons::INITIALIZING,
                    format!("VPSie accepted VM {id}"),
                )
                .await;
            Ok(Action::requeue(ctx.fast))
        }
        Ok(None) => {
            // accepted without an id, flag the instance for discovery
            let patch = json!({
                "metadata": {
                    "annotations": { labels::CREATION_REQUESTED: "true" }
                }
            });
            let patched = ctx
                .api
                .patch(
                    &ctx.name,
                    &Default::default(),
                    &kube::api::Patch::Merge(&patch),
                )
                .await?;
            // ride the fresh version so the closing status patch lands
            *snapshot = patched.metadata.resource_version;
            status.phase = InstancePhase::Provisioning;
            status.error = None;
            ctx.shared
                .events
                .normal(
                    &ctx.instance.object_ref(&()),
                    reasons::INITIALIZING,
                    "VPSie accepted the VM request asynchronously".to_owned(),
                )
                .await;
            Ok(Action::requeue(ctx.fast))
        }
        Err(error) if error.is_transient() => {
            // count the retry and fail out past the cap
            let retries = status
                .error
                .as_ref()
                .map(|existing| existing.retries + 1)
                .unwrap_or(1);
            let message = error.msg().unwrap_or_default();
            let cap = ctx.shared.conf.autoscaler.instances.create_retries;
            if retries >= cap {
                ctx.fail(status, "CreateFailed", message, retries).await;
                Ok(Action::requeue(ctx.requeue))
            } else {
                status.error = Some(InstanceError::new("CreateRetrying", message, retries));
                Ok(Action::requeue(Duration::from_secs(
                    ctx.shared.conf.autoscaler.controllers.error_requeue,
                )))
            }
        }
        Err(error) => {
            // permanent provider errors burn no retries
            ctx.fail(status, "CreateFailed", error.msg().unwrap_or_default(), 0)
                .await;
            Ok(Action::requeue(ctx.requeue))
        }
    }
}

/// Handle an instance waiting for its VM to exist and run
async fn provisioning(
    ctx: &Ctx<'_>,
    status: &mut VPSInstanceStatus,
    snapshot: &mut Option<String>,
) -> Result<Action, Error> {
    let conf = &ctx.shared.conf.autoscaler.instances;
    let spec = &ctx.instance.spec;
    // an id of zero with the discovery flag means the VM must be found first
    if spec.vpsie_instance_id == 0 {
        if !labels::creation_requested(&ctx.instance.metadata) {
            // no id and no pending request, nothing will ever show up
            ctx.fail(
                status,
                "ProvisionLost",
                "no VM id and no creation request recorded".to_owned(),
                0,
            )
            .await;
            return Ok(Action::requeue(ctx.requeue));
        }
        let created = status
            .created_at
            .clone()
            .map(|time| time.0)
            .unwrap_or_else(Utc::now);
        let window = ChronoDuration::seconds(conf.discovery_window as i64);
        return match discover::discover(ctx.shared, &ctx.name, created, window).await? {
            discover::Discovery::Found(vm) => {
                // persist the identity then remember what VPSie told us
                let ips = vm.ip.clone().into_iter().collect();
                ctx.record_identity(vm.id, ips, snapshot).await?;
                status.hostname = Some(vm.hostname);
                status.ip = vm.ip;
                Ok(Action::requeue(ctx.fast))
            }
            // transient, the VM may simply not be listed yet
            discover::Discovery::NotFound => Ok(Action::requeue(ctx.fast)),
            discover::Discovery::TimedOut => {
                ctx.fail(
                    status,
                    "DiscoveryTimeout",
                    format!("no VM surfaced within {}s", conf.discovery_window),
                    0,
                )
                .await;
                Ok(Action::requeue(ctx.requeue))
            }
        };
    }
    // poll the provider until the VM settles into running
    let vms = ctx.shared.provider.list_vms(&ctx.shared.shutdown).await?;
    match vms.iter().find(|vm| vm.id == spec.vpsie_instance_id) {
        Some(vm) if vm.status == VmStatus::Running => {
            status.hostname = Some(vm.hostname.clone());
            status.ip = vm.ip.clone();
            // enrich the status with the offerings shape if we can
            if let Ok(offering) = ctx
                .shared
                .provider
                .get_offering(&ctx.shared.shutdown, &spec.offering_id)
                .await
            {
                status.resources = Some(InstanceResources {
                    cpu: offering.cpu,
                    memory_mb: offering.memory_mb,
                    disk_gb: offering.disk_gb,
                });
            }
            status.phase = InstancePhase::Provisioned;
            Ok(Action::requeue(ctx.fast))
        }
        _ => Ok(Action::requeue(ctx.fast)),
    }
}

/// Handle a running VM that has not joined the cluster yet
async fn provisioned(
    ctx: &Ctx<'_>,
    status: &mut VPSInstanceStatus,
) -> Result<Action, Error> {
    let nodes = Nodes::new(&ctx.shared.client).list(&[]).await?;
    let spec = &ctx.instance.spec;
    let matched = join::match_node(
        &nodes.items,
        status.ip.as_deref(),
        spec.node_name.as_deref(),
        status.hostname.as_deref(),
    );
    match matched {
        Some(node) => {
            let node_name = node.metadata.name.clone().unwrap_or_default();
            // claim the node with our management labels
            join::bind(ctx.shared, ctx.instance, &node_name).await?;
            status.node_name = Some(node_name);
            status.phase = InstancePhase::Joining;
            Ok(Action::requeue(ctx.fast))
        }
        None => {
            let conf = &ctx.shared.conf.autoscaler.instances;
            if join_expired(status, conf.join_timeout) {
                ctx.fail(
                    status,
                    "JoinTimeout",
                    format!("no node joined within {}s", conf.join_timeout),
                    0,
                )
                .await;
                return Ok(Action::requeue(ctx.requeue));
            }
            Ok(Action::requeue(ctx.fast))
        }
    }
}

/// Handle an instance whose node exists but is not Ready yet
async fn joining(ctx: &Ctx<'_>, status: &mut VPSInstanceStatus) -> Result<Action, Error> {
    let node_name = match status.node_name.clone() {
        Some(node_name) => node_name,
        // lost the binding somehow, go hunting again next pass
        None => return Ok(Action::requeue(ctx.fast)),
    };
    let nodes = Nodes::new(&ctx.shared.client);
    match nodes.get_opt(&node_name).await? {
        Some(node) => {
            // labels may have been wiped by a kubelet re-register
            if !labels::is_managed(&node.metadata) {
                join::bind(ctx.shared, ctx.instance, &node_name).await?;
                return Ok(Action::requeue(ctx.fast));
            }
            if Nodes::is_ready(&node) {
                status.phase = InstancePhase::Ready;
                status.ready_at = Some(Time(Utc::now()));
                status.error = None;
                return Ok(Action::requeue(ctx.requeue));
            }
            let conf = &ctx.shared.conf.autoscaler.instances;
            if join_expired(status, conf.join_timeout) {
                ctx.fail(
                    status,
                    "JoinTimeout",
                    format!("node {node_name} not Ready within {}s", conf.join_timeout),
                    0,
                )
                .await;
                return Ok(Action::requeue(ctx.requeue));
            }
            Ok(Action::requeue(ctx.fast))
        }
        None => Ok(Action::requeue(ctx.fast)),
    }
}

/// Handle a sticky Failed instance
///
/// Failed instances are never revived. When a TTL is configured they are
/// deleted after it passes so the pool reconciler can backfill.
async fn failed(ctx: &Ctx<'_>, status: &VPSInstanceStatus) -> Result<Action, Error> {
    if let Some(ttl) = ctx.shared.conf.autoscaler.instances.failed_ttl {
        let since = status
            .error
            .as_ref()
            .and_then(|error| error.timestamp.clone())
            .or_else(|| status.created_at.clone());
        if let Some(since) = since {
            if Utc::now() - since.0 > ChronoDuration::seconds(ttl as i64) {
                event!(Level::INFO, instance = %ctx.name, msg = "failed instance ttl expired");
                match ctx.api.delete(&ctx.name, &Default::default()).await {
                    Ok(_) => (),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => (),
                    Err(error) => return Err(error.into()),
                }
            }
        }
    }
    Ok(Action::requeue(ctx.requeue))
}

/// Check whether the join window has run out
fn join_expired(status: &VPSInstanceStatus, timeout: u64) -> bool {
    status
        .created_at
        .as_ref()
        .map(|created| Utc::now() - created.0 > ChronoDuration::seconds(timeout as i64))
        .unwrap_or(false)
}

/// Walk a deleted instance through drain, provider delete, and release
///
/// One teardown step per invocation. The finalizer only lifts once the
/// provider side VM is confirmed gone or was never created.
async fn teardown(ctx: &Ctx<'_>, snapshot: Option<&String>) -> Result<Action, Error> {
    let mut status = ctx.instance.status.clone().unwrap_or_default();
    match status.phase {
        // provider side is confirmed gone, let the object go
        InstancePhase::Deleting => {
            remove_finalizer(
                ctx.api,
                &ctx.name,
                &ctx.instance.metadata,
                labels::INSTANCE_FINALIZER,
            )
            .await?;
            return Ok(Action::await_change());
        }
        InstancePhase::Terminating => {
            let id = ctx.instance.spec.vpsie_instance_id;
            // an id of zero means the VM never resolved, nothing to delete
            if id != 0 {
                ctx.shared
                    .provider
                    .delete_vm(&ctx.shared.shutdown, id)
                    .await?;
            }
            // the node object lingers after the VM dies, clean it up
            if let Some(node) = status.node_name.as_deref() {
                Nodes::new(&ctx.shared.client).delete(node).await?;
            }
            status.deleted_at = Some(Time(Utc::now()));
            status.phase = InstancePhase::Deleting;
        }
        InstancePhase::Draining => {
            // empty the bound node before the VM goes away
            if let Some(node) = status.node_name.clone() {
                ctx.shared.engine().drain(&node, &ctx.shared.shutdown).await?;
            }
            status.phase = InstancePhase::Terminating;
        }
        // every live phase funnels into the drain
        _ => {
            status.phase = InstancePhase::Draining;
        }
    }
    patch_status(ctx.api, &ctx.name, snapshot, &status).await?;
    Ok(Action::requeue(ctx.fast))
}

/// Reconcile a single VPSInstance
///
/// # Arguments
///
/// * `instance` - The instance being reconciled
/// * `shared` - The shared reconciler state
#[instrument(name = "instances::reconcile", skip_all, fields(instance = %instance.name_any()), err(Debug))]
pub async fn reconcile(instance: Arc<VPSInstance>, shared: Arc<Shared>) -> Result<Action, Error> {
    let namespace = match instance.namespace() {
        Some(namespace) => namespace,
        None => return Err(Error::new("VPSInstance resources must be namespaced")),
    };
    // never touch anything without the managed gate
    if !labels::is_managed(&instance.metadata) {
        return Ok(Action::await_change());
    }
    let api: Api<VPSInstance> = Api::namespaced(shared.client.clone(), &namespace);
    let ctx = Ctx {
        shared: &shared,
        api: &api,
        instance: &instance,
        name: instance.name_any(),
        fast: Duration::from_secs(shared.conf.autoscaler.controllers.fast_requeue),
        requeue: Duration::from_secs(shared.conf.autoscaler.controllers.requeue),
    };
    // snapshot before any mutation, the closing patch rides on this version
    let mut snapshot = instance.metadata.resource_version.clone();
    // teardown runs its own single step per pass
    if instance.deletion_requested() {
        return teardown(&ctx, snapshot.as_ref()).await;
    }
    // the finalizer must be on before the provider holds anything for us
    if add_finalizer(&api, &ctx.name, &instance.metadata, labels::INSTANCE_FINALIZER).await? {
        return Ok(Action::requeue(ctx.fast));
    }
    let mut status = instance.status.clone().unwrap_or_default();
    status.observed_generation = instance.metadata.generation.unwrap_or_default();
    if status.created_at.is_none() {
        status.created_at = Some(Time(Utc::now()));
    }
    // one action per invocation keyed off the phase
    let action = match status.phase {
        InstancePhase::Pending => pending(&ctx, &mut status, &mut snapshot).await?,
        InstancePhase::Provisioning => provisioning(&ctx, &mut status, &mut snapshot).await?,
        InstancePhase::Provisioned => provisioned(&ctx, &mut status).await?,
        InstancePhase::Joining => joining(&ctx, &mut status).await?,
        InstancePhase::Ready => Action::requeue(ctx.requeue),
        InstancePhase::Failed => failed(&ctx, &status).await?,
        // teardown phases without a deletion timestamp settle on the next delete
        InstancePhase::Draining | InstancePhase::Terminating | InstancePhase::Deleting => {
            Action::requeue(ctx.fast)
        }
    };
    // commit the status on the snapshot version, conflicts requeue
    match patch_status(&api, &ctx.name, snapshot.as_ref(), &status).await {
        Ok(_) => Ok(action),
        Err(error) if error.is_conflict() => {
            event!(Level::INFO, instance = %ctx.name, msg = "status conflict, requeueing");
            Ok(Action::requeue(ctx.fast))
        }
        Err(error) => Err(error),
    }
}

/// Handle errors in the reconcile process
///
/// # Arguments
///
/// * `instance` - The instance whose reconcile failed
/// * `error` - The error that was hit
/// * `shared` - The shared reconciler state
pub fn error_policy(
    instance: Arc<VPSInstance>,
    error: &Error,
    shared: Arc<Shared>,
) -> Action {
    if error.is_conflict() {
        return Action::requeue(Duration::from_secs(
            shared.conf.autoscaler.controllers.fast_requeue,
        ));
    }
    event!(
        Level::ERROR,
        instance = %instance.name_any(),
        error = %error,
        msg = "reconcile failed"
    );
    Action::requeue(Duration::from_secs(
        shared.conf.autoscaler.controllers.error_requeue,
    ))
}
