//! Executes rebalance plans batch by batch with rollback

use chrono::prelude::*;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{event, instrument, Level};
use vpsie_autoscaler::models::{labels, InstancePhase, NodeGroup, VPSInstance};
use vpsie_autoscaler::Error;

use super::super::groups::capacity;
use super::super::k8s::Nodes;
use super::super::Shared;
use super::analyzer::RebalanceCandidate;
use super::planner::{BatchOp, RebalancePlan, RollbackStep};
use super::safety;

/// A single failed operation during plan execution
#[derive(Debug, Clone)]
pub struct NodeFailure {
    /// The node the operation was for
    pub name: String,
    /// The operation that failed
    pub operation: String,
    /// The error that was hit
    pub error: String,
    /// When the failure happened
    pub timestamp: DateTime<Utc>,
}

impl NodeFailure {
    /// Record a failed operation
    fn new(name: &str, operation: &str, error: &Error) -> Self {
        NodeFailure {
            name: name.to_owned(),
            operation: operation.to_owned(),
            error: error.msg().unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }
}

/// What a plan execution accomplished
#[derive(Debug, Default, Clone)]
pub struct ExecutionReport {
    /// The original nodes that were fully replaced
    pub replaced: Vec<String>,
    /// Every operation that failed
    pub failures: Vec<NodeFailure>,
    /// Whether the rollback plan ran
    pub rolled_back: bool,
}

/// The mutable bookkeeping rollback needs
#[derive(Default)]
struct ExecState {
    /// Replacement instance names keyed by the original node
    provisioned: HashMap<String, String>,
    /// Original nodes that were cordoned
    cordoned: Vec<String>,
    /// Original nodes that were terminated
    terminated: HashSet<String>,
}

/// Wait for a replacement instance to reach Ready
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `api` - The instance api to poll through
/// * `name` - The name of the instance to wait on
async fn wait_ready(
    shared: &Shared,
    api: &Api<VPSInstance>,
    name: &str,
) -> Result<(), Error> {
    let timeout = shared.conf.autoscaler.instances.provision_timeout;
    let interval = shared.conf.autoscaler.controllers.fast_requeue;
    let deadline = Instant::now() + Duration::from_secs(timeout);
    loop {
        if let Some(instance) = api.get_opt(name).await? {
            match instance.phase() {
                InstancePhase::Ready => return Ok(()),
                InstancePhase::Failed => {
                    return Err(Error::new(format!("replacement {name} failed")));
                }
                _ => (),
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::new(format!(
                "replacement {name} not Ready within {timeout}s"
            )));
        }
        tokio::select! {
            _ = shared.shutdown.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
        }
    }
}

/// Provision a replacement instance for a candidate
async fn provision(
    group: &NodeGroup,
    api: &Api<VPSInstance>,
    namespace: &str,
    candidate: &RebalanceCandidate,
) -> Result<String, Error> {
    let vpsie_group_id = group
        .status
        .as_ref()
        .map(|status| status.vpsie_group_id)
        .unwrap_or(0);
    let instance = capacity::new_instance(group, namespace, vpsie_group_id, &candidate.target.id);
    let name = instance.metadata.name.clone().unwrap_or_default();
    api.create(&PostParams::default(), &instance).await?;
    Ok(name)
}

/// Terminate an original node and its backing instance
async fn terminate(
    shared: &Shared,
    api: &Api<VPSInstance>,
    group: &str,
    node: &str,
) -> Result<(), Error> {
    // the node object goes first so nothing lands back on it
    Nodes::new(&shared.client).delete(node).await?;
    // the owning instance carries the provider side delete in its teardown
    let params = kube::api::ListParams::default().labels(&format!(
        "{}=true,{}={}",
        labels::MANAGED,
        labels::NODE_GROUP,
        group
    ));
    let listing = api.list(&params).await?;
    match capacity::resolve_instance(&listing.items, node) {
        Some(instance) => {
            if let Some(name) = instance.metadata.name.as_deref() {
                match api.delete(name, &Default::default()).await {
                    Ok(_) => (),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => (),
                    Err(error) => return Err(error.into()),
                }
            }
            Ok(())
        }
        None => Err(Error::new(format!("node {node} resolves to no instance"))),
    }
}

/// Replace one candidate node end to end
///
/// Returns false when the guard found nothing to do.
async fn replace_one(
    shared: &Shared,
    group: &NodeGroup,
    api: &Api<VPSInstance>,
    namespace: &str,
    plan_group: &str,
    candidate: &RebalanceCandidate,
    state: &mut ExecState,
) -> Result<bool, NodeFailure> {
    let nodes = Nodes::new(&shared.client);
    let node = nodes
        .get_opt(&candidate.node)
        .await
        .map_err(|error| NodeFailure::new(&candidate.node, "lookup", &error))?;
    let node = match node {
        Some(node) => node,
        // the node disappeared under us, nothing to replace
        None => return Ok(false),
    };
    // same group and already on the target offering means a no-op
    if labels::group_of(&node.metadata) == Some(plan_group)
        && labels::offering_of(&node.metadata) == Some(candidate.target.id.as_str())
    {
        return Ok(false);
    }
    // bring the replacement all the way up first
    let replacement = provision(group, api, namespace, candidate)
        .await
        .map_err(|error| NodeFailure::new(&candidate.node, "provision", &error))?;
    state
        .provisioned
        .insert(candidate.node.clone(), replacement.clone());
    wait_ready(shared, api, &replacement)
        .await
        .map_err(|error| NodeFailure::new(&candidate.node, "provision", &error))?;
    // move the workload off the original
    let engine = shared.engine();
    state.cordoned.push(candidate.node.clone());
    engine
        .drain(&candidate.node, &shared.shutdown)
        .await
        .map_err(|error| NodeFailure::new(&candidate.node, "drain", &error))?;
    // and retire it
    terminate(shared, api, plan_group, &candidate.node)
        .await
        .map_err(|error| NodeFailure::new(&candidate.node, "terminate", &error))?;
    state.terminated.insert(candidate.node.clone());
    Ok(true)
}

/// Run the rollback plan over whatever execution left behind
async fn rollback(
    shared: &Shared,
    plan: &RebalancePlan,
    state: &ExecState,
    report: &mut ExecutionReport,
) {
    let nodes = Nodes::new(&shared.client);
    let api: Api<VPSInstance> =
        Api::namespaced(shared.client.clone(), &shared.conf.autoscaler.namespace);
    for step in &plan.rollback.steps {
        match step {
            RollbackStep::Pause => {
                event!(Level::WARN, group = %plan.group, msg = "rolling back rebalance");
            }
            RollbackStep::UncordonOriginals => {
                // fenced but surviving originals go back into rotation
                for node in &state.cordoned {
                    if state.terminated.contains(node) {
                        continue;
                    }
                    if let Err(error) = nodes.uncordon(node).await {
                        event!(Level::WARN, node = %node, error = %error, msg = "uncordon failed");
                    }
                }
            }
            RollbackStep::TerminateOrphans => {
                // replacements that never took over are pure cost
                for (original, replacement) in &state.provisioned {
                    if state.terminated.contains(original) {
                        continue;
                    }
                    match api.delete(replacement, &Default::default()).await {
                        Ok(_) => (),
                        Err(kube::Error::Api(ae)) if ae.code == 404 => (),
                        Err(error) => {
                            event!(
                                Level::WARN,
                                instance = %replacement,
                                error = %error,
                                msg = "orphan delete failed"
                            );
                        }
                    }
                }
            }
            RollbackStep::VerifyHealth => {
                let healthy = match nodes.list(&[]).await {
                    Ok(listing) => safety::cluster_healthy(
                        &listing.items,
                        shared.conf.autoscaler.rebalance.min_healthy_percent,
                    ),
                    Err(_) => false,
                };
                event!(Level::INFO, group = %plan.group, healthy, msg = "post rollback health");
            }
            RollbackStep::MarkFailed => {
                report.rolled_back = true;
            }
        }
    }
}

/// Execute a rebalance plan batch by batch
///
/// Failures are recorded per node. Depending on config a failure either
/// skips to the next candidate or aborts the plan through the rollback
/// steps.
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `group` - The group the plan replaces nodes in
/// * `plan` - The plan to execute
#[instrument(name = "rebalance::execute", skip_all, fields(group = %plan.group), err(Debug))]
pub async fn execute(
    shared: &Shared,
    group: &NodeGroup,
    plan: RebalancePlan,
) -> Result<ExecutionReport, Error> {
    let namespace = match group.namespace() {
        Some(namespace) => namespace,
        None => return Err(Error::new("NodeGroup resources must be namespaced")),
    };
    let api: Api<VPSInstance> = Api::namespaced(shared.client.clone(), &namespace);
    let nodes = Nodes::new(&shared.client);
    let engine = shared.engine();
    let rollback_on_failure = shared.conf.autoscaler.rebalance.rollback_on_failure;
    let mut report = ExecutionReport::default();
    let mut state = ExecState::default();
    'batches: for batch in &plan.batches {
        for node in &batch.nodes {
            if shared.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let candidate = match plan.candidates.iter().find(|cand| &cand.node == node) {
                Some(candidate) => candidate,
                None => continue,
            };
            let result: Result<(), NodeFailure> = match batch.op {
                BatchOp::Replace => {
                    match replace_one(
                        shared, group, &api, &namespace, &plan.group, candidate, &mut state,
                    )
                    .await
                    {
                        Ok(true) => {
                            report.replaced.push(node.clone());
                            Ok(())
                        }
                        Ok(false) => Ok(()),
                        Err(failure) => Err(failure),
                    }
                }
                BatchOp::Provision => {
                    match provision(group, &api, &namespace, candidate).await {
                        Ok(replacement) => {
                            state.provisioned.insert(node.clone(), replacement.clone());
                            wait_ready(shared, &api, &replacement)
                                .await
                                .map_err(|error| NodeFailure::new(node, "provision", &error))
                        }
                        Err(error) => Err(NodeFailure::new(node, "provision", &error)),
                    }
                }
                BatchOp::Cordon => {
                    state.cordoned.push(node.clone());
                    nodes
                        .cordon(node)
                        .await
                        .map_err(|error| NodeFailure::new(node, "cordon", &error))
                }
                BatchOp::DrainAndTerminate => {
                    if !state.cordoned.contains(node) {
                        state.cordoned.push(node.clone());
                    }
                    match engine.drain(node, &shared.shutdown).await {
                        Ok(()) => match terminate(shared, &api, &plan.group, node).await {
                            Ok(()) => {
                                state.terminated.insert(node.clone());
                                report.replaced.push(node.clone());
                                Ok(())
                            }
                            Err(error) => Err(NodeFailure::new(node, "terminate", &error)),
                        },
                        Err(error) => Err(NodeFailure::new(node, "drain", &error)),
                    }
                }
            };
            if let Err(failure) = result {
                event!(
                    Level::ERROR,
                    node = %failure.name,
                    operation = %failure.operation,
                    error = %failure.error,
                    msg = "rebalance operation failed"
                );
                report.failures.push(failure);
                if rollback_on_failure {
                    rollback(shared, &plan, &state, &mut report).await;
                    break 'batches;
                }
            }
        }
    }
    Ok(report)
}
