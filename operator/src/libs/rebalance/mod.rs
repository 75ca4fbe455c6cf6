//! Migrates workloads onto cheaper offerings with safety gates and rollback

pub mod analyzer;
pub mod costs;
pub mod executor;
pub mod planner;
pub mod safety;

use chrono::prelude::*;
use kube::api::{Api, ListParams};
use std::sync::Arc;
use tracing::{event, instrument, Level};
use vpsie_autoscaler::models::{conversions::Requests, labels, NodeGroup};
use vpsie_autoscaler::Error;

use super::k8s::{Nodes, Pods};
use super::scaledown::pods_by_node;
use super::Shared;
use costs::CostCache;
use executor::ExecutionReport;

/// Evaluate one managed group for a cheaper fit and execute the plan
///
/// Every safety gate runs before a plan is produced. A gate that fails is a
/// clean no-op, never an error.
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `costs` - The offering price cache
/// * `group` - The group to evaluate
#[instrument(name = "rebalance::run_group", skip(shared, costs, group), fields(group = %group.metadata.name.as_deref().unwrap_or("unknown")), err(Debug))]
pub async fn run_group(
    shared: &Shared,
    costs: &CostCache,
    group: &NodeGroup,
) -> Result<Option<ExecutionReport>, Error> {
    let conf = &shared.conf.autoscaler.rebalance;
    let name = group.metadata.name.clone().unwrap_or_default();
    // externally created pools are never analyzed
    if !labels::is_managed(&group.metadata) {
        return Ok(None);
    }
    let now = Utc::now();
    // maintenance windows gate by day of week
    if !safety::day_allowed(&conf.maintenance_windows, now) {
        return Ok(None);
    }
    let nodes = Nodes::new(&shared.client);
    let pods = Pods::new(&shared.client);
    let all_nodes = nodes.list(&[]).await?.items;
    // an unhealthy cluster is no place for elective churn
    if !safety::cluster_healthy(&all_nodes, conf.min_healthy_percent) {
        event!(Level::INFO, group = %name, msg = "cluster below healthy threshold");
        return Ok(None);
    }
    if !safety::group_healthy(group, conf.cooldown, now) {
        return Ok(None);
    }
    // find nodes with a strictly cheaper offering that still fits
    let candidates =
        analyzer::analyze_group(shared, costs, group, conf.min_savings).await?;
    if candidates.is_empty() {
        return Ok(None);
    }
    // disruption budgets cap how wide a batch may be
    let pdbs = pods.pdbs().await?.items;
    let widest = planner::widest_batch(conf.strategy, conf.batch_size, candidates.len());
    if !safety::pdb_batch_allowed(widest, &pdbs) {
        event!(Level::INFO, group = %name, msg = "pdb rules block the batch size");
        return Ok(None);
    }
    // the survivors must absorb everything the candidates carry
    let all_pods = pods.list_all().await?.items;
    let grouped = pods_by_node(&all_pods);
    let displaced: Requests = candidates.iter().fold(Requests::default(), |acc, cand| {
        Requests {
            cpu: acc.cpu + cand.footprint.cpu,
            memory: acc.memory + cand.footprint.memory,
        }
    });
    let candidate_names: Vec<&str> = candidates.iter().map(|cand| cand.node.as_str()).collect();
    let free = safety::aggregate_free(&all_nodes, &grouped, &candidate_names)?;
    if !safety::capacity_fits(displaced, conf.safety_factor, free) {
        event!(Level::INFO, group = %name, msg = "remaining capacity too small");
        return Ok(None);
    }
    let plan = planner::plan(&name, candidates, conf.strategy, conf.batch_size);
    let report = executor::execute(shared, group, plan).await?;
    event!(
        Level::INFO,
        group = %name,
        replaced = report.replaced.len(),
        failures = report.failures.len(),
        rolled_back = report.rolled_back,
        msg = "rebalance finished"
    );
    Ok(Some(report))
}

/// Periodically sweep every managed group for rebalance opportunities
///
/// Runs until the session token is cancelled. Groups are processed one at a
/// time so at most one replacement wave is in flight cluster wide.
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `session` - The token cancelled on shutdown or leader loss
pub async fn sweep(shared: Arc<Shared>, session: tokio_util::sync::CancellationToken) {
    let conf = shared.conf.autoscaler.rebalance.clone();
    if !conf.enabled {
        return;
    }
    let costs = CostCache::new(shared.provider.clone(), conf.cost_ttl);
    let api: Api<NodeGroup> =
        Api::namespaced(shared.client.clone(), &shared.conf.autoscaler.namespace);
    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(conf.interval)) => {}
        }
        let params = ListParams::default().labels(&format!("{}=true", labels::MANAGED));
        let listing = match api.list(&params).await {
            Ok(listing) => listing,
            Err(error) => {
                event!(Level::WARN, msg = "failed to list groups", error = %error);
                continue;
            }
        };
        for group in &listing {
            if session.is_cancelled() {
                return;
            }
            if let Err(error) = run_group(&shared, &costs, group).await {
                event!(
                    Level::ERROR,
                    group = %group.metadata.name.as_deref().unwrap_or("unknown"),
                    error = %error,
                    msg = "rebalance failed"
                );
            }
        }
    }
}
