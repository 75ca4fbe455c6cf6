//! Starts the leader elected controllers and their background tasks
//!
//! Only the lease holder runs controllers. Losing the lease cancels the
//! session token, which stops the controllers gracefully and tears down the
//! collector, the credentials watcher, and the rebalance sweep with them.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::{Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};
use vpsie_autoscaler::models::{NodeGroup, VPSInstance};
use vpsie_autoscaler::{Conf, Error, Vpsie, VpsieProvider};

use crate::args::RunArgs;

use super::scaledown::{self, KubeMetrics, UtilizationSource};
use super::{groups, instances, rebalance, Shared};

/// Re-authenticate the provider whenever the credentials secret rotates
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `vpsie` - The concrete client whose credentials get swapped
/// * `session` - The token cancelled on shutdown or leader loss
async fn watch_credentials(
    shared: Arc<Shared>,
    vpsie: Arc<Vpsie>,
    session: CancellationToken,
) {
    let api: Api<Secret> = Api::namespaced(
        shared.client.clone(),
        &shared.conf.autoscaler.namespace,
    );
    let secret_name = shared.conf.vpsie.creds_secret.clone();
    let conf = watcher::Config::default().fields(&format!("metadata.name={secret_name}"));
    let mut stream = watcher(api, conf).boxed();
    loop {
        let secret = tokio::select! {
            _ = session.cancelled() => return,
            item = stream.next() => match item {
                Some(Ok(watcher::Event::Apply(secret))) => secret,
                Some(Ok(watcher::Event::InitApply(secret))) => secret,
                Some(Ok(_)) => continue,
                Some(Err(error)) => {
                    event!(Level::WARN, msg = "credentials watch error", error = %error);
                    continue;
                }
                None => return,
            },
        };
        // pull the rotated credentials out of the secret
        let data = match &secret.data {
            Some(data) => data,
            None => continue,
        };
        let client_id = data
            .get("client_id")
            .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok());
        let client_secret = data
            .get("client_secret")
            .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok());
        if let (Some(client_id), Some(client_secret)) = (client_id, client_secret) {
            vpsie.rotate(client_id, client_secret).await;
            match vpsie.refresh_credentials(&session).await {
                Ok(()) => event!(Level::INFO, msg = "credentials rotated"),
                Err(error) => {
                    event!(Level::WARN, msg = "credential refresh failed", error = %error);
                }
            }
        }
    }
}

/// Run the controllers and background tasks for one leadership session
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `vpsie` - The concrete client for credential rotation
/// * `session` - The token cancelled on shutdown or leader loss
async fn run_controllers(shared: Arc<Shared>, vpsie: Arc<Vpsie>, session: CancellationToken) {
    let namespace = shared.conf.autoscaler.namespace.clone();
    let client = shared.client.clone();
    // the metric collector feeds the scale down engine
    let source: Arc<dyn UtilizationSource> = Arc::new(KubeMetrics::new(client.clone()));
    let collector = tokio::spawn(scaledown::collect(
        client.clone(),
        source,
        shared.utilization.clone(),
        shared.conf.autoscaler.scale_down.clone(),
        session.clone(),
    ));
    // credential rotations re-authenticate the provider
    let secrets = tokio::spawn(watch_credentials(
        shared.clone(),
        vpsie,
        session.clone(),
    ));
    // the rebalancer sweeps on its own cadence
    let rebalancer = tokio::spawn(rebalance::sweep(shared.clone(), session.clone()));
    let groups_api: Api<NodeGroup> = Api::namespaced(client.clone(), &namespace);
    let instances_api: Api<VPSInstance> = Api::namespaced(client.clone(), &namespace);
    // pool decisions are serialized, instances reconcile independently
    let group_controller = Controller::new(groups_api, watcher::Config::default())
        .owns(instances_api.clone(), watcher::Config::default())
        .with_config(
            ControllerConfig::default()
                .concurrency(shared.conf.autoscaler.controllers.group_workers as u16),
        )
        .graceful_shutdown_on(session.clone().cancelled_owned())
        .run(groups::reconcile, groups::error_policy, shared.clone())
        .filter_map(|result| async move { result.ok() })
        .for_each(|_| futures::future::ready(()));
    let instance_controller = Controller::new(instances_api, watcher::Config::default())
        .with_config(
            ControllerConfig::default()
                .concurrency(shared.conf.autoscaler.controllers.instance_workers as u16),
        )
        .graceful_shutdown_on(session.clone().cancelled_owned())
        .run(instances::reconcile, instances::error_policy, shared.clone())
        .filter_map(|result| async move { result.ok() })
        .for_each(|_| futures::future::ready(()));
    // drive both controllers until the session ends
    tokio::join!(group_controller, instance_controller);
    // pull the background tasks down with us
    session.cancel();
    let _ = tokio::join!(collector, secrets, rebalancer);
}

/// Run the autoscaler control plane
///
/// # Arguments
///
/// * `conf` - The autoscaler config
/// * `args` - The run subcommand args
pub async fn run(conf: &Conf, args: &RunArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;
    // install our CRDs before anything watches them
    if !args.skip_crds {
        super::crds::create_or_update(&client).await?;
    }
    let shutdown = CancellationToken::new();
    // build the provider and authenticate
    let vpsie = Arc::new(Vpsie::new(&conf.vpsie)?);
    if let Err(error) = vpsie.refresh_credentials(&shutdown).await {
        // the secret watcher will retry once credentials land
        event!(Level::WARN, msg = "initial authentication failed", error = %error);
    }
    let provider: Arc<dyn VpsieProvider> = vpsie.clone();
    let shared = Shared::new(client.clone(), conf.clone(), provider, shutdown.clone()).to_context();
    // translate process signals into a cancellation
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        event!(Level::INFO, msg = "shutdown signal received");
        signal_token.cancel();
    });
    // single replica deployments may opt out of the lease dance
    if args.no_leader_election {
        run_controllers(shared, vpsie, shutdown.child_token()).await;
        return Ok(());
    }
    let leader_conf = conf.autoscaler.leader.clone();
    // the pod name makes lease holders traceable, fall back to a random id
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("vpsie-autoscaler-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &conf.autoscaler.namespace,
        LeaseLockParams {
            holder_id,
            lease_name: leader_conf.lease_name.clone(),
            lease_ttl: Duration::from_secs(leader_conf.lease_ttl),
        },
    );
    // only the leader runs controllers, losing the lease stops them
    let mut controller_task: Option<(JoinHandle<()>, CancellationToken)> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(leader_conf.renew_interval));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some((task, session)) = controller_task.take() {
                    session.cancel();
                    let _ = task.await;
                }
                return Ok(());
            }
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(lease) => lease,
            Err(error) => {
                // if we cannot renew the lease assume we are not safe to lead
                event!(Level::WARN, msg = "lease renew failed", error = %error);
                if let Some((task, session)) = controller_task.take() {
                    session.cancel();
                    task.abort();
                }
                continue;
            }
        };
        if lease.acquired_lease {
            if controller_task.is_none() {
                event!(Level::INFO, msg = "acquired leadership, starting controllers");
                let session = shutdown.child_token();
                let task = tokio::spawn(run_controllers(
                    shared.clone(),
                    vpsie.clone(),
                    session.clone(),
                ));
                controller_task = Some((task, session));
            }
        } else if let Some((task, session)) = controller_task.take() {
            event!(Level::WARN, msg = "lost leadership, stopping controllers");
            session.cancel();
            task.abort();
        }
    }
}
