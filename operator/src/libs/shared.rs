//! The shared objects handed to every reconciler

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vpsie_autoscaler::{Conf, VpsieProvider};

use super::events::Events;
use super::scaledown::{ScaleDownEngine, UtilizationCache};

/// The state every reconcile invocation gets a handle to
pub struct Shared {
    /// A client for the Kubernetes API
    pub client: kube::Client,
    /// The autoscaler config
    pub conf: Conf,
    /// The VPSie capability interface
    pub provider: Arc<dyn VpsieProvider>,
    /// The event recorder for user visible actions
    pub events: Events,
    /// The utilization cache fed by the metric collector
    pub utilization: Arc<UtilizationCache>,
    /// The token cancelled on shutdown or leader loss
    pub shutdown: CancellationToken,
}

impl Shared {
    /// Build the shared reconciler state
    ///
    /// # Arguments
    ///
    /// * `client` - A client for the Kubernetes API
    /// * `conf` - The autoscaler config
    /// * `provider` - The VPSie capability interface
    /// * `shutdown` - The token cancelled on shutdown or leader loss
    pub fn new(
        client: kube::Client,
        conf: Conf,
        provider: Arc<dyn VpsieProvider>,
        shutdown: CancellationToken,
    ) -> Self {
        let events = Events::new(client.clone());
        let utilization = Arc::new(UtilizationCache::default());
        Shared {
            client,
            conf,
            provider,
            events,
            utilization,
            shutdown,
        }
    }

    /// Wrap this state in an Arc for the controllers
    pub fn to_context(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Build a scale down engine over this state
    pub fn engine(&self) -> ScaleDownEngine {
        ScaleDownEngine::new(
            self.client.clone(),
            self.conf.autoscaler.scale_down.clone(),
            self.utilization.clone(),
        )
    }
}
