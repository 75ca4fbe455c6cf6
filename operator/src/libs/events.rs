//! Emits Kubernetes events for user visible autoscaler actions

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::{event, Level};

/// The event reasons the autoscaler emits
pub mod reasons {
    /// A node group spec violated an invariant
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A node group is adding capacity
    pub const SCALING_UP: &str = "ScalingUp";
    /// A node group is removing capacity
    pub const SCALING_DOWN: &str = "ScalingDown";
    /// A scale up attempt failed
    pub const SCALE_UP_FAILED: &str = "ScaleUpFailed";
    /// A scale down was refused by a safety check
    pub const SCALE_DOWN_BLOCKED: &str = "ScaleDownBlocked";
    /// An instance started provisioning
    pub const INITIALIZING: &str = "Initializing";
    /// An instance failed out of its phase machine
    pub const PHASE_FAILED: &str = "PhaseFailed";
    /// A provider side node group was created
    pub const GROUP_CREATED: &str = "VPSieNodeGroupCreated";
}

/// A recorder for the events the autoscaler emits
pub struct Events {
    /// The kube event recorder to publish through
    recorder: Recorder,
}

impl Events {
    /// Build a new event recorder
    ///
    /// # Arguments
    ///
    /// * `client` - A client for the Kubernetes API
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "vpsie-autoscaler".to_owned(),
            instance: None,
        };
        Events {
            recorder: Recorder::new(client, reporter),
        }
    }

    /// Publish a normal event
    ///
    /// Event delivery is best effort. Failures are logged and dropped since a
    /// reconcile must never fail over bookkeeping.
    ///
    /// # Arguments
    ///
    /// * `obj_ref` - A reference to the object this event is about
    /// * `reason` - The reason for this event
    /// * `note` - The human readable note to attach
    pub async fn normal(&self, obj_ref: &ObjectReference, reason: &str, note: String) {
        self.publish(obj_ref, EventType::Normal, reason, note).await;
    }

    /// Publish a warning event
    ///
    /// # Arguments
    ///
    /// * `obj_ref` - A reference to the object this event is about
    /// * `reason` - The reason for this event
    /// * `note` - The human readable note to attach
    pub async fn warning(&self, obj_ref: &ObjectReference, reason: &str, note: String) {
        self.publish(obj_ref, EventType::Warning, reason, note)
            .await;
    }

    /// Publish an event of either type
    async fn publish(
        &self,
        obj_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let ev = Event {
            type_,
            reason: reason.to_owned(),
            note: Some(note),
            action: reason.to_owned(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&ev, obj_ref).await {
            event!(Level::WARN, msg = "Failed to publish event", error = %error);
        }
    }
}
