use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, EvictParams, ListParams, ObjectList};
use tracing::{event, instrument, Level};
use vpsie_autoscaler::Error;

/// The annotation kubelet stamps onto static mirror pods
const MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// The result of a single eviction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// The eviction was accepted
    Evicted,
    /// The eviction was denied by a disruption budget
    Denied,
}

/// Wrapper for pod api routes in k8s
pub struct Pods {
    /// Client to use for creating namespaced clients
    client: kube::Client,
    /// Pod API client for all namespaces
    api: Api<Pod>,
}

impl Pods {
    /// Build a new wrapper for k8s functions regarding pods
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    pub fn new(client: &kube::Client) -> Self {
        let api: Api<Pod> = Api::all(client.clone());
        Pods {
            client: client.clone(),
            api,
        }
    }

    /// List all pods on a single node
    ///
    /// # Arguments
    ///
    /// * `node` - The node to list pods from
    pub async fn on_node(&self, node: &str) -> Result<ObjectList<Pod>, Error> {
        let params = ListParams::default().fields(&format!("spec.nodeName=={node}"));
        Ok(self.api.list(&params).await?)
    }

    /// List all pods across all namespaces
    pub async fn list_all(&self) -> Result<ObjectList<Pod>, Error> {
        Ok(self.api.list(&ListParams::default()).await?)
    }

    /// List all disruption budgets across all namespaces
    pub async fn pdbs(&self) -> Result<ObjectList<PodDisruptionBudget>, Error> {
        let api: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?)
    }

    /// Issue an eviction for a single pod
    ///
    /// # Arguments
    ///
    /// * `namespace` - The namespace of the pod to evict
    /// * `name` - The name of the pod to evict
    #[instrument(name = "k8s::Pods::evict", skip(self))]
    pub async fn evict(&self, namespace: &str, name: &str) -> Result<EvictOutcome, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.evict(name, &EvictParams::default()).await {
            Ok(_) => Ok(EvictOutcome::Evicted),
            // a 429 means a disruption budget is holding this pod in place
            Err(kube::Error::Api(ae)) if ae.code == 429 => {
                event!(Level::INFO, pod = name, msg = "eviction denied by pdb");
                Ok(EvictOutcome::Denied)
            }
            // a pod that is already gone counts as evicted
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(EvictOutcome::Evicted),
            Err(error) => Err(error.into()),
        }
    }

    /// Check whether a pod is owned by a daemonset
    ///
    /// # Arguments
    ///
    /// * `pod` - The pod to check
    pub fn is_daemonset(pod: &Pod) -> bool {
        pod.metadata
            .owner_references
            .as_ref()
            .map(|owners| {
                owners
                    .iter()
                    .any(|owner| owner.controller == Some(true) && owner.kind == "DaemonSet")
            })
            .unwrap_or(false)
    }

    /// Check whether a pod is a static mirror pod
    ///
    /// # Arguments
    ///
    /// * `pod` - The pod to check
    pub fn is_mirror(pod: &Pod) -> bool {
        pod.metadata
            .annotations
            .as_ref()
            .map(|annotations| annotations.contains_key(MIRROR_ANNOTATION))
            .unwrap_or(false)
    }

    /// Check whether a pod has already run to completion
    ///
    /// # Arguments
    ///
    /// * `pod` - The pod to check
    pub fn is_finished(pod: &Pod) -> bool {
        matches!(
            pod.status
                .as_ref()
                .and_then(|status| status.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        )
    }

    /// Check whether a pod mounts node local storage
    ///
    /// # Arguments
    ///
    /// * `pod` - The pod to check
    pub fn has_local_storage(pod: &Pod) -> bool {
        pod.spec
            .as_ref()
            .and_then(|spec| spec.volumes.as_ref())
            .map(|volumes| {
                volumes
                    .iter()
                    .any(|volume| volume.empty_dir.is_some() || volume.host_path.is_some())
            })
            .unwrap_or(false)
    }

    /// Filter a pod list down to the pods a drain must move
    ///
    /// Daemonset pods ignore cordons, mirror pods cannot be controlled, and
    /// finished pods hold no capacity.
    ///
    /// # Arguments
    ///
    /// * `pods` - The pods to filter
    pub fn evictable(pods: impl IntoIterator<Item = Pod>) -> Vec<Pod> {
        pods.into_iter()
            .filter(|pod| !Self::is_daemonset(pod))
            .filter(|pod| !Self::is_mirror(pod))
            .filter(|pod| !Self::is_finished(pod))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus, Volume};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::core::ObjectMeta;

    /// Build a pod owned by the given controller kind
    fn owned_pod(kind: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("worker".to_owned()),
                owner_references: Some(vec![OwnerReference {
                    kind: kind.to_owned(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn drains_skip_daemonsets_mirrors_and_finished_pods() {
        let mirror = Pod {
            metadata: ObjectMeta {
                annotations: Some(
                    [(MIRROR_ANNOTATION.to_owned(), "hash".to_owned())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        let finished = Pod {
            status: Some(PodStatus {
                phase: Some("Succeeded".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let pods = vec![
            owned_pod("DaemonSet"),
            owned_pod("ReplicaSet"),
            mirror,
            finished,
        ];
        let evictable = Pods::evictable(pods);
        assert_eq!(evictable.len(), 1);
        assert_eq!(evictable[0].metadata.name.as_deref(), Some("worker"));
    }

    #[test]
    fn local_storage_covers_empty_dir_and_host_path() {
        let pod = Pod {
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "scratch".to_owned(),
                    empty_dir: Some(Default::default()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(Pods::has_local_storage(&pod));
        assert!(!Pods::has_local_storage(&Pod::default()));
    }
}
