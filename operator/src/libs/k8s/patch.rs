//! Optimistic concurrency patches for the autoscaler resources
//!
//! Status writes carry the resource version captured before any mutation so a
//! concurrent writer surfaces as a 409. The reconciler requeues on conflict
//! rather than retrying the patch in line.

use kube::api::{Api, Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use vpsie_autoscaler::Error;

/// The field manager the autoscaler patches under
const MANAGER_NAME: &str = "vpsie-autoscaler";

/// Patch the status subresource of an object
///
/// # Arguments
///
/// * `api` - The api to patch through
/// * `name` - The name of the object to patch
/// * `resource_version` - The resource version snapshotted before mutation
/// * `status` - The status to write
pub async fn patch_status<T, S>(
    api: &Api<T>,
    name: &str,
    resource_version: Option<&String>,
    status: &S,
) -> Result<T, Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
    S: Serialize,
{
    // guard the write with the snapshot version so lost updates 409
    let patch = json!({
        "metadata": { "resourceVersion": resource_version },
        "status": status,
    });
    let params = PatchParams::default();
    let patched = api
        .patch_status(name, &params, &Patch::Merge(&patch))
        .await?;
    Ok(patched)
}

/// Ensure a finalizer is present on an object
///
/// Returns true when the finalizer had to be added so callers can requeue and
/// act on the fresh object.
///
/// # Arguments
///
/// * `api` - The api to patch through
/// * `name` - The name of the object to patch
/// * `meta` - The current metadata of the object
/// * `finalizer` - The finalizer to ensure
pub async fn add_finalizer<T>(
    api: &Api<T>,
    name: &str,
    meta: &kube::core::ObjectMeta,
    finalizer: &str,
) -> Result<bool, Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    // nothing to do if the finalizer is already attached
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|existing| existing == finalizer) {
        return Ok(false);
    }
    finalizers.push(finalizer.to_owned());
    let patch = json!({
        "metadata": {
            "resourceVersion": meta.resource_version,
            "finalizers": finalizers,
        }
    });
    let params = PatchParams::apply(MANAGER_NAME);
    api.patch(name, &params, &Patch::Merge(&patch)).await?;
    Ok(true)
}

/// Remove a finalizer from an object so it can be deleted
///
/// # Arguments
///
/// * `api` - The api to patch through
/// * `name` - The name of the object to patch
/// * `meta` - The current metadata of the object
/// * `finalizer` - The finalizer to remove
pub async fn remove_finalizer<T>(
    api: &Api<T>,
    name: &str,
    meta: &kube::core::ObjectMeta,
    finalizer: &str,
) -> Result<(), Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let finalizers: Vec<String> = meta
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|existing| existing != finalizer)
        .collect();
    let patch = json!({
        "metadata": {
            "resourceVersion": meta.resource_version,
            "finalizers": finalizers,
        }
    });
    let params = PatchParams::apply(MANAGER_NAME);
    api.patch(name, &params, &Patch::Merge(&patch)).await?;
    Ok(())
}
