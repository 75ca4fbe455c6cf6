//! Installs and renders the autoscaler CRDs

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, Patch, PatchParams},
    core::CustomResourceExt,
    runtime::{conditions, wait::await_condition},
    Client,
};
use vpsie_autoscaler::models::{NodeGroup, VPSInstance};
use vpsie_autoscaler::Error;

/// The name of the NodeGroup CRD
pub const GROUP_CRD_NAME: &str = "nodegroups.autoscaler.vpsie.com";
/// The name of the VPSInstance CRD
pub const INSTANCE_CRD_NAME: &str = "vpsinstances.autoscaler.vpsie.com";

/// Apply a single CRD and wait for it to be established
///
/// # Arguments
///
/// * `client` - The client to apply the CRD with
/// * `name` - The name of the CRD to apply
/// * `crd` - The CRD to apply
async fn apply(
    client: &Client,
    name: &str,
    crd: CustomResourceDefinition,
) -> Result<(), Error> {
    let params = PatchParams::apply("vpsie_autoscaler_apply").force();
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    // create the CRD for this operator version or patch it if it already exists
    crd_api.patch(name, &params, &Patch::Apply(crd)).await?;
    // wait for the crd to be setup
    let established = await_condition(crd_api, name, conditions::is_crd_established());
    // timeout if the CRD isn't setup in N seconds
    let result = tokio::time::timeout(tokio::time::Duration::from_secs(30), established).await;
    // ensure the CRD is established before continuing on
    match result {
        Ok(_) => Ok(()),
        Err(_) => Err(Error::new(format!(
            "Timed out waiting for the {name} CRD to be established"
        ))),
    }
}

/// Create or update both autoscaler CRDs
///
/// # Arguments
///
/// * `client` - The client to apply the CRDs with
pub async fn create_or_update(client: &Client) -> Result<(), Error> {
    apply(client, GROUP_CRD_NAME, NodeGroup::crd()).await?;
    apply(client, INSTANCE_CRD_NAME, VPSInstance::crd()).await?;
    Ok(())
}

/// Print both autoscaler CRDs as yaml
pub fn print() -> Result<(), Error> {
    let groups = serde_yaml::to_string(&NodeGroup::crd())
        .map_err(|error| Error::new(format!("Failed to render NodeGroup CRD: {error}")))?;
    let instances = serde_yaml::to_string(&VPSInstance::crd())
        .map_err(|error| Error::new(format!("Failed to render VPSInstance CRD: {error}")))?;
    println!("{groups}---\n{instances}");
    Ok(())
}
