//! The reqwest backed implementation of the VPSie capability interface

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{
    Error, Offering, VmCreateRequest, VmSummary, VpsieNodeGroup, VpsieNodeGroupRequest,
    VpsieProvider,
};
use crate::conf::VpsieApi;

/// Race a request against the callers cancellation token
macro_rules! cancellable {
    ($ctx:expr, $fut:expr) => {
        tokio::select! {
            _ = $ctx.cancelled() => return Err(Error::Cancelled),
            resp = $fut => resp?,
        }
    };
}

/// The envelope VPSie wraps response bodies in
#[derive(Deserialize)]
struct Wrapped<T> {
    /// The actual payload
    data: T,
}

/// The body returned when requesting a token
#[derive(Deserialize)]
struct TokenResponse {
    /// The bearer token to authenticate follow up calls with
    token: String,
}

/// The body returned when creating a VM
#[derive(Deserialize)]
struct VmCreateResponse {
    /// The id of the new VM when assigned synchronously
    #[serde(default)]
    id: Option<i64>,
}

/// A client for the VPSie API
pub struct Vpsie {
    /// The reqwest client to send requests with
    client: reqwest::Client,
    /// The base url of the VPSie API
    host: String,
    /// The credentials to authenticate with
    ///
    /// Held behind a lock so a rotated secret can swap them live.
    creds: RwLock<(String, String)>,
    /// The bearer token for the current session
    token: RwLock<String>,
}

impl Vpsie {
    /// Build a new VPSie client
    ///
    /// The client starts unauthenticated. The first call to
    /// [`VpsieProvider::refresh_credentials`] obtains a token.
    ///
    /// # Arguments
    ///
    /// * `conf` - The VPSie API settings to build from
    pub fn new(conf: &VpsieApi) -> Result<Self, Error> {
        // build a reqwest client with the configured timeout
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.timeout))
            .build()?;
        Ok(Vpsie {
            client,
            host: conf.url.trim_end_matches('/').to_owned(),
            creds: RwLock::new((conf.client_id.clone(), conf.client_secret.clone())),
            token: RwLock::new(String::default()),
        })
    }

    /// Swap in rotated credentials
    ///
    /// The new credentials take effect on the next
    /// [`VpsieProvider::refresh_credentials`] call.
    ///
    /// # Arguments
    ///
    /// * `client_id` - The rotated client id
    /// * `client_secret` - The rotated client secret
    pub async fn rotate(&self, client_id: String, client_secret: String) {
        let mut creds = self.creds.write().await;
        *creds = (client_id, client_secret);
    }

    /// Throw an error if a response came back unsuccessful
    ///
    /// # Arguments
    ///
    /// * `resp` - The response to check
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
        let code = resp.status();
        if code.is_success() {
            return Ok(resp);
        }
        // pull the body out for the error message if we can
        let msg = resp.text().await.ok();
        Err(Error::Vpsie { code, msg })
    }

    /// Get a copy of the current bearer token
    async fn bearer(&self) -> String {
        self.token.read().await.clone()
    }
}

#[async_trait]
impl VpsieProvider for Vpsie {
    /// List all VMs visible to these credentials
    async fn list_vms(&self, ctx: &CancellationToken) -> Result<Vec<VmSummary>, Error> {
        let url = format!("{}/vms", self.host);
        let req = self.client.get(&url).bearer_auth(self.bearer().await);
        let resp = cancellable!(ctx, req.send());
        let resp = Self::check(resp).await?;
        let wrapped: Wrapped<Vec<VmSummary>> = resp.json().await?;
        Ok(wrapped.data)
    }

    /// Request a new VM
    async fn create_vm(
        &self,
        ctx: &CancellationToken,
        req: &VmCreateRequest,
    ) -> Result<Option<i64>, Error> {
        let url = format!("{}/vms", self.host);
        let req = self
            .client
            .post(&url)
            .bearer_auth(self.bearer().await)
            .json(req);
        let resp = cancellable!(ctx, req.send());
        let resp = Self::check(resp).await?;
        let wrapped: Wrapped<VmCreateResponse> = resp.json().await?;
        Ok(wrapped.data.id)
    }

    /// Delete a VM by id
    async fn delete_vm(&self, ctx: &CancellationToken, id: i64) -> Result<(), Error> {
        let url = format!("{}/vms/{}", self.host, id);
        let req = self.client.delete(&url).bearer_auth(self.bearer().await);
        let resp = cancellable!(ctx, req.send());
        // a VM that is already gone counts as deleted
        match Self::check(resp).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Get a single offering with its specs and pricing
    async fn get_offering(&self, ctx: &CancellationToken, id: &str) -> Result<Offering, Error> {
        let url = format!("{}/offerings/{}", self.host, id);
        let req = self.client.get(&url).bearer_auth(self.bearer().await);
        let resp = cancellable!(ctx, req.send());
        let resp = Self::check(resp).await?;
        let wrapped: Wrapped<Offering> = resp.json().await?;
        Ok(wrapped.data)
    }

    /// List all offerings with their specs and pricing
    async fn list_offerings(&self, ctx: &CancellationToken) -> Result<Vec<Offering>, Error> {
        let url = format!("{}/offerings", self.host);
        let req = self.client.get(&url).bearer_auth(self.bearer().await);
        let resp = cancellable!(ctx, req.send());
        let resp = Self::check(resp).await?;
        let wrapped: Wrapped<Vec<Offering>> = resp.json().await?;
        Ok(wrapped.data)
    }

    /// List the provider side Kubernetes node groups of a cluster
    async fn list_k8s_groups(
        &self,
        ctx: &CancellationToken,
        resource_identifier: &str,
    ) -> Result<Vec<VpsieNodeGroup>, Error> {
        let url = format!("{}/k8s/{}/groups", self.host, resource_identifier);
        let req = self.client.get(&url).bearer_auth(self.bearer().await);
        let resp = cancellable!(ctx, req.send());
        let resp = Self::check(resp).await?;
        let wrapped: Wrapped<Vec<VpsieNodeGroup>> = resp.json().await?;
        Ok(wrapped.data)
    }

    /// Create a provider side Kubernetes node group
    async fn create_k8s_group(
        &self,
        ctx: &CancellationToken,
        req: &VpsieNodeGroupRequest,
    ) -> Result<(), Error> {
        let url = format!("{}/k8s/{}/groups", self.host, req.resource_identifier);
        let req = self
            .client
            .post(&url)
            .bearer_auth(self.bearer().await)
            .json(req);
        let resp = cancellable!(ctx, req.send());
        Self::check(resp).await?;
        Ok(())
    }

    /// Reauthenticate after a credential rotation
    async fn refresh_credentials(&self, ctx: &CancellationToken) -> Result<(), Error> {
        let url = format!("{}/token", self.host);
        // authenticate with whatever credentials are current
        let body = {
            let creds = self.creds.read().await;
            serde_json::json!({
                "client_id": creds.0,
                "client_secret": creds.1,
            })
        };
        let req = self.client.post(&url).json(&body);
        let resp = cancellable!(ctx, req.send());
        let resp = Self::check(resp).await?;
        let wrapped: Wrapped<TokenResponse> = resp.json().await?;
        // store the fresh token for follow up calls
        let mut token = self.token.write().await;
        *token = wrapped.data.token;
        Ok(())
    }
}
