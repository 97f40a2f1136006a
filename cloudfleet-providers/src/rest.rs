use crate::inventory::{
    GroupLookup, InstanceFilter, InstancePage, KeyPairInfo, LaunchRequest, RemoteInstance,
    SecurityGroup, SpotRequest,
};
use crate::{CloudProvider, ProviderError, ProviderFactory, ProviderResult};
use async_trait::async_trait;
use cloudfleet_common::TagSet;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct SubnetResponse {
    vpc_id: Option<String>,
}

fn transport(err: reqwest::Error) -> ProviderError {
    ProviderError::Transport(err.to_string())
}

fn http_client() -> ProviderResult<Client> {
    // Default reqwest client has no overall timeout; a stalled API would hang a sweep forever.
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(transport)
}

/// Turn a non-success response into a typed error.
async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
        return ProviderError::from_code(&body.error.code, body.error.message);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized(text),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Throttled(text),
        s if s.is_server_error() => ProviderError::Transport(format!("{}: {}", s, text)),
        s => ProviderError::Api {
            code: s.as_u16().to_string(),
            message: text,
        },
    }
}

/// Client for a REST compute API authenticated with a short-lived session token.
pub struct RestComputeProvider {
    client: Client,
    base_url: String,
    region: String,
    token: String,
}

impl RestComputeProvider {
    fn url(&self, path: &str) -> String {
        format!("{}/v1/regions/{}/{}", self.base_url, self.region, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ProviderResult<T> {
        let response = self.authed(builder).send().await.map_err(transport)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response.json::<T>().await.map_err(transport)
    }

    async fn send_empty(&self, builder: RequestBuilder) -> ProviderResult<()> {
        let response = self.authed(builder).send().await.map_err(transport)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }

    async fn instance_action(&self, action: &str, instance_ids: &[String]) -> ProviderResult<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        let url = self.url(&format!("instances:{}", action));
        self.send_empty(self.client.post(url).json(&json!({ "instance_ids": instance_ids })))
            .await
    }
}

#[async_trait]
impl CloudProvider for RestComputeProvider {
    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<RemoteInstance> {
        let url = self.url(&format!("instances/{}", instance_id));
        self.send_json(self.client.get(url)).await
    }

    async fn list_instances_page(
        &self,
        filter: &InstanceFilter,
        next_token: Option<&str>,
    ) -> ProviderResult<InstancePage> {
        let url = self.url("instances:list");
        let body = json!({
            "filter": filter,
            "next_token": next_token,
            "max_results": 500,
        });
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn run_instance(&self, request: &LaunchRequest) -> ProviderResult<RemoteInstance> {
        let url = self.url("instances");
        self.send_json(self.client.post(url).json(request)).await
    }

    async fn request_spot_instance(
        &self,
        request: &LaunchRequest,
        max_bid_price: &str,
    ) -> ProviderResult<SpotRequest> {
        let url = self.url("spot-requests");
        let body = json!({ "launch": request, "max_bid_price": max_bid_price });
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn describe_spot_request(&self, request_id: &str) -> ProviderResult<SpotRequest> {
        let url = self.url(&format!("spot-requests/{}", request_id));
        self.send_json(self.client.get(url)).await
    }

    async fn cancel_spot_requests(&self, request_ids: &[String]) -> ProviderResult<()> {
        if request_ids.is_empty() {
            return Ok(());
        }
        let url = self.url("spot-requests:cancel");
        self.send_empty(self.client.post(url).json(&json!({ "request_ids": request_ids })))
            .await
    }

    async fn start_instances(&self, instance_ids: &[String]) -> ProviderResult<()> {
        self.instance_action("start", instance_ids).await
    }

    async fn stop_instances(&self, instance_ids: &[String]) -> ProviderResult<()> {
        self.instance_action("stop", instance_ids).await
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> ProviderResult<()> {
        self.instance_action("terminate", instance_ids).await
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &TagSet) -> ProviderResult<()> {
        if resource_ids.is_empty() || tags.is_empty() {
            return Ok(());
        }
        let url = self.url("tags");
        let body = json!({ "resource_ids": resource_ids, "tags": tags });
        self.send_empty(self.client.post(url).json(&body)).await
    }

    async fn describe_security_groups(
        &self,
        lookup: GroupLookup<'_>,
    ) -> ProviderResult<Vec<SecurityGroup>> {
        let url = self.url("security-groups:describe");
        let body = match lookup {
            GroupLookup::Names(names) => json!({ "group_names": names }),
            GroupLookup::Ids(ids) => json!({ "group_ids": ids }),
        };
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn subnet_in_vpc(&self, subnet_id: &str, vpc_id: &str) -> ProviderResult<bool> {
        let url = self.url(&format!("subnets/{}", subnet_id));
        let subnet: SubnetResponse = self.send_json(self.client.get(url)).await?;
        Ok(subnet.vpc_id.as_deref() == Some(vpc_id))
    }

    async fn describe_key_pairs(&self) -> ProviderResult<Vec<KeyPairInfo>> {
        let url = self.url("key-pairs");
        self.send_json(self.client.get(url)).await
    }

    async fn probe(&self) -> ProviderResult<()> {
        let url = format!("{}/v1/session", self.base_url);
        self.send_empty(self.client.get(url)).await
    }
}

/// Exchanges an access key pair for a session token on every `connect`.
pub struct RestProviderFactory {
    base_url: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl RestProviderFactory {
    pub fn new(base_url: String, region: String, access_key: String, secret_key: String) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            region: region.trim().to_string(),
            access_key: access_key.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
        }
    }
}

#[async_trait]
impl ProviderFactory for RestProviderFactory {
    fn kind(&self) -> &str {
        "rest"
    }

    async fn connect(&self) -> ProviderResult<Arc<dyn CloudProvider>> {
        let client = http_client()?;
        let response = client
            .post(format!("{}/v1/sessions", self.base_url))
            .json(&json!({
                "access_key": self.access_key,
                "secret_key": self.secret_key,
            }))
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let session: SessionResponse = response.json().await.map_err(transport)?;
        tracing::debug!("🔑 [rest-provider] session opened for region {}", self.region);
        Ok(Arc::new(RestComputeProvider {
            client,
            base_url: self.base_url.clone(),
            region: self.region.clone(),
            token: session.token,
        }))
    }
}
