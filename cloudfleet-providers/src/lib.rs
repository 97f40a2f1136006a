use async_trait::async_trait;
use cloudfleet_common::TagSet;
use std::sync::Arc;

pub mod error;

pub use error::{ErrorKind, ProviderError};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Boundary to one REST-style, tag-capable compute API.
///
/// Implementations are thin: no retries, no caching. The orchestrator's
/// gateway layers both on top.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<inventory::RemoteInstance>;

    /// One page of instances matching `filter`. `next_token` is `None` for the first page.
    async fn list_instances_page(
        &self,
        filter: &inventory::InstanceFilter,
        next_token: Option<&str>,
    ) -> ProviderResult<inventory::InstancePage>;

    async fn run_instance(
        &self,
        request: &inventory::LaunchRequest,
    ) -> ProviderResult<inventory::RemoteInstance>;

    async fn request_spot_instance(
        &self,
        request: &inventory::LaunchRequest,
        max_bid_price: &str,
    ) -> ProviderResult<inventory::SpotRequest>;

    async fn describe_spot_request(&self, request_id: &str) -> ProviderResult<inventory::SpotRequest>;

    async fn cancel_spot_requests(&self, request_ids: &[String]) -> ProviderResult<()>;

    async fn start_instances(&self, instance_ids: &[String]) -> ProviderResult<()>;

    async fn stop_instances(&self, instance_ids: &[String]) -> ProviderResult<()>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> ProviderResult<()>;

    /// Adds or overwrites `tags` on every resource in one call.
    async fn create_tags(&self, resource_ids: &[String], tags: &TagSet) -> ProviderResult<()>;

    async fn describe_security_groups(
        &self,
        lookup: inventory::GroupLookup<'_>,
    ) -> ProviderResult<Vec<inventory::SecurityGroup>>;

    async fn subnet_in_vpc(&self, subnet_id: &str, vpc_id: &str) -> ProviderResult<bool>;

    async fn describe_key_pairs(&self) -> ProviderResult<Vec<inventory::KeyPairInfo>>;

    // Optional: cheap authenticated call used to detect an expired session.
    // Default implementation reports a healthy session.
    async fn probe(&self) -> ProviderResult<()> {
        Ok(())
    }
}

/// Opens authenticated sessions against a compute API.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    fn kind(&self) -> &str;

    async fn connect(&self) -> ProviderResult<Arc<dyn CloudProvider>>;
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use cloudfleet_common::{HostAddresses, InstanceState, TagSet};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RemoteInstance {
        pub instance_id: String,
        pub image_id: String,
        pub instance_type: String,
        pub state: InstanceState,
        #[serde(default)]
        pub tags: TagSet,
        #[serde(default)]
        pub addresses: HostAddresses,
        pub launched_at: Option<DateTime<Utc>>,
        pub zone: Option<String>,
        pub subnet_id: Option<String>,
        pub spot_request_id: Option<String>,
    }

    /// Server-side listing filter. Every tag must match; an empty state list matches any state.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InstanceFilter {
        pub states: Vec<InstanceState>,
        pub tags: TagSet,
        pub instance_ids: Vec<String>,
    }

    impl InstanceFilter {
        pub fn with_states(mut self, states: &[InstanceState]) -> Self {
            self.states = states.to_vec();
            self
        }

        pub fn with_tag(mut self, key: &str, value: &str) -> Self {
            self.tags.insert(key.to_string(), value.to_string());
            self
        }

        pub fn with_tags(mut self, tags: TagSet) -> Self {
            self.tags.extend(tags);
            self
        }

        pub fn matches(&self, instance: &RemoteInstance) -> bool {
            (self.states.is_empty() || self.states.contains(&instance.state))
                && (self.instance_ids.is_empty()
                    || self.instance_ids.contains(&instance.instance_id))
                && self
                    .tags
                    .iter()
                    .all(|(k, v)| instance.tags.get(k) == Some(v))
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InstancePage {
        pub instances: Vec<RemoteInstance>,
        pub next_token: Option<String>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LaunchRequest {
        pub image_id: String,
        pub instance_type: String,
        pub key_name: String,
        pub zone: Option<String>,
        pub subnet_id: Option<String>,
        /// Used with a subnet (VPC placement).
        pub security_group_ids: Vec<String>,
        /// Used without a subnet.
        pub security_group_names: Vec<String>,
        pub associate_public_ip: bool,
        pub iam_instance_profile: Option<String>,
        pub user_data: Option<String>,
        /// Idempotency token; a retried launch with the same token returns the same instance.
        pub client_token: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum SpotRequestState {
        Open,
        Active,
        Closed,
        Cancelled,
        Failed,
    }

    impl SpotRequestState {
        pub fn is_finished(&self) -> bool {
            matches!(
                self,
                SpotRequestState::Closed | SpotRequestState::Cancelled | SpotRequestState::Failed
            )
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SpotRequest {
        pub request_id: String,
        pub state: SpotRequestState,
        pub instance_id: Option<String>,
    }

    #[derive(Clone, Copy, Debug)]
    pub enum GroupLookup<'a> {
        Names(&'a [String]),
        Ids(&'a [String]),
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SecurityGroup {
        pub group_id: String,
        pub group_name: String,
        pub vpc_id: Option<String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct KeyPairInfo {
        pub key_name: String,
        pub fingerprint: String,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "rest")]
pub mod rest;
