use cloudfleet_common::TagSet;
use cloudfleet_providers::inventory::{
    GroupLookup, InstanceFilter, KeyPairInfo, LaunchRequest, RemoteInstance, SecurityGroup,
    SpotRequest,
};
use cloudfleet_providers::{CloudProvider, ProviderError, ProviderFactory, ProviderResult};
use futures_util::stream::{self, Stream, TryStreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::retry::{retry_with_policy, RetryPolicy};

#[derive(Clone)]
struct Session {
    client: Arc<dyn CloudProvider>,
    generation: u64,
}

/// Per-cloud wrapper around the compute API.
///
/// Holds one open session and rebuilds it when the provider reports an
/// expired request. Rebuilds are single-flight: callers that observe the
/// same stale session wait for one rebuild instead of each opening a new one.
pub struct CloudGateway {
    cloud: String,
    factory: Arc<dyn ProviderFactory>,
    session: RwLock<Option<Session>>,
    rebuild_lock: Mutex<()>,
    generations: AtomicU64,
    describe_policy: RetryPolicy,
}

impl CloudGateway {
    pub fn new(cloud: &str, factory: Arc<dyn ProviderFactory>) -> Self {
        Self::with_describe_policy(cloud, factory, RetryPolicy::eventual_consistency())
    }

    pub fn with_describe_policy(
        cloud: &str,
        factory: Arc<dyn ProviderFactory>,
        describe_policy: RetryPolicy,
    ) -> Self {
        Self {
            cloud: cloud.to_string(),
            factory,
            session: RwLock::new(None),
            rebuild_lock: Mutex::new(()),
            generations: AtomicU64::new(0),
            describe_policy,
        }
    }

    pub fn cloud(&self) -> &str {
        &self.cloud
    }

    pub fn provider_kind(&self) -> &str {
        self.factory.kind()
    }

    /// Number of sessions opened so far.
    pub fn session_generation(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    async fn session(&self) -> ProviderResult<Session> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        self.rebuild(None).await
    }

    /// Open a new session unless someone already replaced `stale`.
    async fn rebuild(&self, stale: Option<u64>) -> ProviderResult<Session> {
        let _guard = self.rebuild_lock.lock().await;

        if let Some(current) = self.session.read().await.clone() {
            let still_stale = matches!(stale, Some(generation) if generation == current.generation);
            if !still_stale {
                return Ok(current);
            }
        }

        let client = self.factory.connect().await?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Session { client, generation };
        *self.session.write().await = Some(session.clone());
        tracing::info!(
            "🔌 [gateway] cloud={} opened {} session #{}",
            self.cloud,
            self.factory.kind(),
            generation
        );
        Ok(session)
    }

    /// Run `op` on the current session; on an expired request, rebuild once and replay.
    async fn call<T, F, Fut>(&self, op: F) -> ProviderResult<T>
    where
        F: Fn(Arc<dyn CloudProvider>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let session = self.session().await?;
        match op(session.client.clone()).await {
            Err(e) if e.is_session_expired() => {
                tracing::warn!(
                    "🔁 [gateway] cloud={} session #{} expired ({}), reconnecting",
                    self.cloud,
                    session.generation,
                    e
                );
                let fresh = self.rebuild(Some(session.generation)).await?;
                op(fresh.client).await
            }
            other => other,
        }
    }

    /// Periodic health check: probes the session and rebuilds it if expired.
    pub async fn health_probe(&self) -> ProviderResult<()> {
        let session = self.session().await?;
        match session.client.probe().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_session_expired() => {
                tracing::info!(
                    "🔁 [gateway] cloud={} probe found expired session #{}",
                    self.cloud,
                    session.generation
                );
                self.rebuild(Some(session.generation)).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Single describe call, no eventual-consistency retry.
    pub async fn describe_instance_once(&self, instance_id: &str) -> ProviderResult<RemoteInstance> {
        self.call(|c| async move { c.describe_instance(instance_id).await })
            .await
    }

    /// Describe with retry on not-yet-visible and expired-request errors.
    pub async fn describe_instance(&self, instance_id: &str) -> ProviderResult<RemoteInstance> {
        retry_with_policy(
            self.describe_policy,
            ProviderError::is_eventually_consistent,
            |_| self.describe_instance_once(instance_id),
        )
        .await
    }

    pub async fn launch(&self, request: &LaunchRequest) -> ProviderResult<RemoteInstance> {
        self.call(|c| async move { c.run_instance(request).await })
            .await
    }

    pub async fn request_spot(
        &self,
        request: &LaunchRequest,
        max_bid_price: &str,
    ) -> ProviderResult<SpotRequest> {
        self.call(|c| async move { c.request_spot_instance(request, max_bid_price).await })
            .await
    }

    pub async fn describe_spot_request(&self, request_id: &str) -> ProviderResult<SpotRequest> {
        self.call(|c| async move { c.describe_spot_request(request_id).await })
            .await
    }

    pub async fn cancel_spot_requests(&self, request_ids: &[String]) -> ProviderResult<()> {
        if request_ids.is_empty() {
            return Ok(());
        }
        self.call(|c| async move { c.cancel_spot_requests(request_ids).await })
            .await
    }

    /// Terminate; an instance that is already gone counts as terminated.
    pub async fn terminate(&self, instance_ids: &[String]) -> ProviderResult<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        match self
            .call(|c| async move { c.terminate_instances(instance_ids).await })
            .await
        {
            Err(e) if e.is_not_found() => {
                tracing::debug!(
                    "[gateway] cloud={} terminate: {} (already gone)",
                    self.cloud,
                    e
                );
                Ok(())
            }
            other => other,
        }
    }

    pub async fn stop(&self, instance_ids: &[String]) -> ProviderResult<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        self.call(|c| async move { c.stop_instances(instance_ids).await })
            .await
    }

    pub async fn start(&self, instance_ids: &[String]) -> ProviderResult<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        self.call(|c| async move { c.start_instances(instance_ids).await })
            .await
    }

    /// One tagging call for all `resource_ids`.
    pub async fn tag(&self, resource_ids: &[String], tags: &TagSet) -> ProviderResult<()> {
        if resource_ids.is_empty() || tags.is_empty() {
            return Ok(());
        }
        self.call(|c| async move { c.create_tags(resource_ids, tags).await })
            .await
    }

    /// Every instance matching `filter`, following pagination tokens until exhausted.
    pub fn list_instances<'a>(
        &'a self,
        filter: &'a InstanceFilter,
    ) -> impl Stream<Item = ProviderResult<RemoteInstance>> + 'a {
        // State: Some(token) while pages remain; the first page has no token.
        stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(token) = cursor else {
                return Ok(None);
            };
            let token = token.as_deref();
            let page = self
                .call(|c| async move { c.list_instances_page(filter, token).await })
                .await?;
            let next = page.next_token.map(Some);
            let items = stream::iter(page.instances.into_iter().map(Ok::<_, ProviderError>));
            Ok::<_, ProviderError>(Some((items, next)))
        })
        .try_flatten()
    }

    /// Collect a full listing. Either every page is returned or an error is.
    pub async fn list_all(&self, filter: &InstanceFilter) -> ProviderResult<Vec<RemoteInstance>> {
        self.list_instances(filter).try_collect().await
    }

    /// Resolve configured security groups for a launch.
    ///
    /// Without a subnet the names are passed through. With a subnet every group
    /// must resolve to a VPC group containing that subnet; anything less is an error.
    pub async fn resolve_security_groups(
        &self,
        groups: &[String],
        subnet_id: Option<&str>,
    ) -> Result<SecurityGroupSelection, SecurityGroupError> {
        let mut requested: Vec<String> = Vec::with_capacity(groups.len());
        for group in groups {
            if !requested.contains(group) {
                requested.push(group.clone());
            }
        }
        if requested.is_empty() {
            return Ok(SecurityGroupSelection::default());
        }
        let Some(subnet_id) = subnet_id else {
            return Ok(SecurityGroupSelection {
                ids: Vec::new(),
                names: requested,
            });
        };

        let mut found = self.describe_groups(GroupLookup::Names(&requested)).await?;
        if found.is_empty() {
            found = self.describe_groups(GroupLookup::Ids(&requested)).await?;
        }

        let mut ids = Vec::new();
        for group in &found {
            let Some(vpc_id) = group.vpc_id.as_deref().filter(|v| !v.is_empty()) else {
                continue;
            };
            let in_vpc = self
                .call(|c| async move { c.subnet_in_vpc(subnet_id, vpc_id).await })
                .await?;
            if in_vpc && !ids.contains(&group.group_id) {
                ids.push(group.group_id.clone());
            }
        }

        if ids.len() != requested.len() {
            return Err(SecurityGroupError::NotAllVpcGroups {
                requested: requested.len(),
                resolved: ids.len(),
            });
        }
        Ok(SecurityGroupSelection {
            ids,
            names: Vec::new(),
        })
    }

    async fn describe_groups(&self, lookup: GroupLookup<'_>) -> ProviderResult<Vec<SecurityGroup>> {
        self.call(|c| async move { c.describe_security_groups(lookup).await })
            .await
    }

    /// First key pair matching `fingerprint` (preferred) or `name`.
    pub async fn find_key_pair(
        &self,
        name: Option<&str>,
        fingerprint: Option<&str>,
    ) -> ProviderResult<Option<KeyPairInfo>> {
        let pairs = self.call(|c| async move { c.describe_key_pairs().await }).await?;
        let found = match (fingerprint, name) {
            (Some(fp), _) => pairs.into_iter().find(|k| k.fingerprint == fp),
            (None, Some(n)) => pairs.into_iter().find(|k| k.key_name == n),
            (None, None) => None,
        };
        Ok(found)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityGroupSelection {
    /// VPC group ids (subnet placement).
    pub ids: Vec<String>,
    /// Group names (no subnet).
    pub names: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SecurityGroupError {
    #[error("security groups must all be VPC security groups to work in a VPC context ({resolved} of {requested} resolved)")]
    NotAllVpcGroups { requested: usize, resolved: usize },
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
