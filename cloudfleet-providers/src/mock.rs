use crate::inventory::{
    GroupLookup, InstanceFilter, InstancePage, KeyPairInfo, LaunchRequest, RemoteInstance,
    SecurityGroup, SpotRequest, SpotRequestState,
};
use crate::{CloudProvider, ProviderError, ProviderFactory, ProviderResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudfleet_common::{HostAddresses, InstanceState, TagSet};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

const DEFAULT_PAGE_SIZE: usize = 1000;

/// Operations recorded by the mock (and targetable by scripted failures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Connect,
    DescribeInstance,
    ListInstances,
    RunInstance,
    RequestSpot,
    DescribeSpot,
    CancelSpot,
    Start,
    Stop,
    Terminate,
    CreateTags,
    DescribeSecurityGroups,
    SubnetInVpc,
    DescribeKeyPairs,
    Probe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub ids: Vec<String>,
    pub tags: Option<TagSet>,
}

#[derive(Default)]
struct MockState {
    instances: BTreeMap<String, RemoteInstance>,
    spot_requests: BTreeMap<String, SpotRequest>,
    spot_launches: HashMap<String, LaunchRequest>,
    resource_tags: HashMap<String, TagSet>,
    client_tokens: HashMap<String, String>,
    security_groups: Vec<SecurityGroup>,
    subnets: HashMap<String, String>,
    key_pairs: Vec<KeyPairInfo>,
    failures: HashMap<MockOp, VecDeque<ProviderError>>,
    gates: HashMap<MockOp, VecDeque<MockGate>>,
    calls: Vec<MockCall>,
    page_size: usize,
    next_id: u64,
    clock: Option<DateTime<Utc>>,
}

impl MockState {
    fn record(&mut self, op: MockOp, ids: &[String], tags: Option<&TagSet>) -> ProviderResult<()> {
        self.calls.push(MockCall {
            op,
            ids: ids.to_vec(),
            tags: tags.cloned(),
        });
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn launch(&mut self, request: &LaunchRequest, spot_request_id: Option<String>) -> RemoteInstance {
        let n = self.next_id();
        let private_ip = format!("10.0.{}.{}", n / 250, n % 250 + 2);
        let addresses = HostAddresses {
            private_dns: Some(format!("ip-{}.internal", private_ip.replace('.', "-"))),
            private_ip: Some(private_ip),
            public_dns: request
                .associate_public_ip
                .then(|| format!("ec2-198-51-100-{}.compute.example", n % 250)),
            public_ip: request
                .associate_public_ip
                .then(|| format!("198.51.100.{}", n % 250)),
        };
        let instance = RemoteInstance {
            instance_id: format!("i-{:08x}", n),
            image_id: request.image_id.clone(),
            instance_type: request.instance_type.clone(),
            state: InstanceState::Running,
            tags: TagSet::new(),
            addresses,
            launched_at: Some(self.now()),
            zone: request.zone.clone(),
            subnet_id: request.subnet_id.clone(),
            spot_request_id,
        };
        self.instances
            .insert(instance.instance_id.clone(), instance.clone());
        instance
    }
}

/// Holds one call of an operation until released, so a test can run other
/// work while that call is in flight.
#[derive(Clone, Default)]
pub struct MockGate {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl MockGate {
    /// Wait until the held call has started.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        self.reached.notify_one();
        self.release.notified().await;
    }
}

/// In-memory compute API. Clones share state, so a test can keep a handle
/// while the engine talks to another clone.
#[derive(Clone)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        let state = MockState {
            page_size: DEFAULT_PAGE_SIZE,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.lock().page_size = page_size.max(1);
    }

    /// Pin the launch clock (defaults to wall time).
    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.lock().clock = Some(now);
    }

    pub fn insert_instance(&self, instance: RemoteInstance) {
        self.lock()
            .instances
            .insert(instance.instance_id.clone(), instance);
    }

    pub fn instance(&self, instance_id: &str) -> Option<RemoteInstance> {
        self.lock().instances.get(instance_id).cloned()
    }

    pub fn instances(&self) -> Vec<RemoteInstance> {
        self.lock().instances.values().cloned().collect()
    }

    pub fn set_instance_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(i) = self.lock().instances.get_mut(instance_id) {
            i.state = state;
        }
    }

    pub fn remove_instance(&self, instance_id: &str) {
        self.lock().instances.remove(instance_id);
    }

    pub fn add_security_group(&self, group_id: &str, group_name: &str, vpc_id: Option<&str>) {
        self.lock().security_groups.push(SecurityGroup {
            group_id: group_id.to_string(),
            group_name: group_name.to_string(),
            vpc_id: vpc_id.map(str::to_string),
        });
    }

    pub fn add_subnet(&self, subnet_id: &str, vpc_id: &str) {
        self.lock()
            .subnets
            .insert(subnet_id.to_string(), vpc_id.to_string());
    }

    pub fn add_key_pair(&self, key_name: &str, fingerprint: &str) {
        self.lock().key_pairs.push(KeyPairInfo {
            key_name: key_name.to_string(),
            fingerprint: fingerprint.to_string(),
        });
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: MockOp, err: ProviderError) {
        self.fail_times(op, 1, err);
    }

    pub fn fail_times(&self, op: MockOp, times: usize, err: ProviderError) {
        let mut st = self.lock();
        let queue = st.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    /// Hold the next call of `op` before it touches any state.
    pub fn pause_next(&self, op: MockOp) -> MockGate {
        let gate = MockGate::default();
        self.lock().gates.entry(op).or_default().push_back(gate.clone());
        gate
    }

    async fn gate(&self, op: MockOp) {
        let gate = self.lock().gates.get_mut(&op).and_then(VecDeque::pop_front);
        if let Some(gate) = gate {
            gate.pass().await;
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, op: MockOp) -> Vec<MockCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn count_calls(&self, op: MockOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn spot_request(&self, request_id: &str) -> Option<SpotRequest> {
        self.lock().spot_requests.get(request_id).cloned()
    }

    /// Tags set on a non-instance resource (e.g. a spot request).
    pub fn resource_tags(&self, resource_id: &str) -> Option<TagSet> {
        self.lock().resource_tags.get(resource_id).cloned()
    }

    /// Fulfil an open spot request, returning the new instance id.
    pub fn fulfill_spot_request(&self, request_id: &str) -> Option<String> {
        let mut st = self.lock();
        let request = st.spot_launches.remove(request_id)?;
        let instance = st.launch(&request, Some(request_id.to_string()));
        let spot = st.spot_requests.get_mut(request_id)?;
        spot.state = SpotRequestState::Active;
        spot.instance_id = Some(instance.instance_id.clone());
        Some(instance.instance_id)
    }

    pub fn close_spot_request(&self, request_id: &str) {
        let mut st = self.lock();
        st.spot_launches.remove(request_id);
        if let Some(spot) = st.spot_requests.get_mut(request_id) {
            spot.state = SpotRequestState::Closed;
        }
    }
}

/// Build a remote instance fixture.
pub fn remote_instance(instance_id: &str, state: InstanceState, tags: TagSet) -> RemoteInstance {
    RemoteInstance {
        instance_id: instance_id.to_string(),
        image_id: "img-mock".to_string(),
        instance_type: "mock.small".to_string(),
        state,
        tags,
        addresses: HostAddresses {
            private_ip: Some("10.0.99.1".to_string()),
            ..Default::default()
        },
        launched_at: None,
        zone: None,
        subnet_id: None,
        spot_request_id: None,
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<RemoteInstance> {
        self.gate(MockOp::DescribeInstance).await;
        let mut st = self.lock();
        st.record(MockOp::DescribeInstance, &[instance_id.to_string()], None)?;
        st.instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| ProviderError::InstanceNotFound(instance_id.to_string()))
    }

    async fn list_instances_page(
        &self,
        filter: &InstanceFilter,
        next_token: Option<&str>,
    ) -> ProviderResult<InstancePage> {
        let mut st = self.lock();
        st.record(MockOp::ListInstances, &[], Some(&filter.tags))?;
        let offset = match next_token {
            None => 0,
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| ProviderError::InvalidRequest(format!("bad next token `{}`", t)))?,
        };
        let matching: Vec<RemoteInstance> = st
            .instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        let end = (offset + st.page_size).min(matching.len());
        let instances = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_token = (end < matching.len()).then(|| end.to_string());
        Ok(InstancePage {
            instances,
            next_token,
        })
    }

    async fn run_instance(&self, request: &LaunchRequest) -> ProviderResult<RemoteInstance> {
        self.gate(MockOp::RunInstance).await;
        let mut st = self.lock();
        st.record(MockOp::RunInstance, &[], None)?;
        if let Some(existing) = st.client_tokens.get(&request.client_token).cloned() {
            if let Some(i) = st.instances.get(&existing) {
                return Ok(i.clone());
            }
        }
        let instance = st.launch(request, None);
        st.client_tokens
            .insert(request.client_token.clone(), instance.instance_id.clone());
        Ok(instance)
    }

    async fn request_spot_instance(
        &self,
        request: &LaunchRequest,
        _max_bid_price: &str,
    ) -> ProviderResult<SpotRequest> {
        let mut st = self.lock();
        st.record(MockOp::RequestSpot, &[], None)?;
        let request_id = format!("sir-{:08x}", st.next_id());
        let spot = SpotRequest {
            request_id: request_id.clone(),
            state: SpotRequestState::Open,
            instance_id: None,
        };
        st.spot_requests.insert(request_id.clone(), spot.clone());
        st.spot_launches.insert(request_id, request.clone());
        Ok(spot)
    }

    async fn describe_spot_request(&self, request_id: &str) -> ProviderResult<SpotRequest> {
        let mut st = self.lock();
        st.record(MockOp::DescribeSpot, &[request_id.to_string()], None)?;
        st.spot_requests.get(request_id).cloned().ok_or_else(|| {
            ProviderError::from_code(
                "InvalidSpotInstanceRequestID.NotFound",
                format!("spot request `{}` not found", request_id),
            )
        })
    }

    async fn cancel_spot_requests(&self, request_ids: &[String]) -> ProviderResult<()> {
        let mut st = self.lock();
        st.record(MockOp::CancelSpot, request_ids, None)?;
        for id in request_ids {
            st.spot_launches.remove(id);
            if let Some(spot) = st.spot_requests.get_mut(id) {
                spot.state = SpotRequestState::Cancelled;
            }
        }
        Ok(())
    }

    async fn start_instances(&self, instance_ids: &[String]) -> ProviderResult<()> {
        self.gate(MockOp::Start).await;
        let mut st = self.lock();
        st.record(MockOp::Start, instance_ids, None)?;
        for id in instance_ids {
            let instance = st
                .instances
                .get_mut(id)
                .ok_or_else(|| ProviderError::InstanceNotFound(id.clone()))?;
            if instance.state == InstanceState::Stopping {
                return Err(ProviderError::from_code(
                    "IncorrectInstanceState",
                    format!("instance `{}` is stopping", id),
                ));
            }
            if instance.state.is_stopped() {
                instance.state = InstanceState::Running;
            }
        }
        Ok(())
    }

    async fn stop_instances(&self, instance_ids: &[String]) -> ProviderResult<()> {
        self.gate(MockOp::Stop).await;
        let mut st = self.lock();
        st.record(MockOp::Stop, instance_ids, None)?;
        for id in instance_ids {
            let instance = st
                .instances
                .get_mut(id)
                .ok_or_else(|| ProviderError::InstanceNotFound(id.clone()))?;
            if instance.state.is_active() {
                instance.state = InstanceState::Stopped;
            }
        }
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> ProviderResult<()> {
        self.gate(MockOp::Terminate).await;
        let mut st = self.lock();
        st.record(MockOp::Terminate, instance_ids, None)?;
        for id in instance_ids {
            let instance = st
                .instances
                .get_mut(id)
                .ok_or_else(|| ProviderError::InstanceNotFound(id.clone()))?;
            instance.state = InstanceState::Terminated;
        }
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &TagSet) -> ProviderResult<()> {
        self.gate(MockOp::CreateTags).await;
        let mut st = self.lock();
        st.record(MockOp::CreateTags, resource_ids, Some(tags))?;
        for id in resource_ids {
            if let Some(instance) = st.instances.get_mut(id) {
                instance.tags.extend(tags.clone());
            } else if st.spot_requests.contains_key(id) {
                st.resource_tags
                    .entry(id.clone())
                    .or_default()
                    .extend(tags.clone());
            } else {
                return Err(ProviderError::InstanceNotFound(id.clone()));
            }
        }
        Ok(())
    }

    async fn describe_security_groups(
        &self,
        lookup: GroupLookup<'_>,
    ) -> ProviderResult<Vec<SecurityGroup>> {
        let mut st = self.lock();
        let keys = match lookup {
            GroupLookup::Names(names) => names,
            GroupLookup::Ids(ids) => ids,
        };
        st.record(MockOp::DescribeSecurityGroups, keys, None)?;
        Ok(st
            .security_groups
            .iter()
            .filter(|g| match lookup {
                GroupLookup::Names(names) => names.contains(&g.group_name),
                GroupLookup::Ids(ids) => ids.contains(&g.group_id),
            })
            .cloned()
            .collect())
    }

    async fn subnet_in_vpc(&self, subnet_id: &str, vpc_id: &str) -> ProviderResult<bool> {
        let mut st = self.lock();
        st.record(MockOp::SubnetInVpc, &[subnet_id.to_string()], None)?;
        Ok(st.subnets.get(subnet_id).map(String::as_str) == Some(vpc_id))
    }

    async fn describe_key_pairs(&self) -> ProviderResult<Vec<KeyPairInfo>> {
        let mut st = self.lock();
        st.record(MockOp::DescribeKeyPairs, &[], None)?;
        Ok(st.key_pairs.clone())
    }

    async fn probe(&self) -> ProviderResult<()> {
        self.lock().record(MockOp::Probe, &[], None)
    }
}

/// Hands out clones of one shared `MockProvider` and counts sessions.
pub struct MockProviderFactory {
    provider: MockProvider,
    connects: AtomicUsize,
    connect_delay: Duration,
}

impl MockProviderFactory {
    pub fn new(provider: MockProvider) -> Self {
        Self {
            provider,
            connects: AtomicUsize::new(0),
            connect_delay: Duration::ZERO,
        }
    }

    /// Simulated session handshake latency.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn provider(&self) -> &MockProvider {
        &self.provider
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderFactory for MockProviderFactory {
    fn kind(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> ProviderResult<Arc<dyn CloudProvider>> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        self.provider.lock().record(MockOp::Connect, &[], None)?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.provider.clone()))
    }
}
