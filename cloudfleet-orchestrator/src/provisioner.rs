use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudfleet_common::template::Placement;
use cloudfleet_common::{tags, InstanceState, LaunchMode, Template, Worker, WorkerLaunch};
use cloudfleet_providers::inventory::{InstanceFilter, LaunchRequest, RemoteInstance, SpotRequest};
use cloudfleet_providers::ProviderError;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use crate::capacity::CapacityLedger;
use crate::error::FleetError;
use crate::gateway::SecurityGroupError;
use crate::logger;
use crate::registry::{snapshot_of, InstanceClaims, WorkerRegistry};
use crate::retag::PendingTags;
use crate::state_machine::{LaunchAttempt, LaunchStage};
use crate::templates::CloudHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKeyPair {
    pub key_name: String,
    pub fingerprint: String,
}

/// Supplies the key pair a launch is bound to.
#[async_trait]
pub trait KeyPairResolver: Send + Sync {
    async fn resolve(&self, cloud: &CloudHandle) -> Result<ResolvedKeyPair, FleetError>;
}

/// Looks up the cloud's configured key pair (by fingerprint, else by name).
pub struct ConfiguredKeyPairResolver;

#[async_trait]
impl KeyPairResolver for ConfiguredKeyPairResolver {
    async fn resolve(&self, cloud: &CloudHandle) -> Result<ResolvedKeyPair, FleetError> {
        let name = cloud.key_pair.name.as_deref().filter(|s| !s.trim().is_empty());
        let fingerprint = cloud
            .key_pair
            .fingerprint
            .as_deref()
            .filter(|s| !s.trim().is_empty());
        if name.is_none() && fingerprint.is_none() {
            return Err(FleetError::NoKeyPair {
                cloud: cloud.name.clone(),
                reason: "no key pair configured".to_string(),
            });
        }
        match cloud.gateway.find_key_pair(name, fingerprint).await {
            Ok(Some(found)) => Ok(ResolvedKeyPair {
                key_name: found.key_name,
                fingerprint: found.fingerprint,
            }),
            Ok(None) => Err(FleetError::NoKeyPair {
                cloud: cloud.name.clone(),
                reason: format!(
                    "key pair {} not found in cloud",
                    fingerprint.or(name).unwrap_or_default()
                ),
            }),
            Err(e) => Err(FleetError::provider(&cloud.name, e)),
        }
    }
}

/// Deterministic round-robin over each template's placements.
#[derive(Default)]
pub struct SubnetRotator {
    cursors: Mutex<HashMap<String, usize>>,
}

impl SubnetRotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, template: &Template) -> Placement {
        let mut placements = template.placements();
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.entry(template.name.clone()).or_insert(0);
        let idx = *cursor % placements.len();
        *cursor = (idx + 1) % placements.len();
        placements.swap_remove(idx)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemandOptions {
    /// Skip reattachment and always launch new capacity.
    pub force_new: bool,
}

/// Result of a provision call. Usable even when `error` is set.
#[derive(Debug, Default)]
pub struct ProvisionOutcome {
    pub workers: Vec<Worker>,
    /// Units refused because a cap was reached (not an error).
    pub declined: u32,
    /// First error; no further units were attempted after it.
    pub error: Option<FleetError>,
}

impl ProvisionOutcome {
    pub fn provisioned(&self) -> usize {
        self.workers.len()
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.declined == 0
    }
}

enum Launched {
    OnDemand(RemoteInstance),
    Spot(SpotRequest, String),
}

pub struct Provisioner {
    engine_id: String,
    registry: Arc<WorkerRegistry>,
    ledger: Arc<CapacityLedger>,
    pending_tags: Arc<PendingTags>,
    key_resolver: Arc<dyn KeyPairResolver>,
    rotator: SubnetRotator,
    claims: Arc<InstanceClaims>,
}

impl Provisioner {
    pub fn new(
        engine_id: &str,
        registry: Arc<WorkerRegistry>,
        ledger: Arc<CapacityLedger>,
        pending_tags: Arc<PendingTags>,
        claims: Arc<InstanceClaims>,
        key_resolver: Arc<dyn KeyPairResolver>,
    ) -> Self {
        Self {
            engine_id: engine_id.to_string(),
            registry,
            ledger,
            pending_tags,
            key_resolver,
            rotator: SubnetRotator::new(),
            claims,
        }
    }

    pub fn rotator(&self) -> &SubnetRotator {
        &self.rotator
    }

    fn release_claim(&self, instance_id: Option<&str>) {
        if let Some(id) = instance_id {
            self.claims.release(id);
        }
    }

    /// Pop the first candidate nobody else is binding or reclaiming.
    fn claim_candidate(&self, candidates: &mut VecDeque<RemoteInstance>) -> Option<RemoteInstance> {
        while let Some(candidate) = candidates.pop_front() {
            if self.claims.claim_unbound(&self.registry, &candidate.instance_id) {
                return Some(candidate);
            }
        }
        None
    }

    /// Launch or reattach up to `count` workers for `template`.
    pub async fn provision(
        &self,
        cloud: &CloudHandle,
        template: &Template,
        count: u32,
        options: &DemandOptions,
        now: DateTime<Utc>,
    ) -> ProvisionOutcome {
        let mut outcome = ProvisionOutcome::default();
        if count == 0 {
            return outcome;
        }
        let meta = json!({"cloud": cloud.name, "template": template.name, "count": count});

        let key = match self.key_resolver.resolve(cloud).await {
            Ok(key) => key,
            Err(e) => {
                let mut attempt = LaunchAttempt::new(&cloud.name, &template.name);
                attempt.advance(LaunchStage::NoKeypair, &e.to_string());
                tracing::error!(
                    "❌ [provisioner] cloud={} template={}: {}",
                    cloud.name,
                    template.name,
                    e
                );
                logger::log_event_with_error("PROVISION", "failed", None, Some(&e.to_string()), meta);
                outcome.error = Some(e);
                return outcome;
            }
        };

        let reservation = match self.ledger.reserve(cloud, template, count).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(
                    "❌ [provisioner] cloud={} template={}: capacity check failed: {}",
                    cloud.name,
                    template.name,
                    e
                );
                outcome.error = Some(e);
                return outcome;
            }
        };
        outcome.declined = count - reservation.granted();
        if outcome.declined > 0 {
            let mut attempt = LaunchAttempt::new(&cloud.name, &template.name);
            attempt.advance(LaunchStage::KeypairResolved, &key.key_name);
            attempt.advance(LaunchStage::CapacityExceeded, "cap reached");
            tracing::info!(
                "🚫 [provisioner] cloud={} template={}: cap reached, declining {} of {} (cap={}, cloud cap={})",
                cloud.name,
                template.name,
                outcome.declined,
                count,
                template.instance_cap,
                cloud.instance_cap
            );
            logger::log_event(
                "PROVISION",
                "capacity_exceeded",
                None,
                json!({"cloud": cloud.name, "template": template.name, "declined": outcome.declined}),
            );
        }

        let mut candidates = if cloud.policy.reuse_orphans && !options.force_new && reservation.granted() > 0 {
            match self.reattach_candidates(cloud, template).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(
                        "⚠️ [provisioner] cloud={} template={}: reattach lookup failed, launching new capacity: {}",
                        cloud.name,
                        template.name,
                        e
                    );
                    VecDeque::new()
                }
            }
        } else {
            VecDeque::new()
        };

        for _ in 0..reservation.granted() {
            let mut attempt = LaunchAttempt::new(&cloud.name, &template.name);
            attempt.advance(LaunchStage::KeypairResolved, &key.key_name);

            let result = match self.claim_candidate(&mut candidates) {
                Some(candidate) => self.reattach(cloud, template, candidate, &mut attempt, now).await,
                None => self.launch_new(cloud, template, &key, &mut attempt, now).await,
            };

            match result {
                Ok(worker) => {
                    self.registry.register(worker.clone());
                    self.release_claim(worker.instance_id.as_deref());
                    attempt.advance(LaunchStage::Bound, &worker.name);
                    outcome.workers.push(worker);
                }
                Err(e) => {
                    tracing::error!(
                        "❌ [provisioner] cloud={} template={}: launch failed after {} worker(s): {}",
                        cloud.name,
                        template.name,
                        outcome.workers.len(),
                        e
                    );
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        drop(reservation);

        if !outcome.workers.is_empty() {
            tracing::info!(
                "✅ [provisioner] cloud={} template={}: {} worker(s) bound",
                cloud.name,
                template.name,
                outcome.workers.len()
            );
        }
        outcome
    }

    /// Stopped instances and running ones nobody owns locally, for this template.
    /// Instances still stopping cannot be started yet and are left for a later call.
    async fn reattach_candidates(
        &self,
        cloud: &CloudHandle,
        template: &Template,
    ) -> Result<VecDeque<RemoteInstance>, FleetError> {
        let filter = InstanceFilter::default()
            .with_states(&[InstanceState::Pending, InstanceState::Running, InstanceState::Stopped])
            .with_tags(tags::ownership_filter(&self.engine_id, &cloud.name))
            .with_tag(tags::TAG_TEMPLATE, &template.name);
        let local = self.registry.instance_ids_for_cloud(&cloud.name);
        let claimed = self.claims.claimed();
        let found = cloud
            .gateway
            .list_all(&filter)
            .await
            .map_err(|e| FleetError::provider(&cloud.name, e))?;
        Ok(found
            .into_iter()
            .filter(|i| !local.contains(&i.instance_id) && !claimed.contains(&i.instance_id))
            .collect())
    }

    async fn reattach(
        &self,
        cloud: &CloudHandle,
        template: &Template,
        candidate: RemoteInstance,
        attempt: &mut LaunchAttempt,
        now: DateTime<Utc>,
    ) -> Result<Worker, FleetError> {
        let instance_id = candidate.instance_id.clone();
        attempt.bind_instance(&instance_id);
        attempt.advance(
            LaunchStage::ReattachCandidateFound,
            &format!("state={}", candidate.state),
        );

        let mut snapshot = snapshot_of(&candidate, now);
        if candidate.state.is_stopped() {
            if let Err(e) = cloud.gateway.start(std::slice::from_ref(&instance_id)).await {
                self.release_claim(Some(&instance_id));
                attempt.advance(LaunchStage::Failed, &e.to_string());
                logger::log_event_with_error(
                    "INSTANCE_START",
                    "failed",
                    Some(&instance_id),
                    Some(&e.to_string()),
                    json!({"cloud": cloud.name, "template": template.name}),
                );
                return Err(FleetError::provider(&cloud.name, e));
            }
            snapshot.state = Some(InstanceState::Pending);
            logger::log_event(
                "INSTANCE_START",
                "success",
                Some(&instance_id),
                json!({"cloud": cloud.name, "template": template.name, "reason": "reattach"}),
            );
        }

        // Refresh the heartbeat so a concurrent orphan sweep does not reclaim it.
        let heartbeat = tags::heartbeat_tag(now);
        match cloud
            .gateway
            .tag(std::slice::from_ref(&instance_id), &heartbeat)
            .await
        {
            Ok(()) => {
                snapshot.tags.extend(heartbeat);
                attempt.advance(LaunchStage::Tagged, "heartbeat");
            }
            Err(e) => tracing::warn!(
                "⚠️ [provisioner] cloud={} instance={}: heartbeat refresh failed: {}",
                cloud.name,
                instance_id,
                e
            ),
        }

        let launch = match (
            candidate.tags.get(tags::TAG_LAUNCH_MODE).and_then(|m| LaunchMode::from_tag_value(m)),
            candidate.spot_request_id.clone(),
        ) {
            (Some(LaunchMode::Spot), Some(request_id)) => WorkerLaunch::Spot {
                request_id,
                max_bid_price: template
                    .spot
                    .as_ref()
                    .map(|s| s.max_bid_price.clone())
                    .unwrap_or_default(),
            },
            _ => WorkerLaunch::OnDemand,
        };
        let mut worker = Worker::new(
            worker_name(template, &instance_id),
            &cloud.name,
            template,
            launch,
            Some(instance_id.clone()),
            now,
        );
        worker.snapshot = snapshot;

        tracing::info!(
            "♻️ [provisioner] cloud={} template={}: reattached {} ({})",
            cloud.name,
            template.name,
            instance_id,
            candidate.state
        );
        logger::log_event(
            "INSTANCE_REATTACH",
            "success",
            Some(&instance_id),
            json!({"cloud": cloud.name, "template": template.name, "previous_state": candidate.state.as_str()}),
        );
        Ok(worker)
    }

    async fn launch_new(
        &self,
        cloud: &CloudHandle,
        template: &Template,
        key: &ResolvedKeyPair,
        attempt: &mut LaunchAttempt,
        now: DateTime<Utc>,
    ) -> Result<Worker, FleetError> {
        let placement = self.rotator.next(template);

        let groups = match cloud
            .gateway
            .resolve_security_groups(&template.security_groups, placement.subnet_id.as_deref())
            .await
        {
            Ok(groups) => groups,
            Err(SecurityGroupError::Provider(e)) => return Err(self.launch_failed(cloud, template, attempt, e)),
            Err(e @ SecurityGroupError::NotAllVpcGroups { .. }) => {
                attempt.advance(LaunchStage::ProviderRejected, &e.to_string());
                tracing::error!(
                    "❌ [provisioner] cloud={} template={} subnet={:?}: {}",
                    cloud.name,
                    template.name,
                    placement.subnet_id,
                    e
                );
                return Err(FleetError::ProviderRejected {
                    cloud: cloud.name.clone(),
                    template: template.name.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let request = LaunchRequest {
            image_id: template.image_id.clone(),
            instance_type: template.instance_type.clone(),
            key_name: key.key_name.clone(),
            zone: placement.zone.clone(),
            subnet_id: placement.subnet_id.clone(),
            security_group_ids: groups.ids,
            security_group_names: groups.names,
            associate_public_ip: template.associate_public_ip,
            iam_instance_profile: template.iam_instance_profile.clone(),
            user_data: template.user_data.clone(),
            client_token: Uuid::new_v4().to_string(),
        };

        let launched = match &template.spot {
            Some(spot) => match cloud.gateway.request_spot(&request, &spot.max_bid_price).await {
                Ok(req) => Launched::Spot(req, spot.max_bid_price.clone()),
                Err(e) if spot.fallback_to_on_demand => {
                    tracing::warn!(
                        "⚠️ [provisioner] cloud={} template={}: spot request failed ({}), falling back to on-demand",
                        cloud.name,
                        template.name,
                        e
                    );
                    match cloud.gateway.launch(&request).await {
                        Ok(instance) => Launched::OnDemand(instance),
                        Err(e) => return Err(self.launch_failed(cloud, template, attempt, e)),
                    }
                }
                Err(e) => return Err(self.launch_failed(cloud, template, attempt, e)),
            },
            None => match cloud.gateway.launch(&request).await {
                Ok(instance) => Launched::OnDemand(instance),
                Err(e) => return Err(self.launch_failed(cloud, template, attempt, e)),
            },
        };

        let (launch, instance_id, resource_ids, mut snapshot) = match &launched {
            Launched::OnDemand(instance) => {
                self.claims.try_claim(&instance.instance_id);
                (
                    WorkerLaunch::OnDemand,
                    Some(instance.instance_id.clone()),
                    vec![instance.instance_id.clone()],
                    snapshot_of(instance, now),
                )
            }
            Launched::Spot(req, bid) => {
                let mut ids = vec![req.request_id.clone()];
                if let Some(id) = &req.instance_id {
                    self.claims.try_claim(id);
                    ids.push(id.clone());
                }
                (
                    WorkerLaunch::Spot {
                        request_id: req.request_id.clone(),
                        max_bid_price: bid.clone(),
                    },
                    req.instance_id.clone(),
                    ids,
                    Default::default(),
                )
            }
        };
        let handle = instance_id.clone().unwrap_or_else(|| resource_ids[0].clone());
        attempt.bind_instance(&handle);
        attempt.advance(
            LaunchStage::NewInstanceLaunched,
            &format!("mode={}", launch.mode().tag_value()),
        );
        logger::log_event(
            "INSTANCE_LAUNCH",
            "success",
            Some(&handle),
            json!({
                "cloud": cloud.name,
                "template": template.name,
                "mode": launch.mode().tag_value(),
                "subnet": placement.subnet_id,
                "zone": placement.zone,
            }),
        );

        let launch_tags = tags::merge_user_tags(
            tags::classification(&self.engine_id, &cloud.name, &template.name, launch.mode()),
            template.user_tag_pairs(),
        );
        match cloud.gateway.tag(&resource_ids, &launch_tags).await {
            Ok(()) => {
                snapshot.tags.extend(launch_tags);
                attempt.advance(LaunchStage::Tagged, "classification");
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ [provisioner] cloud={} template={}: tagging {:?} failed, queued for the next sweep: {}",
                    cloud.name,
                    template.name,
                    resource_ids,
                    e
                );
                logger::log_event_with_error(
                    "INSTANCE_TAG",
                    "failed",
                    Some(&handle),
                    Some(&e.to_string()),
                    json!({"cloud": cloud.name, "template": template.name}),
                );
                self.pending_tags
                    .remember(&cloud.name, resource_ids, launch_tags, now);
            }
        }

        let mut worker = Worker::new(
            worker_name(template, &handle),
            &cloud.name,
            template,
            launch,
            instance_id,
            now,
        );
        worker.snapshot = snapshot;
        Ok(worker)
    }

    fn launch_failed(
        &self,
        cloud: &CloudHandle,
        template: &Template,
        attempt: &mut LaunchAttempt,
        e: ProviderError,
    ) -> FleetError {
        let stage = if e.is_fatal() {
            LaunchStage::ProviderRejected
        } else {
            LaunchStage::Failed
        };
        attempt.advance(stage, &e.to_string());
        logger::log_event_with_error(
            "INSTANCE_LAUNCH",
            "failed",
            None,
            Some(&e.to_string()),
            json!({"cloud": cloud.name, "template": template.name}),
        );
        FleetError::provider(&cloud.name, e)
    }
}

pub fn worker_name(template: &Template, handle: &str) -> String {
    format!("{}-{}", template.name, handle)
}
