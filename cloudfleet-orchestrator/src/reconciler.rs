use chrono::{DateTime, Utc};
use cloudfleet_common::{tags, InstanceState, LaunchMode, TagSet, Worker};
use cloudfleet_providers::inventory::{InstanceFilter, RemoteInstance, SpotRequestState};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::FleetError;
use crate::gateway::CloudGateway;
use crate::logger;
use crate::registry::{InstanceClaims, WorkerRegistry};
use crate::retag::PendingTags;
use crate::templates::CloudHandle;

const DESCRIBE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cloud: String,
    /// Orphan cleanup is disabled for the cloud.
    pub skipped: bool,
    pub listed: usize,
    /// Queued tag calls that went through this sweep.
    pub retagged: usize,
    /// Registered instances found without their classification tags.
    pub repaired: Vec<String>,
    /// First-seen heartbeats written this sweep.
    pub stamped: Vec<String>,
    /// Heartbeats refreshed for locally known instances.
    pub refreshed: Vec<String>,
    pub reclaimed: Vec<String>,
    /// Stale instances bound to a worker while the sweep was running.
    pub kept: Vec<String>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpotBindReport {
    pub bound: Vec<String>,
    pub dropped: Vec<String>,
}

/// Heartbeat-based orphan detection, dead-worker cleanup and spot binding.
pub struct OrphanReconciler {
    engine_id: String,
    registry: Arc<WorkerRegistry>,
    pending_tags: Arc<PendingTags>,
    claims: Arc<InstanceClaims>,
    threshold: chrono::Duration,
}

impl OrphanReconciler {
    pub fn new(
        engine_id: &str,
        registry: Arc<WorkerRegistry>,
        pending_tags: Arc<PendingTags>,
        claims: Arc<InstanceClaims>,
        threshold: chrono::Duration,
    ) -> Self {
        Self {
            engine_id: engine_id.to_string(),
            registry,
            pending_tags,
            claims,
            threshold,
        }
    }

    pub fn threshold(&self) -> chrono::Duration {
        self.threshold
    }

    /// One sweep of one cloud.
    pub async fn sweep_cloud(&self, cloud: &CloudHandle, now: DateTime<Utc>) -> Result<SweepReport, FleetError> {
        let mut report = SweepReport {
            cloud: cloud.name.clone(),
            ..Default::default()
        };
        if !cloud.policy.cleanup_orphans {
            tracing::debug!("[reconciler] cloud={} orphan cleanup disabled", cloud.name);
            report.skipped = true;
            return Ok(report);
        }
        let gateway = cloud.gateway.as_ref();
        gateway
            .health_probe()
            .await
            .map_err(|e| FleetError::provider(&cloud.name, e))?;

        report.retagged = self.retry_pending_tags(cloud).await;

        let filter = InstanceFilter::default()
            .with_states(&[InstanceState::Running, InstanceState::Pending, InstanceState::Stopping])
            .with_tags(tags::ownership_filter(&self.engine_id, &cloud.name));
        let instances = gateway
            .list_all(&filter)
            .await
            .map_err(|e| FleetError::provider(&cloud.name, e))?;
        report.listed = instances.len();
        report.repaired = self
            .repair_missing_tags(cloud, &instances, now, &mut report.failures)
            .await;

        let local = self.registry.instance_ids_for_cloud(&cloud.name);
        let unstamped: Vec<String> = instances
            .iter()
            .filter(|i| !local.contains(&i.instance_id) && tags::parse_heartbeat(&i.tags).is_none())
            .map(|i| i.instance_id.clone())
            .collect();
        let known: Vec<String> = instances
            .iter()
            .filter(|i| local.contains(&i.instance_id))
            .map(|i| i.instance_id.clone())
            .collect();

        let heartbeat = tags::heartbeat_tag(now);
        report.stamped = self.tag_batched(gateway, &unstamped, &heartbeat, &mut report.failures).await;
        report.refreshed = self.tag_batched(gateway, &known, &heartbeat, &mut report.failures).await;

        let fresh: HashSet<&String> = unstamped.iter().chain(known.iter()).collect();
        for instance in &instances {
            if fresh.contains(&instance.instance_id) {
                continue;
            }
            let Some(seen) = tags::parse_heartbeat(&instance.tags) else {
                continue;
            };
            if now - seen <= self.threshold {
                continue;
            }
            let id = instance.instance_id.clone();
            // The listing is stale by now: a provision call may have bound it since.
            if !self.claims.claim_unbound(&self.registry, &id) {
                tracing::info!(
                    "[reconciler] cloud={} orphan candidate {} is being bound, keeping it",
                    cloud.name,
                    id
                );
                report.kept.push(id);
                continue;
            }
            let meta = json!({
                "cloud": cloud.name,
                "template": tags::template_of(&instance.tags),
                "last_seen": tags::heartbeat_value(seen),
            });
            let terminated = gateway.terminate(std::slice::from_ref(&id)).await;
            self.claims.release(&id);
            match terminated {
                Ok(()) => {
                    tracing::info!(
                        "🧹 [reconciler] cloud={} reclaimed orphan {} (last seen {})",
                        cloud.name,
                        id,
                        seen
                    );
                    logger::log_event("ORPHAN_RECLAIM", "success", Some(&id), meta);
                    self.pending_tags.forget(&cloud.name, &id);
                    report.reclaimed.push(id);
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ [reconciler] cloud={} terminating orphan {} failed: {}",
                        cloud.name,
                        id,
                        e
                    );
                    logger::log_event_with_error("ORPHAN_RECLAIM", "failed", Some(&id), Some(&e.to_string()), meta);
                    report.failures.push(format!("terminate {}: {}", id, e));
                }
            }
        }

        tracing::info!(
            "🔎 [reconciler] cloud={} listed={} stamped={} refreshed={} reclaimed={} retagged={}",
            cloud.name,
            report.listed,
            report.stamped.len(),
            report.refreshed.len(),
            report.reclaimed.len(),
            report.retagged
        );
        Ok(report)
    }

    async fn tag_batched(
        &self,
        gateway: &CloudGateway,
        ids: &[String],
        tags: &TagSet,
        failures: &mut Vec<String>,
    ) -> Vec<String> {
        let mut done = Vec::new();
        for chunk in ids.chunks(tags::MAX_TAG_BATCH) {
            match gateway.tag(chunk, tags).await {
                Ok(()) => done.extend_from_slice(chunk),
                Err(e) => {
                    tracing::warn!(
                        "⚠️ [reconciler] cloud={} heartbeat tagging of {} instance(s) failed: {}",
                        gateway.cloud(),
                        chunk.len(),
                        e
                    );
                    failures.push(format!("heartbeat: {}", e));
                }
            }
        }
        done
    }

    /// Re-apply classification tags to registered instances the owned listing
    /// missed because their tags are gone.
    async fn repair_missing_tags(
        &self,
        cloud: &CloudHandle,
        listed: &[RemoteInstance],
        now: DateTime<Utc>,
        failures: &mut Vec<String>,
    ) -> Vec<String> {
        let seen: HashSet<&str> = listed.iter().map(|i| i.instance_id.as_str()).collect();
        let unseen: HashMap<String, Worker> = self
            .registry
            .workers_for_cloud(&cloud.name)
            .into_iter()
            .filter_map(|w| w.instance_id.clone().map(|id| (id, w)))
            .filter(|(id, _)| !seen.contains(id.as_str()))
            .collect();
        if unseen.is_empty() {
            return Vec::new();
        }

        let filter = InstanceFilter {
            instance_ids: unseen.keys().cloned().collect(),
            ..Default::default()
        }
        .with_states(&[
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::Stopping,
            InstanceState::Stopped,
        ]);
        let found = match cloud.gateway.list_all(&filter).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    "⚠️ [reconciler] cloud={} lookup of {} unlisted worker instance(s) failed: {}",
                    cloud.name,
                    unseen.len(),
                    e
                );
                failures.push(format!("tag repair lookup: {}", e));
                return Vec::new();
            }
        };

        let mut groups: HashMap<(String, LaunchMode), Vec<String>> = HashMap::new();
        for instance in found {
            let Some(worker) = unseen.get(&instance.instance_id) else {
                continue;
            };
            if tags::is_owned_by(&instance.tags, &self.engine_id, &cloud.name)
                && tags::template_of(&instance.tags) == Some(worker.template_name.as_str())
            {
                continue;
            }
            groups
                .entry((worker.template_name.clone(), worker.launch.mode()))
                .or_default()
                .push(instance.instance_id);
        }

        let mut repaired = Vec::new();
        for ((template, mode), ids) in groups {
            let mut repair = tags::classification(&self.engine_id, &cloud.name, &template, mode);
            if let Some(t) = cloud.template(&template) {
                repair = tags::merge_user_tags(repair, t.user_tag_pairs());
            }
            repair.extend(tags::heartbeat_tag(now));
            let done = self.tag_batched(cloud.gateway.as_ref(), &ids, &repair, failures).await;
            for id in &done {
                self.pending_tags.forget(&cloud.name, id);
                tracing::info!(
                    "🏷️ [reconciler] cloud={} restored tags on {} (template {})",
                    cloud.name,
                    id,
                    template
                );
                logger::log_event(
                    "INSTANCE_TAG",
                    "success",
                    Some(id),
                    json!({"cloud": cloud.name, "template": template, "repair": true}),
                );
            }
            repaired.extend(done);
        }
        repaired.sort();
        repaired
    }

    async fn retry_pending_tags(&self, cloud: &CloudHandle) -> usize {
        let mut retagged = 0;
        for pending in self.pending_tags.take(&cloud.name) {
            match cloud.gateway.tag(&pending.resource_ids, &pending.tags).await {
                Ok(()) => {
                    retagged += 1;
                    logger::log_event(
                        "INSTANCE_TAG",
                        "success",
                        pending.resource_ids.first().map(String::as_str),
                        json!({"cloud": cloud.name, "retry": true, "resources": pending.resource_ids}),
                    );
                }
                Err(e) if e.is_not_found() => {
                    tracing::info!(
                        "[reconciler] cloud={} dropping re-tag of {:?}: {}",
                        cloud.name,
                        pending.resource_ids,
                        e
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ [reconciler] cloud={} re-tag of {:?} failed again: {}",
                        cloud.name,
                        pending.resource_ids,
                        e
                    );
                    self.pending_tags.requeue(&cloud.name, pending);
                }
            }
        }
        retagged
    }

    /// Sweep every cloud concurrently; one cloud failing never stops the others.
    pub async fn sweep_all(
        self: &Arc<Self>,
        clouds: &[Arc<CloudHandle>],
        now: DateTime<Utc>,
    ) -> Vec<(String, Result<SweepReport, FleetError>)> {
        let handles: Vec<_> = clouds
            .iter()
            .map(|cloud| {
                let this = Arc::clone(self);
                let cloud = Arc::clone(cloud);
                let name = cloud.name.clone();
                (name, tokio::spawn(async move { this.sweep_cloud(&cloud, now).await }))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    tracing::error!("❌ [reconciler] cloud={} sweep task failed: {}", name, join_err);
                    Err(FleetError::MalformedCloud {
                        cloud: name.clone(),
                        reason: format!("sweep task failed: {}", join_err),
                    })
                }
            };
            if let Err(e) = &result {
                tracing::error!("❌ [reconciler] cloud={} sweep failed: {}", name, e);
            }
            results.push((name, result));
        }
        results
    }

    /// Drop local workers whose instance is terminated or confirmed missing.
    /// Reads go through the live-state cache, so a snapshot younger than the
    /// freshness window is trusted as is.
    pub async fn remove_dead_workers(&self, cloud: &CloudHandle, now: DateTime<Utc>) -> Vec<String> {
        let workers: Vec<_> = self
            .registry
            .workers_for_cloud(&cloud.name)
            .into_iter()
            .filter(|w| w.instance_id.is_some())
            .collect();

        let removed: Vec<Option<String>> = stream::iter(workers)
            .map(|worker| async move {
                let instance_id = worker.instance_id.clone().unwrap_or_default();
                let live = self
                    .registry
                    .refresh_live_state(&cloud.gateway, &worker.name, false, now)
                    .await;
                let gone = match live {
                    Ok(Some(snapshot)) => snapshot.state == Some(InstanceState::Terminated),
                    // Removed by someone else meanwhile.
                    Ok(None) => false,
                    Err(e) if e.is_not_found() => true,
                    Err(e) => {
                        tracing::warn!(
                            "⚠️ [reconciler] cloud={} worker={} describe failed: {}",
                            cloud.name,
                            worker.name,
                            e
                        );
                        false
                    }
                };
                if !gone {
                    return None;
                }
                self.registry.remove(&worker.name);
                tracing::info!(
                    "🪦 [reconciler] cloud={} removed dead worker={} instance={}",
                    cloud.name,
                    worker.name,
                    instance_id
                );
                logger::log_event(
                    "WORKER_REMOVE",
                    "success",
                    Some(&instance_id),
                    json!({"cloud": cloud.name, "template": worker.template_name, "worker": worker.name}),
                );
                Some(worker.name)
            })
            .buffer_unordered(DESCRIBE_CONCURRENCY)
            .collect()
            .await;
        removed.into_iter().flatten().collect()
    }

    /// Bind pending spot workers whose request now has an instance; drop
    /// those whose request finished without one.
    pub async fn bind_spot_requests(&self, cloud: &CloudHandle, now: DateTime<Utc>) -> SpotBindReport {
        let mut report = SpotBindReport::default();
        let pending: Vec<_> = self
            .registry
            .workers_for_cloud(&cloud.name)
            .into_iter()
            .filter(|w| w.is_pending_spot())
            .collect();

        for worker in pending {
            let Some(request_id) = worker.launch.spot_request_id().map(str::to_string) else {
                continue;
            };
            let request = match cloud.gateway.describe_spot_request(&request_id).await {
                Ok(request) => request,
                Err(e) if e.is_not_found() => {
                    self.drop_spot_worker(cloud, &worker.name, &request_id, "request not found");
                    report.dropped.push(worker.name);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ [reconciler] cloud={} spot request {} describe failed: {}",
                        cloud.name,
                        request_id,
                        e
                    );
                    continue;
                }
            };

            match (&request.instance_id, request.state) {
                (Some(instance_id), _) => {
                    let mut instance_tags =
                        tags::classification(&self.engine_id, &cloud.name, &worker.template_name, LaunchMode::Spot);
                    if let Some(template) = cloud.template(&worker.template_name) {
                        instance_tags = tags::merge_user_tags(instance_tags, template.user_tag_pairs());
                    }
                    if let Err(e) = cloud
                        .gateway
                        .tag(std::slice::from_ref(instance_id), &instance_tags)
                        .await
                    {
                        tracing::warn!(
                            "⚠️ [reconciler] cloud={} tagging spot instance {} failed, queued: {}",
                            cloud.name,
                            instance_id,
                            e
                        );
                        self.pending_tags
                            .remember(&cloud.name, vec![instance_id.clone()], instance_tags, now);
                    }
                    self.registry.update(&worker.name, |w| {
                        w.instance_id = Some(instance_id.clone());
                        w.snapshot.fetched_at = None;
                    });
                    tracing::info!(
                        "🎯 [reconciler] cloud={} spot request {} fulfilled by {}",
                        cloud.name,
                        request_id,
                        instance_id
                    );
                    logger::log_event(
                        "SPOT_BIND",
                        "success",
                        Some(instance_id),
                        json!({"cloud": cloud.name, "worker": worker.name, "spot_request_id": request_id}),
                    );
                    report.bound.push(worker.name);
                }
                (None, state) if state.is_finished() => {
                    let reason = match state {
                        SpotRequestState::Cancelled => "request cancelled",
                        SpotRequestState::Failed => "request failed",
                        _ => "request closed",
                    };
                    self.drop_spot_worker(cloud, &worker.name, &request_id, reason);
                    report.dropped.push(worker.name);
                }
                (None, _) => {}
            }
        }
        report
    }

    fn drop_spot_worker(&self, cloud: &CloudHandle, worker: &str, request_id: &str, reason: &str) {
        self.registry.remove(worker);
        self.pending_tags.forget(&cloud.name, request_id);
        tracing::info!(
            "🪦 [reconciler] cloud={} removed spot worker={} ({})",
            cloud.name,
            worker,
            reason
        );
        logger::log_event(
            "WORKER_REMOVE",
            "success",
            None,
            json!({"cloud": cloud.name, "worker": worker, "spot_request_id": request_id, "reason": reason}),
        );
    }
}
