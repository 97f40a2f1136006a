use chrono::{DateTime, Utc};
use cloudfleet_common::{RemoteSnapshot, Worker};
use cloudfleet_providers::inventory::RemoteInstance;
use cloudfleet_providers::ProviderError;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::gateway::CloudGateway;

/// In-process registry of workers, keyed by worker name.
///
/// Register and remove are idempotent so that the remote terminate and the
/// local removal can be retried independently.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<BTreeMap<String, Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Worker>> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Worker>> {
        self.workers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace.
    pub fn register(&self, worker: Worker) {
        self.write().insert(worker.name.clone(), worker);
    }

    pub fn remove(&self, name: &str) -> Option<Worker> {
        self.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Worker> {
        self.read().get(name).cloned()
    }

    pub fn find_by_instance(&self, instance_id: &str) -> Option<Worker> {
        self.read()
            .values()
            .find(|w| w.instance_id.as_deref() == Some(instance_id))
            .cloned()
    }

    pub fn all(&self) -> Vec<Worker> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn workers_for_cloud(&self, cloud: &str) -> Vec<Worker> {
        self.read()
            .values()
            .filter(|w| w.cloud_name == cloud)
            .cloned()
            .collect()
    }

    pub fn workers_for_template(&self, cloud: &str, template: &str) -> Vec<Worker> {
        self.read()
            .values()
            .filter(|w| w.cloud_name == cloud && w.template_name == template)
            .cloned()
            .collect()
    }

    /// Instance ids of the cloud's workers (pending spot workers have none).
    pub fn instance_ids_for_cloud(&self, cloud: &str) -> HashSet<String> {
        self.read()
            .values()
            .filter(|w| w.cloud_name == cloud)
            .filter_map(|w| w.instance_id.clone())
            .collect()
    }

    /// Apply `f` to the named worker; returns its result, or `None` if unknown.
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut Worker) -> R) -> Option<R> {
        self.write().get_mut(name).map(f)
    }

    /// Return the worker's remote snapshot, re-describing the instance when the
    /// cached one is stale or `force` is set.
    pub async fn refresh_live_state(
        &self,
        gateway: &CloudGateway,
        name: &str,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<RemoteSnapshot>, ProviderError> {
        let Some(worker) = self.get(name) else {
            return Ok(None);
        };
        if !force && worker.snapshot.is_fresh(now) {
            return Ok(Some(worker.snapshot));
        }
        let Some(instance_id) = worker.instance_id.as_deref() else {
            return Ok(Some(worker.snapshot));
        };
        let instance = gateway.describe_instance(instance_id).await?;
        let snapshot = snapshot_of(&instance, now);
        self.update(name, |w| w.snapshot = snapshot.clone());
        Ok(Some(snapshot))
    }
}

/// Instance ids a task is binding to a worker or reclaiming.
///
/// Provisioning holds a claim from candidate selection until the worker is
/// registered; the orphan sweep holds one around each terminate. A claimed id
/// is off limits to everyone else.
#[derive(Default)]
pub struct InstanceClaims {
    ids: Mutex<HashSet<String>>,
}

impl InstanceClaims {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `false` if someone else holds the id.
    pub fn try_claim(&self, instance_id: &str) -> bool {
        self.lock().insert(instance_id.to_string())
    }

    /// Claim the id unless it is claimed or already bound to a worker.
    pub fn claim_unbound(&self, registry: &WorkerRegistry, instance_id: &str) -> bool {
        let mut ids = self.lock();
        if ids.contains(instance_id) || registry.find_by_instance(instance_id).is_some() {
            return false;
        }
        ids.insert(instance_id.to_string())
    }

    pub fn release(&self, instance_id: &str) {
        self.lock().remove(instance_id);
    }

    pub fn is_claimed(&self, instance_id: &str) -> bool {
        self.lock().contains(instance_id)
    }

    pub fn claimed(&self) -> HashSet<String> {
        self.lock().clone()
    }
}

pub fn snapshot_of(instance: &RemoteInstance, now: DateTime<Utc>) -> RemoteSnapshot {
    RemoteSnapshot {
        state: Some(instance.state),
        tags: instance.tags.clone(),
        addresses: instance.addresses.clone(),
        launched_at: instance.launched_at,
        fetched_at: Some(now),
    }
}
