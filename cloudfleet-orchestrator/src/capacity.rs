use cloudfleet_common::{tags, InstanceState, Template};
use cloudfleet_providers::inventory::InstanceFilter;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::FleetError;
use crate::registry::WorkerRegistry;
use crate::templates::CloudHandle;

#[derive(Debug, Clone)]
struct LocalEntry {
    instance_id: Option<String>,
    template: String,
}

/// Local workers and one remote listing, taken together.
///
/// Counts union both sides by instance id. A local worker still waiting on a
/// spot request has no id and counts as one.
#[derive(Debug, Clone)]
pub struct CapacitySnapshot {
    pub cloud: String,
    remote: HashMap<String, Option<String>>,
    local: Vec<LocalEntry>,
}

impl CapacitySnapshot {
    fn count_where(&self, template: Option<&str>) -> u32 {
        let wanted = |t: Option<&str>| template.is_none() || t == template;

        let mut ids: HashSet<&str> = self
            .remote
            .iter()
            .filter(|(_, t)| wanted(t.as_deref()))
            .map(|(id, _)| id.as_str())
            .collect();
        let mut pending = 0u32;
        for entry in self.local.iter().filter(|l| wanted(Some(l.template.as_str()))) {
            match entry.instance_id.as_deref() {
                Some(id) => {
                    ids.insert(id);
                }
                None => pending += 1,
            }
        }
        u32::try_from(ids.len()).unwrap_or(u32::MAX).saturating_add(pending)
    }

    pub fn count_for(&self, template: &str) -> u32 {
        self.count_where(Some(template))
    }

    pub fn total(&self) -> u32 {
        self.count_where(None)
    }
}

#[derive(Default)]
struct InFlight {
    per_template: HashMap<(String, String), u32>,
    per_cloud: HashMap<String, u32>,
}

impl InFlight {
    fn template(&self, cloud: &str, template: &str) -> u32 {
        self.per_template
            .get(&(cloud.to_string(), template.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn cloud(&self, cloud: &str) -> u32 {
        self.per_cloud.get(cloud).copied().unwrap_or(0)
    }

    fn add(&mut self, cloud: &str, template: &str, n: u32) {
        *self
            .per_template
            .entry((cloud.to_string(), template.to_string()))
            .or_default() += n;
        *self.per_cloud.entry(cloud.to_string()).or_default() += n;
    }

    fn release(&mut self, cloud: &str, template: &str, n: u32) {
        let key = (cloud.to_string(), template.to_string());
        if let Some(v) = self.per_template.get_mut(&key) {
            *v = v.saturating_sub(n);
            if *v == 0 {
                self.per_template.remove(&key);
            }
        }
        if let Some(v) = self.per_cloud.get_mut(cloud) {
            *v = v.saturating_sub(n);
            if *v == 0 {
                self.per_cloud.remove(cloud);
            }
        }
    }
}

fn lock(in_flight: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Capacity held for a provisioning call in progress. Released on drop.
pub struct Reservation {
    in_flight: Arc<Mutex<InFlight>>,
    cloud: String,
    template: String,
    granted: u32,
}

impl Reservation {
    pub fn granted(&self) -> u32 {
        self.granted
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.granted > 0 {
            lock(&self.in_flight).release(&self.cloud, &self.template, self.granted);
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("cloud", &self.cloud)
            .field("template", &self.template)
            .field("granted", &self.granted)
            .finish()
    }
}

/// Counts instances per template and per cloud against their caps.
pub struct CapacityLedger {
    engine_id: String,
    registry: Arc<WorkerRegistry>,
    in_flight: Arc<Mutex<InFlight>>,
}

impl CapacityLedger {
    pub fn new(engine_id: &str, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            engine_id: engine_id.to_string(),
            registry,
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    async fn remote(&self, cloud: &CloudHandle) -> Result<HashMap<String, Option<String>>, FleetError> {
        let filter = InstanceFilter::default()
            .with_states(&[InstanceState::Pending, InstanceState::Running])
            .with_tags(tags::ownership_filter(&self.engine_id, &cloud.name));
        Ok(cloud
            .gateway
            .list_all(&filter)
            .await
            .map_err(|e| FleetError::provider(&cloud.name, e))?
            .into_iter()
            .map(|i| {
                let template = tags::template_of(&i.tags).map(str::to_string);
                (i.instance_id, template)
            })
            .collect())
    }

    fn with_local(&self, cloud: &CloudHandle, remote: HashMap<String, Option<String>>) -> CapacitySnapshot {
        let local = self
            .registry
            .workers_for_cloud(&cloud.name)
            .into_iter()
            .map(|w| LocalEntry {
                instance_id: w.instance_id,
                template: w.template_name,
            })
            .collect();
        CapacitySnapshot {
            cloud: cloud.name.clone(),
            remote,
            local,
        }
    }

    /// One full remote listing plus the local registry.
    pub async fn snapshot(&self, cloud: &CloudHandle) -> Result<CapacitySnapshot, FleetError> {
        let remote = self.remote(cloud).await?;
        Ok(self.with_local(cloud, remote))
    }

    pub async fn current_count(&self, cloud: &CloudHandle, template: &str) -> Result<u32, FleetError> {
        Ok(self.snapshot(cloud).await?.count_for(template))
    }

    pub async fn current_total(&self, cloud: &CloudHandle) -> Result<u32, FleetError> {
        Ok(self.snapshot(cloud).await?.total())
    }

    /// True if `n` more instances fit under both the template cap and the cloud cap,
    /// counting launches already in flight.
    pub async fn can_provision(
        &self,
        cloud: &CloudHandle,
        template: &Template,
        n: u32,
    ) -> Result<bool, FleetError> {
        let remote = self.remote(cloud).await?;
        let in_flight = lock(&self.in_flight);
        let snapshot = self.with_local(cloud, remote);
        let template_count = snapshot
            .count_for(&template.name)
            .saturating_add(in_flight.template(&cloud.name, &template.name));
        let cloud_count = snapshot
            .total()
            .saturating_add(in_flight.cloud(&cloud.name));
        Ok(template.instance_cap.allows(template_count, n) && cloud.instance_cap.allows(cloud_count, n))
    }

    /// Reserve up to `wanted` units. The grant may be smaller (or zero) when a cap is near.
    pub async fn reserve(
        &self,
        cloud: &CloudHandle,
        template: &Template,
        wanted: u32,
    ) -> Result<Reservation, FleetError> {
        let remote = self.remote(cloud).await?;
        // Local workers are read under the lock: a finished call registers
        // its workers before releasing its reservation.
        let mut in_flight = lock(&self.in_flight);
        let snapshot = self.with_local(cloud, remote);
        let template_count = snapshot
            .count_for(&template.name)
            .saturating_add(in_flight.template(&cloud.name, &template.name));
        let cloud_count = snapshot
            .total()
            .saturating_add(in_flight.cloud(&cloud.name));

        let granted = wanted
            .min(template.instance_cap.headroom(template_count).unwrap_or(u32::MAX))
            .min(cloud.instance_cap.headroom(cloud_count).unwrap_or(u32::MAX));
        if granted > 0 {
            in_flight.add(&cloud.name, &template.name, granted);
        }
        tracing::debug!(
            "[capacity] cloud={} template={} count={} total={} wanted={} granted={}",
            cloud.name,
            template.name,
            template_count,
            cloud_count,
            wanted,
            granted
        );
        Ok(Reservation {
            in_flight: self.in_flight.clone(),
            cloud: cloud.name.clone(),
            template: template.name.clone(),
            granted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(remote: &[(&str, Option<&str>)], local: &[(Option<&str>, &str)]) -> CapacitySnapshot {
        CapacitySnapshot {
            cloud: "east".to_string(),
            remote: remote
                .iter()
                .map(|(id, t)| (id.to_string(), t.map(str::to_string)))
                .collect(),
            local: local
                .iter()
                .map(|(id, t)| LocalEntry {
                    instance_id: id.map(str::to_string),
                    template: t.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn union_deduplicates_by_instance_id() {
        let snap = snapshot(
            &[("i-1", Some("a")), ("i-2", Some("a")), ("i-3", Some("b"))],
            &[(Some("i-1"), "a"), (Some("i-9"), "a")],
        );
        assert_eq!(snap.count_for("a"), 3);
        assert_eq!(snap.count_for("b"), 1);
        assert_eq!(snap.total(), 4);
    }

    #[test]
    fn pending_spot_worker_counts_once() {
        let snap = snapshot(&[("i-1", Some("spot"))], &[(None, "spot"), (Some("i-1"), "spot")]);
        assert_eq!(snap.count_for("spot"), 2);
    }

    #[test]
    fn remote_without_template_tag_counts_only_toward_total() {
        let snap = snapshot(&[("i-1", None)], &[]);
        assert_eq!(snap.count_for("a"), 0);
        assert_eq!(snap.total(), 1);
    }

    #[test]
    fn reservations_release_on_drop() {
        let in_flight = Arc::new(Mutex::new(InFlight::default()));
        lock(&in_flight).add("east", "a", 2);
        {
            let _r = Reservation {
                in_flight: in_flight.clone(),
                cloud: "east".to_string(),
                template: "a".to_string(),
                granted: 2,
            };
            assert_eq!(lock(&in_flight).cloud("east"), 2);
        }
        assert_eq!(lock(&in_flight).cloud("east"), 0);
        assert_eq!(lock(&in_flight).template("east", "a"), 0);
    }
}
