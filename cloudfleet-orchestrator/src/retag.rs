use chrono::{DateTime, Utc};
use cloudfleet_common::TagSet;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A tagging call that failed after a successful launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTag {
    pub resource_ids: Vec<String>,
    pub tags: TagSet,
    pub since: DateTime<Utc>,
}

/// Per-cloud queue of tags still owed to launched resources.
/// Drained by the orphan sweep.
#[derive(Default)]
pub struct PendingTags {
    entries: Mutex<HashMap<String, Vec<PendingTag>>>,
}

impl PendingTags {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<PendingTag>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn remember(&self, cloud: &str, resource_ids: Vec<String>, tags: TagSet, now: DateTime<Utc>) {
        self.requeue(
            cloud,
            PendingTag {
                resource_ids,
                tags,
                since: now,
            },
        );
    }

    pub fn requeue(&self, cloud: &str, pending: PendingTag) {
        self.lock().entry(cloud.to_string()).or_default().push(pending);
    }

    pub fn take(&self, cloud: &str) -> Vec<PendingTag> {
        self.lock().remove(cloud).unwrap_or_default()
    }

    pub fn pending_for(&self, cloud: &str) -> usize {
        self.lock().get(cloud).map(Vec::len).unwrap_or(0)
    }

    /// Forget resources that no longer exist.
    pub fn forget(&self, cloud: &str, resource_id: &str) {
        if let Some(list) = self.lock().get_mut(cloud) {
            list.retain(|p| !p.resource_ids.iter().any(|id| id == resource_id));
        }
    }
}
