use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConnectionStrategy, HostAddresses, InstanceState, LaunchMode, TagSet, Template};

/// Minimum age of the live-state snapshot before a non-forced read goes back to the cloud.
pub const LIVE_STATE_MIN_REFRESH_SECS: i64 = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WorkerLaunch {
    OnDemand,
    Spot {
        request_id: String,
        max_bid_price: String,
    },
}

impl WorkerLaunch {
    pub fn mode(&self) -> LaunchMode {
        match self {
            WorkerLaunch::OnDemand => LaunchMode::OnDemand,
            WorkerLaunch::Spot { .. } => LaunchMode::Spot,
        }
    }

    pub fn spot_request_id(&self) -> Option<&str> {
        match self {
            WorkerLaunch::OnDemand => None,
            WorkerLaunch::Spot { request_id, .. } => Some(request_id),
        }
    }
}

/// Executor state as reported by the scheduler. Read-only for the engine,
/// except for marking a restarted worker as connecting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorState {
    Online,
    Offline,
    #[default]
    Connecting,
}

/// Last known remote view of the worker's instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RemoteSnapshot {
    pub state: Option<InstanceState>,
    pub tags: TagSet,
    pub addresses: HostAddresses,
    pub launched_at: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl RemoteSnapshot {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.fetched_at {
            Some(at) => {
                let age = now - at;
                age >= Duration::zero() && age < Duration::seconds(LIVE_STATE_MIN_REFRESH_SECS)
            }
            None => false,
        }
    }
}

/// Local record bound to one remote instance.
///
/// A spot worker may exist before its request is fulfilled; `instance_id` is
/// then `None` and the spot request id is the only remote handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub name: String,
    pub instance_id: Option<String>,
    pub template_name: String,
    pub cloud_name: String,
    pub launch: WorkerLaunch,
    pub connection_strategy: ConnectionStrategy,
    pub snapshot: RemoteSnapshot,
    pub created_at: DateTime<Utc>,

    pub executor_state: ExecutorState,
    pub num_executors: u32,
    pub busy_executors: u32,
    /// Set while every executor is idle.
    pub idle_since: Option<DateTime<Utc>>,
    pub labels: Vec<String>,

    pub completed_tasks: u32,
    pub max_total_uses: i32,
    /// Usage budget reached; the worker is waiting for retirement.
    pub retiring: bool,
    pub stop_on_terminate: bool,
}

impl Worker {
    pub fn new(
        name: String,
        cloud_name: &str,
        template: &Template,
        launch: WorkerLaunch,
        instance_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Worker {
            name,
            instance_id,
            template_name: template.name.clone(),
            cloud_name: cloud_name.to_string(),
            launch,
            connection_strategy: template.connection_strategy,
            snapshot: RemoteSnapshot::default(),
            created_at: now,
            executor_state: ExecutorState::Connecting,
            num_executors: template.num_executors,
            busy_executors: 0,
            idle_since: Some(now),
            labels: template.labels.clone(),
            completed_tasks: 0,
            max_total_uses: template.max_total_uses,
            retiring: false,
            stop_on_terminate: template.stop_on_terminate,
        }
    }

    pub fn host_address(&self) -> Option<String> {
        self.connection_strategy.resolve(&self.snapshot.addresses)
    }

    pub fn is_pending_spot(&self) -> bool {
        self.instance_id.is_none() && matches!(self.launch, WorkerLaunch::Spot { .. })
    }

    pub fn is_idle(&self) -> bool {
        self.busy_executors == 0 && self.idle_since.is_some()
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        match self.idle_since {
            Some(since) if self.busy_executors == 0 => now - since,
            _ => Duration::zero(),
        }
    }

    /// Time since the instance was launched, falling back to local creation.
    pub fn uptime(&self, now: DateTime<Utc>) -> Duration {
        now - self.snapshot.launched_at.unwrap_or(self.created_at)
    }

    pub fn mark_busy(&mut self) {
        self.busy_executors = (self.busy_executors + 1).min(self.num_executors);
        self.idle_since = None;
    }

    pub fn mark_task_completed(&mut self, now: DateTime<Utc>) {
        self.completed_tasks = self.completed_tasks.saturating_add(1);
        self.busy_executors = self.busy_executors.saturating_sub(1);
        if self.busy_executors == 0 {
            self.idle_since = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TemplateConfig;
    use chrono::TimeZone;

    fn worker(now: DateTime<Utc>) -> Worker {
        let template = Template::from_config(&TemplateConfig {
            name: "builder".to_string(),
            image_id: "img".to_string(),
            instance_type: "small".to_string(),
            num_executors: Some(2),
            ..Default::default()
        })
        .unwrap();
        Worker::new("w-1".to_string(), "east", &template, WorkerLaunch::OnDemand, Some("i-1".to_string()), now)
    }

    #[test]
    fn snapshot_freshness_window() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut snap = RemoteSnapshot::default();
        assert!(!snap.is_fresh(now));
        snap.fetched_at = Some(now - Duration::seconds(19));
        assert!(snap.is_fresh(now));
        snap.fetched_at = Some(now - Duration::seconds(20));
        assert!(!snap.is_fresh(now));
        // Fetched after `now`: the caller's clock is not comparable, refetch.
        snap.fetched_at = Some(now + Duration::seconds(5));
        assert!(!snap.is_fresh(now));
    }

    #[test]
    fn idle_tracking_follows_executors() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut w = worker(now);
        assert!(w.is_idle());
        w.mark_busy();
        w.mark_busy();
        w.mark_busy();
        assert_eq!(w.busy_executors, 2);
        assert_eq!(w.idle_for(now + Duration::minutes(5)), Duration::zero());

        w.mark_task_completed(now + Duration::minutes(1));
        assert!(!w.is_idle());
        w.mark_task_completed(now + Duration::minutes(2));
        assert!(w.is_idle());
        assert_eq!(w.completed_tasks, 2);
        assert_eq!(w.idle_for(now + Duration::minutes(12)), Duration::minutes(10));
    }

    #[test]
    fn pending_spot_has_no_instance() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut w = worker(now);
        w.instance_id = None;
        w.launch = WorkerLaunch::Spot {
            request_id: "sir-1".to_string(),
            max_bid_price: "0.1".to_string(),
        };
        assert!(w.is_pending_spot());
        assert_eq!(w.launch.spot_request_id(), Some("sir-1"));
    }
}
