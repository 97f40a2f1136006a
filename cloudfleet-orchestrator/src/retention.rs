//! Per-worker retention policies and the dispatch of their actions.
//!
//! Policies are pure: they look at a `Worker` and a clock and return an
//! action. `dispatch` is the only part that talks to the cloud.

use chrono::{DateTime, Duration, Utc};
use cloudfleet_common::{ExecutorState, InstanceState, Template, Worker};
use serde::Serialize;
use serde_json::json;

use crate::error::FleetError;
use crate::gateway::CloudGateway;
use crate::logger;
use crate::registry::WorkerRegistry;
use crate::templates::CloudPolicy;

const BILLING_HOUR_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionAction {
    Keep,
    /// Provider stop; the instance can be started again.
    Stop,
    Terminate,
}

impl RetentionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionAction::Keep => "keep",
            RetentionAction::Stop => "stop",
            RetentionAction::Terminate => "terminate",
        }
    }
}

/// Stop or terminate, as the worker is configured.
pub fn retire_action(worker: &Worker) -> RetentionAction {
    if worker.stop_on_terminate {
        RetentionAction::Stop
    } else {
        RetentionAction::Terminate
    }
}

/// Idle-timeout policy.
///
/// `idle_termination_minutes`:
/// - `0` never retires,
/// - `N > 0` retires after N idle minutes,
/// - `-N` retires an idle worker once N minutes or less remain in its current billing hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleRetention {
    pub idle_termination_minutes: i64,
}

impl IdleRetention {
    pub fn new(idle_termination_minutes: i64) -> Self {
        Self {
            idle_termination_minutes,
        }
    }

    pub fn from_template(template: &Template) -> Self {
        Self::new(template.idle_termination_minutes)
    }

    pub fn check(&self, worker: &Worker, now: DateTime<Utc>) -> RetentionAction {
        if self.idle_termination_minutes == 0 || !worker.is_idle() {
            return RetentionAction::Keep;
        }
        if worker.executor_state == ExecutorState::Connecting {
            return RetentionAction::Keep;
        }
        if already_retired(worker) {
            return RetentionAction::Keep;
        }

        if self.idle_termination_minutes > 0 {
            if worker.idle_for(now) >= Duration::minutes(self.idle_termination_minutes) {
                return retire_action(worker);
            }
            return RetentionAction::Keep;
        }

        let uptime_secs = worker.uptime(now).num_seconds().max(0);
        let left_in_hour = BILLING_HOUR_SECS - uptime_secs % BILLING_HOUR_SECS;
        if left_in_hour <= self.idle_termination_minutes.saturating_abs() * 60 {
            retire_action(worker)
        } else {
            RetentionAction::Keep
        }
    }
}

/// Instance already in the state retirement would put it in.
pub fn already_retired(worker: &Worker) -> bool {
    match worker.snapshot.state {
        Some(InstanceState::Terminated) | Some(InstanceState::ShuttingDown) => true,
        Some(state) if worker.stop_on_terminate => state.is_stopping_or_stopped(),
        _ => false,
    }
}

/// Usage-count policy, evaluated on task completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRetention {
    pub max_total_uses: i32,
}

impl UsageRetention {
    pub fn new(max_total_uses: i32) -> Self {
        Self { max_total_uses }
    }

    pub fn from_worker(worker: &Worker) -> Self {
        Self::new(worker.max_total_uses)
    }

    /// Record one completed task. Returns the retire action exactly once: on the
    /// completion that exhausts the budget with no executor still busy.
    pub fn on_task_completed(&self, worker: &mut Worker, now: DateTime<Utc>) -> RetentionAction {
        let was_retiring = worker.retiring;
        let busy_before = worker.busy_executors;
        worker.mark_task_completed(now);
        if self.max_total_uses <= -1 {
            return RetentionAction::Keep;
        }

        let budget = u32::try_from(self.max_total_uses.max(1)).unwrap_or(1);
        if !worker.retiring && worker.completed_tasks >= budget {
            worker.retiring = true;
            tracing::info!(
                "🔚 [retention] worker={} used {} of {} allowed tasks, no longer accepting work",
                worker.name,
                worker.completed_tasks,
                budget
            );
        }

        let drained_now = worker.busy_executors == 0 && (busy_before > 0 || !was_retiring);
        if worker.retiring && drained_now {
            retire_action(worker)
        } else {
            RetentionAction::Keep
        }
    }
}

/// A worker that never finished connecting within its template's launch timeout.
pub fn check_launch_timeout(worker: &Worker, template: &Template, now: DateTime<Utc>) -> RetentionAction {
    let Some(timeout) = template.launch_timeout else {
        return RetentionAction::Keep;
    };
    if worker.executor_state != ExecutorState::Connecting {
        return RetentionAction::Keep;
    }
    let timeout = Duration::from_std(timeout).unwrap_or_else(|_| Duration::days(36_500));
    if worker.uptime(now) > timeout {
        tracing::info!(
            "⏱️ [retention] worker={} still connecting after {}s (timeout {}s)",
            worker.name,
            worker.uptime(now).num_seconds(),
            timeout.num_seconds()
        );
        RetentionAction::Terminate
    } else {
        RetentionAction::Keep
    }
}

/// Cloud-wide idle stop for online workers; needs `start_stop_nodes`.
pub fn cloud_idle_stop(worker: &Worker, policy: &CloudPolicy, now: DateTime<Utc>) -> RetentionAction {
    let Some(minutes) = policy.idle_stop_minutes.filter(|_| policy.start_stop_nodes) else {
        return RetentionAction::Keep;
    };
    if worker.executor_state != ExecutorState::Online || !worker.is_idle() || already_retired(worker) {
        return RetentionAction::Keep;
    }
    if worker.idle_for(now) >= Duration::minutes(i64::from(minutes)) {
        RetentionAction::Stop
    } else {
        RetentionAction::Keep
    }
}

/// All periodic policies for one worker, in order: launch timeout, the
/// template minimum, idle timeout, cloud idle stop.
pub fn retention_check(
    worker: &Worker,
    template: &Template,
    policy: &CloudPolicy,
    template_count: usize,
    now: DateTime<Utc>,
) -> RetentionAction {
    let action = check_launch_timeout(worker, template, now);
    if action != RetentionAction::Keep {
        return action;
    }
    let min = usize::try_from(template.min_instances).unwrap_or(usize::MAX);
    if template_count > 0 && template_count <= min {
        return RetentionAction::Keep;
    }
    let action = IdleRetention::from_template(template).check(worker, now);
    if action != RetentionAction::Keep {
        return action;
    }
    cloud_idle_stop(worker, policy, now)
}

/// Carry out `action` for the worker; terminated workers leave the registry.
pub async fn dispatch(
    gateway: &CloudGateway,
    registry: &WorkerRegistry,
    worker: &Worker,
    action: RetentionAction,
) -> Result<(), FleetError> {
    let cloud = worker.cloud_name.as_str();
    let meta = json!({"cloud": cloud, "template": worker.template_name, "worker": worker.name});
    match (action, worker.instance_id.as_ref()) {
        (RetentionAction::Keep, _) => Ok(()),
        (RetentionAction::Stop, Some(instance_id)) => {
            if let Err(e) = gateway.stop(std::slice::from_ref(instance_id)).await {
                logger::log_event_with_error("INSTANCE_STOP", "failed", Some(instance_id), Some(&e.to_string()), meta);
                return Err(FleetError::provider(cloud, e));
            }
            registry.update(&worker.name, |w| {
                w.executor_state = ExecutorState::Offline;
                w.snapshot.state = Some(InstanceState::Stopping);
                w.snapshot.fetched_at = None;
            });
            tracing::info!("⏸️ [retention] stopped worker={} instance={}", worker.name, instance_id);
            logger::log_event("INSTANCE_STOP", "success", Some(instance_id), meta);
            Ok(())
        }
        (RetentionAction::Stop, None) | (RetentionAction::Terminate, _) => {
            if let Some(request_id) = worker.launch.spot_request_id() {
                if let Err(e) = gateway.cancel_spot_requests(&[request_id.to_string()]).await {
                    tracing::warn!(
                        "⚠️ [retention] worker={} cancelling spot request {} failed: {}",
                        worker.name,
                        request_id,
                        e
                    );
                }
            }
            if let Some(instance_id) = worker.instance_id.as_ref() {
                if let Err(e) = gateway.terminate(std::slice::from_ref(instance_id)).await {
                    logger::log_event_with_error(
                        "INSTANCE_TERMINATE",
                        "failed",
                        Some(instance_id),
                        Some(&e.to_string()),
                        meta,
                    );
                    return Err(FleetError::provider(cloud, e));
                }
            }
            registry.remove(&worker.name);
            tracing::info!(
                "🗑️ [retention] terminated worker={} instance={:?}",
                worker.name,
                worker.instance_id
            );
            logger::log_event("INSTANCE_TERMINATE", "success", worker.instance_id.as_deref(), meta);
            Ok(())
        }
    }
}
