//! Capacity-planning strategies, consulted in order until one reports the
//! demand covered. Capacity is counted in executors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudfleet_common::{labels, ExecutorState, Worker};
use serde::Serialize;
use serde_json::json;

use crate::engine::EngineContext;
use crate::logger;
use crate::provisioner::DemandOptions;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StrategyState {
    /// Label expression of the demand; `None` is unlabeled demand.
    pub label: Option<String>,
    pub queue_length: u32,
    /// Idle executors on online workers.
    pub available_executors: u32,
    pub connecting_executors: u32,
    /// Capacity planned in earlier rounds and not yet online.
    pub planned_capacity: u32,
    /// Capacity added by strategies this round.
    pub additional_planned_capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyDecision {
    ProvisioningCompleted,
    ConsultRemainingStrategies,
}

/// What a planning round did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CapacityPlan {
    pub state: StrategyState,
    pub completed: bool,
    pub started: Vec<String>,
    pub provisioned: Vec<String>,
    pub errors: Vec<String>,
}

#[async_trait]
pub trait ProvisioningStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, engine: &EngineContext, plan: &mut CapacityPlan, now: DateTime<Utc>) -> StrategyDecision;
}

pub fn default_strategies() -> Vec<Box<dyn ProvisioningStrategy>> {
    vec![Box::new(StartStoppedStrategy), Box::new(NoDelayStrategy)]
}

pub fn worker_matches(worker: &Worker, label: Option<&str>) -> bool {
    match label.map(str::trim).filter(|l| !l.is_empty()) {
        None => true,
        Some(expr) => labels::expression_matches(expr, &worker.labels),
    }
}

fn decide(available: u32, demand: u32) -> StrategyDecision {
    if available >= demand {
        StrategyDecision::ProvisioningCompleted
    } else {
        StrategyDecision::ConsultRemainingStrategies
    }
}

/// Starts one stopped worker matching the demand, on clouds with `start_stop_nodes`.
pub struct StartStoppedStrategy;

#[async_trait]
impl ProvisioningStrategy for StartStoppedStrategy {
    fn name(&self) -> &'static str {
        "start-stopped"
    }

    async fn apply(&self, engine: &EngineContext, plan: &mut CapacityPlan, _now: DateTime<Utc>) -> StrategyDecision {
        let label = plan.state.label.clone();
        let demand = plan.state.queue_length;
        let mut available = plan
            .state
            .available_executors
            .saturating_add(plan.state.additional_planned_capacity)
            .saturating_add(plan.state.planned_capacity);
        tracing::debug!("[strategy:{}] demand={} available={}", self.name(), demand, available);

        if demand > available {
            'clouds: for cloud in engine.clouds().iter().filter(|c| c.policy.start_stop_nodes) {
                let stopped = engine
                    .registry
                    .workers_for_cloud(&cloud.name)
                    .into_iter()
                    .filter(|w| w.executor_state != ExecutorState::Online && worker_matches(w, label.as_deref()))
                    .filter(|w| w.snapshot.state.map(|s| s.is_stopped()).unwrap_or(false));
                for worker in stopped {
                    let Some(instance_id) = worker.instance_id.clone() else {
                        continue;
                    };
                    match cloud.gateway.start(std::slice::from_ref(&instance_id)).await {
                        Ok(()) => {
                            engine.registry.update(&worker.name, |w| {
                                w.executor_state = ExecutorState::Connecting;
                                w.snapshot.state = Some(cloudfleet_common::InstanceState::Pending);
                                w.snapshot.fetched_at = None;
                            });
                            tracing::info!(
                                "▶️ [strategy:{}] cloud={} started worker={} instance={}",
                                self.name(),
                                cloud.name,
                                worker.name,
                                instance_id
                            );
                            logger::log_event(
                                "INSTANCE_START",
                                "success",
                                Some(&instance_id),
                                json!({"cloud": cloud.name, "worker": worker.name, "reason": "demand"}),
                            );
                            plan.state.additional_planned_capacity =
                                plan.state.additional_planned_capacity.saturating_add(worker.num_executors);
                            available = available.saturating_add(worker.num_executors);
                            plan.started.push(worker.name);
                            break 'clouds;
                        }
                        Err(e) => {
                            tracing::info!(
                                "[strategy:{}] cloud={} unable to start worker={}: {}",
                                self.name(),
                                cloud.name,
                                worker.name,
                                e
                            );
                            plan.errors.push(format!("start {}: {}", worker.name, e));
                        }
                    }
                }
            }
        }
        decide(available, demand)
    }
}

/// Provisions the whole shortfall at once on the first cloud with
/// `no_delay_provisioning` that has a matching template.
pub struct NoDelayStrategy;

impl NoDelayStrategy {
    /// Executors of workers that exist but are neither online nor connecting, excluding stopped ones.
    pub fn provisioned_not_executing(workers: &[Worker], label: Option<&str>) -> u32 {
        workers
            .iter()
            .filter(|w| worker_matches(w, label))
            .filter(|w| w.executor_state == ExecutorState::Offline)
            .filter(|w| !w.snapshot.state.map(|s| s.is_stopping_or_stopped()).unwrap_or(false))
            .fold(0u32, |acc, w| acc.saturating_add(w.num_executors))
    }
}

#[async_trait]
impl ProvisioningStrategy for NoDelayStrategy {
    fn name(&self) -> &'static str {
        "no-delay"
    }

    async fn apply(&self, engine: &EngineContext, plan: &mut CapacityPlan, now: DateTime<Utc>) -> StrategyDecision {
        let label = plan.state.label.clone();
        let demand = plan.state.queue_length;
        let mut available = plan
            .state
            .available_executors
            .saturating_add(plan.state.connecting_executors)
            .saturating_add(plan.state.planned_capacity)
            .saturating_add(plan.state.additional_planned_capacity)
            .saturating_add(Self::provisioned_not_executing(&engine.registry.all(), label.as_deref()));
        tracing::debug!("[strategy:{}] demand={} available={}", self.name(), demand, available);

        if available < demand {
            for cloud in engine.clouds().iter().filter(|c| c.policy.no_delay_provisioning) {
                let Some(template) = cloud.template_for_label(label.as_deref()) else {
                    continue;
                };
                match engine.ledger.can_provision(cloud, &template, 1).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        plan.errors.push(e.to_string());
                        continue;
                    }
                }
                let shortfall = demand - available;
                let count = shortfall.div_ceil(template.num_executors.max(1));
                let outcome = engine
                    .provisioner
                    .provision(cloud, &template, count, &DemandOptions::default(), now)
                    .await;
                let added = u32::try_from(outcome.workers.len())
                    .unwrap_or(u32::MAX)
                    .saturating_mul(template.num_executors);
                tracing::info!(
                    "🚀 [strategy:{}] cloud={} template={} shortfall={} planned {} worker(s)",
                    self.name(),
                    cloud.name,
                    template.name,
                    shortfall,
                    outcome.workers.len()
                );
                plan.state.additional_planned_capacity = plan.state.additional_planned_capacity.saturating_add(added);
                available = available.saturating_add(added);
                plan.provisioned.extend(outcome.workers.into_iter().map(|w| w.name));
                if let Some(e) = outcome.error {
                    plan.errors.push(e.to_string());
                }
                break;
            }
        }
        decide(available, demand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudfleet_common::{InstanceState, Template, TemplateConfig, WorkerLaunch};

    fn worker(labels: &str, state: ExecutorState, instance: Option<InstanceState>) -> Worker {
        let template = Template::from_config(&TemplateConfig {
            name: "builder".to_string(),
            image_id: "img".to_string(),
            instance_type: "small".to_string(),
            labels: labels.to_string(),
            num_executors: Some(2),
            ..Default::default()
        })
        .unwrap();
        let mut w = Worker::new(
            "builder-i-1".to_string(),
            "east",
            &template,
            WorkerLaunch::OnDemand,
            Some("i-1".to_string()),
            Utc::now(),
        );
        w.executor_state = state;
        w.snapshot.state = instance;
        w
    }

    #[test]
    fn unlabeled_demand_matches_every_worker() {
        let w = worker("linux", ExecutorState::Online, None);
        assert!(worker_matches(&w, None));
        assert!(worker_matches(&w, Some("linux")));
        assert!(!worker_matches(&w, Some("windows")));
    }

    #[test]
    fn stopped_workers_are_not_counted_as_pending_capacity() {
        let workers = vec![
            worker("linux", ExecutorState::Offline, Some(InstanceState::Running)),
            worker("linux", ExecutorState::Offline, Some(InstanceState::Stopped)),
            worker("linux", ExecutorState::Connecting, Some(InstanceState::Pending)),
            worker("linux", ExecutorState::Online, Some(InstanceState::Running)),
        ];
        assert_eq!(NoDelayStrategy::provisioned_not_executing(&workers, Some("linux")), 2);
        assert_eq!(NoDelayStrategy::provisioned_not_executing(&workers, Some("windows")), 0);
    }

    #[test]
    fn pending_capacity_saturates_instead_of_overflowing() {
        let mut big = worker("linux", ExecutorState::Offline, Some(InstanceState::Running));
        big.num_executors = u32::MAX;
        let workers = vec![big.clone(), big];
        assert_eq!(NoDelayStrategy::provisioned_not_executing(&workers, None), u32::MAX);
    }

    #[test]
    fn stopping_workers_are_not_counted_as_pending_capacity() {
        let workers = vec![worker("linux", ExecutorState::Offline, Some(InstanceState::Stopping))];
        assert_eq!(NoDelayStrategy::provisioned_not_executing(&workers, None), 0);
    }

    #[test]
    fn decision_compares_capacity_with_demand() {
        assert_eq!(decide(3, 3), StrategyDecision::ProvisioningCompleted);
        assert_eq!(decide(2, 3), StrategyDecision::ConsultRemainingStrategies);
    }
}
