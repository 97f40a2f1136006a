use chrono::{DateTime, Utc};
use cloudfleet_common::{Cap, ExecutorState, Template, TemplateConfig, Worker};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;

use crate::capacity::CapacityLedger;
use crate::error::FleetError;
use crate::gateway::CloudGateway;
use crate::provider_manager::ProviderManager;
use crate::provisioner::{ConfiguredKeyPairResolver, DemandOptions, KeyPairResolver, ProvisionOutcome, Provisioner};
use crate::reconciler::{OrphanReconciler, SweepReport};
use crate::registry::{InstanceClaims, WorkerRegistry};
use crate::retag::PendingTags;
use crate::retention::{self, RetentionAction, UsageRetention};
use crate::settings::{CloudConfig, EngineSettings, FleetConfig};
use crate::strategies::{self, CapacityPlan, ProvisioningStrategy, StrategyDecision, StrategyState};
use crate::templates::{CloudHandle, CloudPolicy};

/// Everything one engine process owns: the clouds, the worker registry, and
/// the components that act on them.
pub struct EngineContext {
    pub settings: EngineSettings,
    clouds: Vec<Arc<CloudHandle>>,
    pub registry: Arc<WorkerRegistry>,
    pub ledger: Arc<CapacityLedger>,
    pub provisioner: Arc<Provisioner>,
    pub reconciler: Arc<OrphanReconciler>,
    pub pending_tags: Arc<PendingTags>,
    strategies: Vec<Box<dyn ProvisioningStrategy>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerAction {
    pub worker: String,
    pub action: RetentionAction,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub cloud: String,
    pub spot_bound: Vec<String>,
    pub spot_dropped: Vec<String>,
    pub removed: Vec<String>,
    pub actions: Vec<WorkerAction>,
    pub topped_up: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateStatus {
    pub name: String,
    pub instance_cap: String,
    pub min_instances: u32,
    pub labels: Vec<String>,
    pub local_workers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloudStatus {
    pub name: String,
    pub provider: String,
    pub instance_cap: String,
    pub session_generation: u64,
    pub pending_tags: usize,
    pub templates: Vec<TemplateStatus>,
    pub workers: Vec<Worker>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub engine_id: String,
    pub clouds: Vec<CloudStatus>,
}

impl EngineContext {
    pub fn new(settings: EngineSettings, clouds: Vec<Arc<CloudHandle>>) -> Self {
        Self::with_components(
            settings,
            clouds,
            Arc::new(ConfiguredKeyPairResolver),
            strategies::default_strategies(),
        )
    }

    pub fn with_components(
        settings: EngineSettings,
        clouds: Vec<Arc<CloudHandle>>,
        key_resolver: Arc<dyn KeyPairResolver>,
        strategies: Vec<Box<dyn ProvisioningStrategy>>,
    ) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let pending_tags = Arc::new(PendingTags::new());
        let ledger = Arc::new(CapacityLedger::new(&settings.engine_id, registry.clone()));
        let claims = Arc::new(InstanceClaims::new());
        let provisioner = Arc::new(Provisioner::new(
            &settings.engine_id,
            registry.clone(),
            ledger.clone(),
            pending_tags.clone(),
            claims.clone(),
            key_resolver,
        ));
        let reconciler = Arc::new(OrphanReconciler::new(
            &settings.engine_id,
            registry.clone(),
            pending_tags.clone(),
            claims,
            settings.orphan_threshold(),
        ));
        Self {
            settings,
            clouds,
            registry,
            ledger,
            provisioner,
            reconciler,
            pending_tags,
            strategies,
        }
    }

    /// Build the engine from a fleet configuration; any malformed cloud or template fails the whole load.
    pub fn from_config(mut settings: EngineSettings, config: &FleetConfig) -> Result<Self, FleetError> {
        if let Some(id) = config.engine_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            settings.engine_id = id.to_string();
        }
        let mut clouds = Vec::with_capacity(config.clouds.len());
        for cloud in &config.clouds {
            let factory = ProviderManager::factory_for(cloud)?;
            let gateway = Arc::new(CloudGateway::new(&cloud.name, factory));
            clouds.push(Arc::new(cloud_from_config(cloud, gateway)?));
        }
        tracing::info!(
            "⚙️ [engine] id={} loaded {} cloud(s)",
            settings.engine_id,
            clouds.len()
        );
        Ok(Self::new(settings, clouds))
    }

    pub fn clouds(&self) -> &[Arc<CloudHandle>] {
        &self.clouds
    }

    pub fn cloud(&self, name: &str) -> Result<&Arc<CloudHandle>, FleetError> {
        self.clouds
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| FleetError::UnknownCloud(name.to_string()))
    }

    fn template(cloud: &CloudHandle, name: &str) -> Result<Arc<Template>, FleetError> {
        cloud.template(name).ok_or_else(|| FleetError::UnknownTemplate {
            cloud: cloud.name.clone(),
            template: name.to_string(),
        })
    }

    pub async fn can_provision(&self, cloud: &str, template: &str, n: u32) -> Result<bool, FleetError> {
        let cloud = self.cloud(cloud)?;
        let template = Self::template(cloud, template)?;
        self.ledger.can_provision(cloud, &template, n).await
    }

    pub async fn current_count(&self, cloud: &str, template: &str) -> Result<u32, FleetError> {
        let cloud = self.cloud(cloud)?;
        let template = Self::template(cloud, template)?;
        self.ledger.current_count(cloud, &template.name).await
    }

    pub async fn provision(
        &self,
        cloud: &str,
        template: &str,
        count: u32,
        options: &DemandOptions,
    ) -> ProvisionOutcome {
        let resolved = self
            .cloud(cloud)
            .and_then(|c| Self::template(c, template).map(|t| (c, t)));
        match resolved {
            Ok((cloud, template)) => {
                self.provisioner
                    .provision(cloud, &template, count, options, Utc::now())
                    .await
            }
            Err(e) => ProvisionOutcome {
                error: Some(e),
                ..Default::default()
            },
        }
    }

    /// Add or replace a template by name; order is kept for replacements.
    pub fn upsert_template(&self, cloud: &str, config: &TemplateConfig) -> Result<(), FleetError> {
        let cloud = self.cloud(cloud)?;
        let template = Template::from_config(config)?;
        let name = template.name.clone();
        let replaced = cloud.upsert_template(template).is_some();
        tracing::info!(
            "📝 [engine] cloud={} template={} {}",
            cloud.name,
            name,
            if replaced { "replaced" } else { "added" }
        );
        Ok(())
    }

    pub fn remove_template(&self, cloud: &str, template: &str) -> Result<bool, FleetError> {
        Ok(self.cloud(cloud)?.remove_template(template).is_some())
    }

    fn worker(&self, name: &str) -> Result<Worker, FleetError> {
        self.registry
            .get(name)
            .ok_or_else(|| FleetError::UnknownWorker(name.to_string()))
    }

    /// Periodic policies for one worker. A worker whose template was removed is kept.
    pub fn retention_check(&self, worker: &str, now: DateTime<Utc>) -> Result<RetentionAction, FleetError> {
        let worker = self.worker(worker)?;
        let cloud = self.cloud(&worker.cloud_name)?;
        let Some(template) = cloud.template(&worker.template_name) else {
            return Ok(RetentionAction::Keep);
        };
        let count = self
            .registry
            .workers_for_template(&cloud.name, &template.name)
            .len();
        Ok(retention::retention_check(&worker, &template, &cloud.policy, count, now))
    }

    /// Check and carry out the retention policies for one worker.
    pub async fn enforce_retention(&self, worker: &str, now: DateTime<Utc>) -> Result<RetentionAction, FleetError> {
        let action = self.retention_check(worker, now)?;
        if action != RetentionAction::Keep {
            let worker = self.worker(worker)?;
            let cloud = self.cloud(&worker.cloud_name)?;
            retention::dispatch(&cloud.gateway, &self.registry, &worker, action).await?;
        }
        Ok(action)
    }

    pub fn worker_online(&self, worker: &str) -> Result<(), FleetError> {
        self.registry
            .update(worker, |w| w.executor_state = ExecutorState::Online)
            .ok_or_else(|| FleetError::UnknownWorker(worker.to_string()))
    }

    pub fn worker_offline(&self, worker: &str) -> Result<(), FleetError> {
        self.registry
            .update(worker, |w| w.executor_state = ExecutorState::Offline)
            .ok_or_else(|| FleetError::UnknownWorker(worker.to_string()))
    }

    /// Hand a task to the worker. `false` once its usage budget is spent or no executor is free.
    pub fn task_accepted(&self, worker: &str) -> Result<bool, FleetError> {
        self.registry
            .update(worker, |w| {
                if w.retiring || w.busy_executors >= w.num_executors {
                    return false;
                }
                w.mark_busy();
                true
            })
            .ok_or_else(|| FleetError::UnknownWorker(worker.to_string()))
    }

    /// Record a finished task; retires the worker when its usage budget runs out.
    pub async fn task_completed(&self, worker: &str, now: DateTime<Utc>) -> Result<RetentionAction, FleetError> {
        let (action, snapshot) = self
            .registry
            .update(worker, |w| {
                let action = UsageRetention::from_worker(w).on_task_completed(w, now);
                (action, w.clone())
            })
            .ok_or_else(|| FleetError::UnknownWorker(worker.to_string()))?;
        if action != RetentionAction::Keep {
            let cloud = self.cloud(&snapshot.cloud_name)?;
            retention::dispatch(&cloud.gateway, &self.registry, &snapshot, action).await?;
        }
        Ok(action)
    }

    pub async fn terminate_worker(&self, worker: &str) -> Result<(), FleetError> {
        let worker = self.worker(worker)?;
        let cloud = self.cloud(&worker.cloud_name)?;
        retention::dispatch(&cloud.gateway, &self.registry, &worker, RetentionAction::Terminate).await
    }

    /// Run the provisioning strategies for one label until the demand is covered.
    pub async fn plan_capacity(
        &self,
        label: Option<&str>,
        queue_length: u32,
        planned_capacity: u32,
        now: DateTime<Utc>,
    ) -> CapacityPlan {
        let mut state = StrategyState {
            label: label.map(str::to_string),
            queue_length,
            planned_capacity,
            ..Default::default()
        };
        for worker in self.registry.all() {
            if !strategies::worker_matches(&worker, label) {
                continue;
            }
            match worker.executor_state {
                ExecutorState::Online => {
                    state.available_executors = state
                        .available_executors
                        .saturating_add(worker.num_executors.saturating_sub(worker.busy_executors))
                }
                ExecutorState::Connecting => {
                    state.connecting_executors = state.connecting_executors.saturating_add(worker.num_executors)
                }
                ExecutorState::Offline => {}
            }
        }

        let mut plan = CapacityPlan {
            state,
            ..Default::default()
        };
        for strategy in &self.strategies {
            let decision = strategy.apply(self, &mut plan, now).await;
            tracing::debug!("[engine] strategy {} -> {:?}", strategy.name(), decision);
            if decision == StrategyDecision::ProvisioningCompleted {
                plan.completed = true;
                break;
            }
        }
        plan
    }

    /// Orphan sweep over every cloud, now.
    pub async fn run_orphan_sweep(&self) -> Vec<(String, Result<SweepReport, FleetError>)> {
        self.run_orphan_sweep_at(Utc::now()).await
    }

    pub async fn run_orphan_sweep_at(&self, now: DateTime<Utc>) -> Vec<(String, Result<SweepReport, FleetError>)> {
        self.reconciler.sweep_all(&self.clouds, now).await
    }

    /// Retention sweep over every cloud, now.
    pub async fn run_retention_sweep(&self) -> Vec<RetentionReport> {
        self.run_retention_sweep_at(Utc::now()).await
    }

    pub async fn run_retention_sweep_at(&self, now: DateTime<Utc>) -> Vec<RetentionReport> {
        join_all(self.clouds.iter().map(|cloud| self.retention_sweep_cloud(cloud, now))).await
    }

    async fn retention_sweep_cloud(&self, cloud: &CloudHandle, now: DateTime<Utc>) -> RetentionReport {
        let mut report = RetentionReport {
            cloud: cloud.name.clone(),
            ..Default::default()
        };

        let spot = self.reconciler.bind_spot_requests(cloud, now).await;
        report.spot_bound = spot.bound;
        report.spot_dropped = spot.dropped;
        report.removed = self.reconciler.remove_dead_workers(cloud, now).await;

        for worker in self.registry.workers_for_cloud(&cloud.name) {
            if retention::already_retired(&worker) && worker.executor_state == ExecutorState::Online {
                tracing::info!(
                    "🔌 [engine] cloud={} external stop of worker={} detected, disconnecting",
                    cloud.name,
                    worker.name
                );
                self.registry
                    .update(&worker.name, |w| w.executor_state = ExecutorState::Offline);
                continue;
            }
            let Some(template) = cloud.template(&worker.template_name) else {
                continue;
            };
            let count = self
                .registry
                .workers_for_template(&cloud.name, &template.name)
                .len();
            let action = retention::retention_check(&worker, &template, &cloud.policy, count, now);
            if action == RetentionAction::Keep {
                continue;
            }
            match retention::dispatch(&cloud.gateway, &self.registry, &worker, action).await {
                Ok(()) => report.actions.push(WorkerAction {
                    worker: worker.name.clone(),
                    action,
                }),
                Err(e) => {
                    tracing::warn!(
                        "⚠️ [engine] cloud={} worker={} {} failed: {}",
                        cloud.name,
                        worker.name,
                        action.as_str(),
                        e
                    );
                    report.errors.push(e.to_string());
                }
            }
        }

        for template in cloud.templates() {
            if template.min_instances == 0 {
                continue;
            }
            let live = self
                .registry
                .workers_for_template(&cloud.name, &template.name)
                .into_iter()
                .filter(|w| !w.retiring)
                .count();
            let live = u32::try_from(live).unwrap_or(u32::MAX);
            if live >= template.min_instances {
                continue;
            }
            let missing = template.min_instances - live;
            tracing::info!(
                "📈 [engine] cloud={} template={} below minimum ({} < {}), provisioning {}",
                cloud.name,
                template.name,
                live,
                template.min_instances,
                missing
            );
            let outcome = self
                .provisioner
                .provision(cloud, &template, missing, &DemandOptions::default(), now)
                .await;
            report
                .topped_up
                .extend(outcome.workers.into_iter().map(|w| w.name));
            if let Some(e) = outcome.error {
                report.errors.push(e.to_string());
            }
        }
        report
    }

    pub fn status(&self) -> EngineStatus {
        let clouds = self
            .clouds
            .iter()
            .map(|cloud| {
                let workers = self.registry.workers_for_cloud(&cloud.name);
                let templates = cloud
                    .templates()
                    .iter()
                    .map(|t| TemplateStatus {
                        name: t.name.clone(),
                        instance_cap: t.instance_cap.to_string(),
                        min_instances: t.min_instances,
                        labels: t.labels.clone(),
                        local_workers: workers.iter().filter(|w| w.template_name == t.name).count(),
                    })
                    .collect();
                CloudStatus {
                    name: cloud.name.clone(),
                    provider: cloud.gateway.provider_kind().to_string(),
                    instance_cap: cloud.instance_cap.to_string(),
                    session_generation: cloud.gateway.session_generation(),
                    pending_tags: self.pending_tags.pending_for(&cloud.name),
                    templates,
                    workers,
                }
            })
            .collect();
        EngineStatus {
            engine_id: self.settings.engine_id.clone(),
            clouds,
        }
    }
}

/// Validate one cloud's configuration into a handle.
pub fn cloud_from_config(cfg: &CloudConfig, gateway: Arc<CloudGateway>) -> Result<CloudHandle, FleetError> {
    let name = cfg.name.trim();
    if name.is_empty() {
        return Err(FleetError::MalformedCloud {
            cloud: cfg.name.clone(),
            reason: "name is required".to_string(),
        });
    }
    let instance_cap = Cap::parse(cfg.instance_cap.as_deref()).map_err(|e| FleetError::MalformedCloud {
        cloud: name.to_string(),
        reason: format!("invalid instance_cap `{}`", e.0),
    })?;
    let templates = cfg
        .templates
        .iter()
        .map(Template::from_config)
        .collect::<Result<Vec<_>, _>>()?;
    let policy = CloudPolicy {
        cleanup_orphans: cfg.cleanup_orphans,
        reuse_orphans: cfg.reuse_orphans,
        idle_stop_minutes: cfg.idle_stop.as_ref().map(|s| s.max_idle_minutes),
        no_delay_provisioning: cfg.no_delay_provisioning,
        start_stop_nodes: cfg.start_stop_nodes,
    };
    Ok(CloudHandle::new(
        name,
        instance_cap,
        policy,
        cfg.key_pair.clone(),
        gateway,
        templates,
    ))
}
