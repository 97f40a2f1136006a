// Integration tests for retention, planning strategies and template management

mod common;

use chrono::{Duration, Utc};
use cloudfleet_common::{Cap, ExecutorState, InstanceState};
use cloudfleet_orchestrator::engine::EngineContext;
use cloudfleet_orchestrator::error::FleetError;
use cloudfleet_orchestrator::provisioner::DemandOptions;
use cloudfleet_orchestrator::retention::RetentionAction;
use cloudfleet_orchestrator::settings::{EngineSettings, FleetConfig};
use cloudfleet_providers::mock::MockOp;
use common::{fleet, single, t0, template_config, CloudSpec};

async fn one_worker(f: &common::Fleet, template: &str) -> (String, String) {
    let outcome = f
        .engine
        .provision("east", template, 1, &DemandOptions::default())
        .await;
    assert!(outcome.is_complete(), "unexpected error: {:?}", outcome.error);
    let worker = &outcome.workers[0];
    (worker.name.clone(), worker.instance_id.clone().unwrap())
}

#[tokio::test]
async fn test_usage_budget_terminates_after_last_task() {
    let mut cfg = template_config("builder");
    cfg.max_total_uses = Some(2);
    let f = single(vec![cfg]);
    let (name, instance_id) = one_worker(&f, "builder").await;
    f.engine.worker_online(&name).unwrap();

    assert!(f.engine.task_accepted(&name).unwrap());
    let action = f.engine.task_completed(&name, Utc::now()).await.unwrap();
    assert_eq!(action, RetentionAction::Keep);

    assert!(f.engine.task_accepted(&name).unwrap());
    let action = f.engine.task_completed(&name, Utc::now()).await.unwrap();
    assert_eq!(action, RetentionAction::Terminate);

    assert!(f.engine.registry.get(&name).is_none());
    assert_eq!(f.mock("east").instance(&instance_id).unwrap().state, InstanceState::Terminated);
}

#[tokio::test]
async fn test_retiring_worker_waits_for_busy_executors() {
    let mut cfg = template_config("builder");
    cfg.max_total_uses = Some(1);
    cfg.num_executors = Some(2);
    let f = single(vec![cfg]);
    let (name, _) = one_worker(&f, "builder").await;
    f.engine.worker_online(&name).unwrap();

    assert!(f.engine.task_accepted(&name).unwrap());
    assert!(f.engine.task_accepted(&name).unwrap());
    // Third executor does not exist.
    assert!(!f.engine.task_accepted(&name).unwrap());

    let first = f.engine.task_completed(&name, Utc::now()).await.unwrap();
    assert_eq!(first, RetentionAction::Keep);
    assert!(f.engine.registry.get(&name).unwrap().retiring);
    // Retiring workers take no new work.
    assert!(!f.engine.task_accepted(&name).unwrap());

    let last = f.engine.task_completed(&name, Utc::now()).await.unwrap();
    assert_eq!(last, RetentionAction::Terminate);
    assert!(f.engine.registry.get(&name).is_none());
}

#[tokio::test]
async fn test_stop_on_terminate_stops_instead() {
    let mut cfg = template_config("builder");
    cfg.max_total_uses = Some(1);
    cfg.stop_on_terminate = true;
    let f = single(vec![cfg]);
    let (name, instance_id) = one_worker(&f, "builder").await;
    f.engine.worker_online(&name).unwrap();

    assert!(f.engine.task_accepted(&name).unwrap());
    let action = f.engine.task_completed(&name, Utc::now()).await.unwrap();

    assert_eq!(action, RetentionAction::Stop);
    assert_eq!(f.mock("east").instance(&instance_id).unwrap().state, InstanceState::Stopped);
    let worker = f.engine.registry.get(&name).unwrap();
    assert_eq!(worker.executor_state, ExecutorState::Offline);
}

#[tokio::test]
async fn test_idle_worker_is_terminated_after_threshold() {
    let mut cfg = template_config("builder");
    cfg.idle_termination_minutes = Some("30".to_string());
    let f = single(vec![cfg]);
    let (name, instance_id) = one_worker(&f, "builder").await;
    f.engine.worker_online(&name).unwrap();
    let now = Utc::now();

    let early = f.engine.enforce_retention(&name, now + Duration::minutes(29)).await.unwrap();
    assert_eq!(early, RetentionAction::Keep);

    let late = f.engine.enforce_retention(&name, now + Duration::minutes(31)).await.unwrap();
    assert_eq!(late, RetentionAction::Terminate);
    assert!(f.engine.registry.get(&name).is_none());
    assert_eq!(f.mock("east").instance(&instance_id).unwrap().state, InstanceState::Terminated);
}

#[tokio::test]
async fn test_minimum_instances_are_never_idled_away() {
    let mut cfg = template_config("builder");
    cfg.idle_termination_minutes = Some("1".to_string());
    cfg.min_instances = 1;
    let f = single(vec![cfg]);
    let (name, _) = one_worker(&f, "builder").await;
    f.engine.worker_online(&name).unwrap();

    let action = f
        .engine
        .retention_check(&name, Utc::now() + Duration::hours(2))
        .unwrap();

    assert_eq!(action, RetentionAction::Keep);
}

#[tokio::test]
async fn test_connecting_worker_past_launch_timeout_is_terminated() {
    let mut cfg = template_config("builder");
    cfg.launch_timeout_secs = Some(60);
    let f = single(vec![cfg]);
    let (name, _) = one_worker(&f, "builder").await;

    let action = f
        .engine
        .enforce_retention(&name, Utc::now() + Duration::minutes(2))
        .await
        .unwrap();

    assert_eq!(action, RetentionAction::Terminate);
    assert!(f.engine.registry.is_empty());
}

#[tokio::test]
async fn test_cloud_idle_stop_needs_start_stop_nodes() {
    let spec = CloudSpec::new("east")
        .template(template_config("builder"))
        .policy(|p| {
            p.idle_stop_minutes = Some(10);
            p.start_stop_nodes = true;
        });
    let f = fleet(vec![spec]);
    let (name, instance_id) = one_worker(&f, "builder").await;
    f.engine.worker_online(&name).unwrap();

    let action = f
        .engine
        .enforce_retention(&name, Utc::now() + Duration::minutes(11))
        .await
        .unwrap();

    assert_eq!(action, RetentionAction::Stop);
    assert_eq!(f.mock("east").instance(&instance_id).unwrap().state, InstanceState::Stopped);
    assert_eq!(
        f.engine.registry.get(&name).unwrap().executor_state,
        ExecutorState::Offline
    );
}

#[tokio::test]
async fn test_retention_sweep_tops_up_to_minimum() {
    let mut cfg = template_config("builder");
    cfg.min_instances = 2;
    let f = single(vec![cfg]);

    let reports = f.engine.run_retention_sweep_at(t0()).await;
    assert_eq!(reports[0].topped_up.len(), 2);
    assert_eq!(f.engine.registry.len(), 2);

    let reports = f.engine.run_retention_sweep_at(t0()).await;
    assert!(reports[0].topped_up.is_empty());
    assert_eq!(f.mock("east").count_calls(MockOp::RunInstance), 2);
}

#[tokio::test]
async fn test_retention_sweep_disconnects_externally_stopped_worker() {
    let mut cfg = template_config("builder");
    cfg.stop_on_terminate = true;
    let f = single(vec![cfg]);
    let (name, instance_id) = one_worker(&f, "builder").await;
    f.engine.worker_online(&name).unwrap();
    f.mock("east").set_instance_state(&instance_id, InstanceState::Stopped);

    // Once the launch snapshot is older than the freshness window.
    let reports = f
        .engine
        .run_retention_sweep_at(Utc::now() + Duration::minutes(1))
        .await;

    assert!(reports[0].removed.is_empty());
    let worker = f.engine.registry.get(&name).unwrap();
    assert_eq!(worker.executor_state, ExecutorState::Offline);
    assert_eq!(worker.snapshot.state, Some(InstanceState::Stopped));
}

#[tokio::test]
async fn test_no_delay_provisions_the_whole_shortfall() {
    let mut cfg = template_config("builder");
    cfg.num_executors = Some(2);
    let spec = CloudSpec::new("east")
        .template(cfg)
        .policy(|p| p.no_delay_provisioning = true);
    let f = fleet(vec![spec]);

    let plan = f.engine.plan_capacity(Some("linux"), 3, 0, Utc::now()).await;

    assert!(plan.completed);
    assert_eq!(plan.provisioned.len(), 2);
    assert_eq!(plan.state.additional_planned_capacity, 4);
    assert_eq!(f.mock("east").count_calls(MockOp::RunInstance), 2);
}

#[tokio::test]
async fn test_without_no_delay_planning_leaves_demand_open() {
    let f = single(vec![template_config("builder")]);

    let plan = f.engine.plan_capacity(Some("linux"), 2, 0, Utc::now()).await;

    assert!(!plan.completed);
    assert!(plan.provisioned.is_empty());
    assert_eq!(f.mock("east").count_calls(MockOp::RunInstance), 0);
}

#[tokio::test]
async fn test_unmatched_label_provisions_nothing() {
    let spec = CloudSpec::new("east")
        .template(template_config("builder"))
        .policy(|p| p.no_delay_provisioning = true);
    let f = fleet(vec![spec]);

    let plan = f.engine.plan_capacity(Some("windows"), 2, 0, Utc::now()).await;

    assert!(!plan.completed);
    assert!(plan.provisioned.is_empty());
}

#[tokio::test]
async fn test_offline_workers_count_as_pending_capacity() {
    let spec = CloudSpec::new("east")
        .template(template_config("builder"))
        .policy(|p| p.no_delay_provisioning = true);
    let f = fleet(vec![spec]);
    let (name, _) = one_worker(&f, "builder").await;
    f.engine.worker_offline(&name).unwrap();

    let plan = f.engine.plan_capacity(Some("linux"), 1, 0, Utc::now()).await;

    assert!(plan.completed);
    assert!(plan.provisioned.is_empty());
    assert_eq!(f.mock("east").count_calls(MockOp::RunInstance), 1);
}

#[tokio::test]
async fn test_stopped_worker_is_started_for_demand() {
    let spec = CloudSpec::new("east")
        .template(template_config("builder"))
        .policy(|p| p.start_stop_nodes = true);
    let f = fleet(vec![spec]);
    let (name, instance_id) = one_worker(&f, "builder").await;
    f.mock("east").set_instance_state(&instance_id, InstanceState::Stopped);
    f.engine.registry.update(&name, |w| {
        w.executor_state = ExecutorState::Offline;
        w.snapshot.state = Some(InstanceState::Stopped);
    });

    let plan = f.engine.plan_capacity(Some("linux"), 1, 0, Utc::now()).await;

    assert!(plan.completed);
    assert_eq!(plan.started, vec![name.clone()]);
    assert_eq!(f.mock("east").instance(&instance_id).unwrap().state, InstanceState::Running);
    assert_eq!(
        f.engine.registry.get(&name).unwrap().executor_state,
        ExecutorState::Connecting
    );
}

#[tokio::test]
async fn test_online_capacity_covers_demand() {
    let spec = CloudSpec::new("east")
        .template(template_config("builder"))
        .policy(|p| p.no_delay_provisioning = true);
    let f = fleet(vec![spec]);
    let (name, _) = one_worker(&f, "builder").await;
    f.engine.worker_online(&name).unwrap();

    let plan = f.engine.plan_capacity(None, 1, 0, Utc::now()).await;

    assert!(plan.completed);
    assert_eq!(plan.state.available_executors, 1);
    assert_eq!(f.mock("east").count_calls(MockOp::RunInstance), 1);
}

#[tokio::test]
async fn test_templates_can_be_added_replaced_and_removed() {
    let f = single(vec![template_config("builder")]);

    let mut gpu = template_config("gpu");
    gpu.labels = "gpu".to_string();
    f.engine.upsert_template("east", &gpu).unwrap();
    let names: Vec<String> = f.handle("east").templates().iter().map(|t| t.name.clone()).collect();
    assert_eq!(names, vec!["builder", "gpu"]);

    let mut builder = template_config("builder");
    builder.instance_type = "large".to_string();
    f.engine.upsert_template("east", &builder).unwrap();
    let templates = f.handle("east").templates();
    assert_eq!(templates[0].name, "builder");
    assert_eq!(templates[0].instance_type, "large");

    assert!(f.engine.remove_template("east", "gpu").unwrap());
    assert!(!f.engine.remove_template("east", "gpu").unwrap());

    let broken = template_config("");
    assert!(matches!(
        f.engine.upsert_template("east", &broken),
        Err(FleetError::MalformedTemplate(_))
    ));
}

#[tokio::test]
async fn test_unknown_worker_is_reported() {
    let f = single(vec![template_config("builder")]);

    assert!(matches!(
        f.engine.terminate_worker("nobody").await,
        Err(FleetError::UnknownWorker(_))
    ));
    assert!(matches!(f.engine.worker_online("nobody"), Err(FleetError::UnknownWorker(_))));
}

#[tokio::test]
async fn test_status_lists_clouds_templates_and_workers() {
    let f = single(vec![template_config("builder")]);
    one_worker(&f, "builder").await;

    let status = f.engine.status();

    assert_eq!(status.engine_id, common::ENGINE_ID);
    assert_eq!(status.clouds.len(), 1);
    let cloud = &status.clouds[0];
    assert_eq!(cloud.provider, "mock");
    assert_eq!(cloud.instance_cap, "unbounded");
    assert_eq!(cloud.templates[0].local_workers, 1);
    assert_eq!(cloud.workers.len(), 1);
}

#[test]
fn test_engine_loads_from_configuration() {
    let cfg = FleetConfig::from_json(
        r#"{
            "engine_id": "fleet-a",
            "clouds": [{
                "name": "east",
                "provider": "mock",
                "instance_cap": "5",
                "key_pair": {"name": "fleet-key"},
                "start_stop_nodes": true,
                "idle_stop": {"max_idle_minutes": 15},
                "templates": [{"name": "builder", "image_id": "img-1", "instance_type": "small"}]
            }]
        }"#,
    )
    .unwrap();

    let engine = EngineContext::from_config(EngineSettings::default(), &cfg).unwrap();

    assert_eq!(engine.settings.engine_id, "fleet-a");
    let cloud = engine.cloud("east").unwrap();
    assert_eq!(cloud.instance_cap, Cap::Limited(5));
    assert!(cloud.policy.start_stop_nodes);
    assert_eq!(cloud.policy.idle_stop_minutes, Some(15));
    assert!(cloud.policy.cleanup_orphans);
    assert_eq!(cloud.templates().len(), 1);
}

#[test]
fn test_malformed_configuration_is_rejected() {
    let bad_cap = FleetConfig::from_json(
        r#"{"clouds": [{"name": "east", "provider": "mock", "instance_cap": "lots"}]}"#,
    )
    .unwrap();
    assert!(matches!(
        EngineContext::from_config(EngineSettings::default(), &bad_cap),
        Err(FleetError::MalformedCloud { .. })
    ));

    let bad_template = FleetConfig::from_json(
        r#"{"clouds": [{"name": "east", "provider": "mock",
            "templates": [{"name": "builder", "image_id": "", "instance_type": "small"}]}]}"#,
    )
    .unwrap();
    assert!(matches!(
        EngineContext::from_config(EngineSettings::default(), &bad_template),
        Err(FleetError::MalformedTemplate(_))
    ));
}
