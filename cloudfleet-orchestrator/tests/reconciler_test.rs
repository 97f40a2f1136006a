// Integration tests for the orphan sweep, dead-worker cleanup and spot binding

mod common;

use chrono::{Duration, Utc};
use cloudfleet_common::{tags, InstanceState, LaunchMode, SpotConfig};
use cloudfleet_orchestrator::error::FleetError;
use cloudfleet_orchestrator::provisioner::DemandOptions;
use cloudfleet_providers::mock::{remote_instance, MockOp};
use cloudfleet_providers::ProviderError;
use common::{fleet, owned_instance, single, t0, template_config, CloudSpec};

#[tokio::test]
async fn test_stale_heartbeat_is_reclaimed_fresh_one_is_kept() {
    let f = single(vec![template_config("builder")]);
    let mock = f.mock("east");
    let now = t0();
    mock.insert_instance(owned_instance(
        "i-stale",
        InstanceState::Running,
        "east",
        "builder",
        Some(now - Duration::hours(4)),
    ));
    mock.insert_instance(owned_instance(
        "i-fresh",
        InstanceState::Running,
        "east",
        "builder",
        Some(now - Duration::hours(1)),
    ));
    // Exactly at the threshold is not yet an orphan.
    mock.insert_instance(owned_instance(
        "i-edge",
        InstanceState::Running,
        "east",
        "builder",
        Some(now - Duration::hours(3)),
    ));

    let results = f.engine.run_orphan_sweep_at(now).await;
    let report = results[0].1.as_ref().unwrap();

    assert_eq!(report.listed, 3);
    assert_eq!(report.reclaimed, vec!["i-stale".to_string()]);
    assert_eq!(mock.instance("i-stale").unwrap().state, InstanceState::Terminated);
    assert_eq!(mock.instance("i-fresh").unwrap().state, InstanceState::Running);
    assert_eq!(mock.instance("i-edge").unwrap().state, InstanceState::Running);
}

#[tokio::test]
async fn test_first_seen_instance_is_stamped_not_reclaimed() {
    let f = single(vec![template_config("builder")]);
    let mock = f.mock("east");
    let now = t0();
    mock.insert_instance(owned_instance("i-new", InstanceState::Running, "east", "builder", None));

    let results = f.engine.run_orphan_sweep_at(now).await;
    let report = results[0].1.as_ref().unwrap();

    assert_eq!(report.stamped, vec!["i-new".to_string()]);
    assert!(report.reclaimed.is_empty());
    let stamped = mock.instance("i-new").unwrap();
    assert_eq!(tags::parse_heartbeat(&stamped.tags), Some(now));

    // Three intervals later without anyone refreshing it, it goes.
    let later = now + Duration::hours(3) + Duration::seconds(1);
    let results = f.engine.run_orphan_sweep_at(later).await;
    let report = results[0].1.as_ref().unwrap();
    assert_eq!(report.reclaimed, vec!["i-new".to_string()]);
}

#[tokio::test]
async fn test_locally_known_instances_get_refreshed_heartbeats() {
    let f = single(vec![template_config("builder")]);
    let mock = f.mock("east");
    let outcome = f
        .engine
        .provision("east", "builder", 1, &DemandOptions::default())
        .await;
    let id = outcome.workers[0].instance_id.clone().unwrap();
    // An old heartbeat on a worker we still hold must not get it reclaimed.
    mock.insert_instance({
        let mut i = mock.instance(&id).unwrap();
        i.tags.extend(tags::heartbeat_tag(t0() - Duration::days(2)));
        i
    });

    let results = f.engine.run_orphan_sweep_at(t0()).await;
    let report = results[0].1.as_ref().unwrap();

    assert_eq!(report.refreshed, vec![id.clone()]);
    assert!(report.reclaimed.is_empty());
    assert_eq!(tags::parse_heartbeat(&mock.instance(&id).unwrap().tags), Some(t0()));
}

#[tokio::test]
async fn test_sweep_ignores_foreign_and_stopped_instances() {
    let f = single(vec![template_config("builder")]);
    let mock = f.mock("east");
    let old = t0() - Duration::days(1);
    let mut foreign = tags::classification("other-engine", "east", "builder", LaunchMode::OnDemand);
    foreign.extend(tags::heartbeat_tag(old));
    mock.insert_instance(remote_instance("i-foreign", InstanceState::Running, foreign));
    mock.insert_instance(owned_instance("i-stopped", InstanceState::Stopped, "east", "builder", Some(old)));

    let results = f.engine.run_orphan_sweep_at(t0()).await;
    let report = results[0].1.as_ref().unwrap();

    assert_eq!(report.listed, 0);
    assert_eq!(mock.count_calls(MockOp::Terminate), 0);
    assert_eq!(mock.instance("i-stopped").unwrap().state, InstanceState::Stopped);
}

#[tokio::test]
async fn test_cleanup_disabled_skips_the_cloud() {
    let spec = CloudSpec::new("east")
        .template(template_config("builder"))
        .policy(|p| p.cleanup_orphans = false);
    let f = fleet(vec![spec]);
    f.mock("east").insert_instance(owned_instance(
        "i-stale",
        InstanceState::Running,
        "east",
        "builder",
        Some(t0() - Duration::days(1)),
    ));

    let results = f.engine.run_orphan_sweep_at(t0()).await;
    let report = results[0].1.as_ref().unwrap();

    assert!(report.skipped);
    assert_eq!(f.mock("east").count_calls(MockOp::ListInstances), 0);
    assert_eq!(f.mock("east").instance("i-stale").unwrap().state, InstanceState::Running);
}

#[tokio::test]
async fn test_one_failing_cloud_does_not_stop_the_others() {
    let f = fleet(vec![
        CloudSpec::new("east").template(template_config("builder")),
        CloudSpec::new("west").template(template_config("builder")),
    ]);
    f.mock("west")
        .fail_next(MockOp::Probe, ProviderError::Transport("unreachable".to_string()));
    f.mock("east").insert_instance(owned_instance(
        "i-stale",
        InstanceState::Running,
        "east",
        "builder",
        Some(t0() - Duration::days(1)),
    ));

    let results = f.engine.run_orphan_sweep_at(t0()).await;

    assert_eq!(results.len(), 2);
    let east = results.iter().find(|(c, _)| c == "east").unwrap();
    let west = results.iter().find(|(c, _)| c == "west").unwrap();
    assert_eq!(east.1.as_ref().unwrap().reclaimed, vec!["i-stale".to_string()]);
    assert!(matches!(west.1, Err(FleetError::Provider { .. })));
    assert_eq!(f.mock("west").count_calls(MockOp::ListInstances), 0);
}

#[tokio::test]
async fn test_dead_workers_are_removed_live_ones_refreshed() {
    let f = single(vec![template_config("builder")]);
    let mock = f.mock("east");
    let outcome = f
        .engine
        .provision("east", "builder", 3, &DemandOptions::default())
        .await;
    assert_eq!(outcome.provisioned(), 3);
    let ids: Vec<String> = outcome
        .workers
        .iter()
        .map(|w| w.instance_id.clone().unwrap())
        .collect();
    mock.set_instance_state(&ids[0], InstanceState::Terminated);
    mock.remove_instance(&ids[1]);
    mock.set_instance_state(&ids[2], InstanceState::Stopped);

    let mut removed = f
        .engine
        .reconciler
        .remove_dead_workers(f.handle("east"), t0())
        .await;
    removed.sort();

    let mut expected = vec![outcome.workers[0].name.clone(), outcome.workers[1].name.clone()];
    expected.sort();
    assert_eq!(removed, expected);
    assert_eq!(f.engine.registry.len(), 1);
    let survivor = f.engine.registry.get(&outcome.workers[2].name).unwrap();
    assert_eq!(survivor.snapshot.state, Some(InstanceState::Stopped));
    assert_eq!(survivor.snapshot.fetched_at, Some(t0()));
}

#[tokio::test]
async fn test_transient_describe_failure_keeps_the_worker() {
    let f = single(vec![template_config("builder")]);
    let outcome = f
        .engine
        .provision("east", "builder", 1, &DemandOptions::default())
        .await;
    f.mock("east")
        .fail_next(MockOp::DescribeInstance, ProviderError::Throttled("slow down".to_string()));

    let removed = f
        .engine
        .reconciler
        .remove_dead_workers(f.handle("east"), t0())
        .await;

    assert!(removed.is_empty());
    assert!(f.engine.registry.get(&outcome.workers[0].name).is_some());
}

fn spot_template() -> cloudfleet_common::TemplateConfig {
    let mut cfg = template_config("spotty");
    cfg.spot = Some(SpotConfig {
        max_bid_price: "0.05".to_string(),
        fallback_to_on_demand: false,
    });
    cfg
}

#[tokio::test]
async fn test_fulfilled_spot_request_is_bound_and_tagged() {
    let f = single(vec![spot_template()]);
    let mock = f.mock("east");
    let outcome = f
        .engine
        .provision("east", "spotty", 1, &DemandOptions::default())
        .await;
    let worker = outcome.workers[0].clone();
    let request_id = worker.launch.spot_request_id().unwrap().to_string();

    // Still open: nothing happens.
    let report = f.engine.reconciler.bind_spot_requests(f.handle("east"), t0()).await;
    assert!(report.bound.is_empty() && report.dropped.is_empty());

    let instance_id = mock.fulfill_spot_request(&request_id).unwrap();
    let report = f.engine.reconciler.bind_spot_requests(f.handle("east"), t0()).await;

    assert_eq!(report.bound, vec![worker.name.clone()]);
    let bound = f.engine.registry.get(&worker.name).unwrap();
    assert_eq!(bound.instance_id.as_deref(), Some(instance_id.as_str()));
    let instance_tags = mock.instance(&instance_id).unwrap().tags;
    assert!(tags::is_owned_by(&instance_tags, common::ENGINE_ID, "east"));
    assert_eq!(instance_tags.get(tags::TAG_LAUNCH_MODE).map(String::as_str), Some("spot"));
}

#[tokio::test]
async fn test_closed_spot_request_drops_the_worker() {
    let f = single(vec![spot_template()]);
    let outcome = f
        .engine
        .provision("east", "spotty", 1, &DemandOptions::default())
        .await;
    let worker = outcome.workers[0].clone();
    let request_id = worker.launch.spot_request_id().unwrap().to_string();
    f.mock("east").close_spot_request(&request_id);

    let reports = f.engine.run_retention_sweep_at(t0()).await;

    assert_eq!(reports[0].spot_dropped, vec![worker.name.clone()]);
    assert!(f.engine.registry.get(&worker.name).is_none());
}

#[tokio::test]
async fn test_instance_bound_while_the_sweep_runs_is_kept() {
    let f = single(vec![template_config("builder")]);
    let mock = f.mock("east");
    let now = t0();
    mock.insert_instance(owned_instance("i-new", InstanceState::Running, "east", "builder", None));
    mock.insert_instance(owned_instance(
        "i-stale",
        InstanceState::Running,
        "east",
        "builder",
        Some(now - Duration::hours(4)),
    ));
    // Hold the sweep while it stamps i-new, after it has listed i-stale as stale.
    let gate = mock.pause_next(MockOp::CreateTags);
    let engine = f.engine.clone();
    let sweep = tokio::spawn(async move { engine.run_orphan_sweep_at(now).await });
    gate.reached().await;

    let outcome = f
        .engine
        .provision("east", "builder", 2, &DemandOptions::default())
        .await;
    let mut bound: Vec<String> = outcome
        .workers
        .iter()
        .filter_map(|w| w.instance_id.clone())
        .collect();
    bound.sort();
    assert_eq!(bound, vec!["i-new".to_string(), "i-stale".to_string()]);
    gate.release();

    let results = sweep.await.unwrap();
    let report = results[0].1.as_ref().unwrap();
    assert!(report.reclaimed.is_empty());
    assert_eq!(report.kept, vec!["i-stale".to_string()]);
    assert_eq!(mock.count_calls(MockOp::Terminate), 0);
    assert_eq!(mock.instance("i-stale").unwrap().state, InstanceState::Running);
    assert!(f.engine.registry.find_by_instance("i-stale").is_some());
}

#[tokio::test]
async fn test_instance_being_reclaimed_is_not_reattached() {
    let f = single(vec![template_config("builder")]);
    let mock = f.mock("east");
    let now = t0();
    mock.insert_instance(owned_instance(
        "i-stale",
        InstanceState::Running,
        "east",
        "builder",
        Some(now - Duration::hours(4)),
    ));
    let gate = mock.pause_next(MockOp::Terminate);
    let engine = f.engine.clone();
    let sweep = tokio::spawn(async move { engine.run_orphan_sweep_at(now).await });
    gate.reached().await;

    let outcome = f
        .engine
        .provision("east", "builder", 1, &DemandOptions::default())
        .await;
    assert!(outcome.is_complete(), "unexpected error: {:?}", outcome.error);
    assert_ne!(outcome.workers[0].instance_id.as_deref(), Some("i-stale"));
    assert_eq!(mock.count_calls(MockOp::RunInstance), 1);
    gate.release();

    let results = sweep.await.unwrap();
    let report = results[0].1.as_ref().unwrap();
    assert_eq!(report.reclaimed, vec!["i-stale".to_string()]);
    assert_eq!(mock.instance("i-stale").unwrap().state, InstanceState::Terminated);
}

#[tokio::test]
async fn test_dead_worker_check_trusts_a_fresh_snapshot() {
    let f = single(vec![template_config("builder")]);
    let mock = f.mock("east");
    let outcome = f
        .engine
        .provision("east", "builder", 1, &DemandOptions::default())
        .await;
    let worker = outcome.workers[0].clone();
    let id = worker.instance_id.clone().unwrap();
    let described = mock.count_calls(MockOp::DescribeInstance);

    let later = Utc::now() + Duration::minutes(1);
    let removed = f.engine.reconciler.remove_dead_workers(f.handle("east"), later).await;
    assert!(removed.is_empty());
    mock.set_instance_state(&id, InstanceState::Terminated);
    let removed = f
        .engine
        .reconciler
        .remove_dead_workers(f.handle("east"), later + Duration::seconds(10))
        .await;
    assert!(removed.is_empty());
    assert_eq!(mock.count_calls(MockOp::DescribeInstance), described + 1);

    // Past the freshness window the instance is described again.
    let removed = f
        .engine
        .reconciler
        .remove_dead_workers(f.handle("east"), later + Duration::seconds(25))
        .await;
    assert_eq!(removed, vec![worker.name.clone()]);
    assert_eq!(mock.count_calls(MockOp::DescribeInstance), described + 2);
}

#[tokio::test]
async fn test_registered_instance_without_tags_is_retagged() {
    let f = single(vec![template_config("builder")]);
    let mock = f.mock("east");
    let outcome = f
        .engine
        .provision("east", "builder", 1, &DemandOptions::default())
        .await;
    let id = outcome.workers[0].instance_id.clone().unwrap();
    // Tags lost outside the engine; nothing is queued for it.
    mock.insert_instance({
        let mut i = mock.instance(&id).unwrap();
        i.tags.clear();
        i
    });
    assert_eq!(f.engine.pending_tags.pending_for("east"), 0);

    let results = f.engine.run_orphan_sweep_at(t0()).await;
    let report = results[0].1.as_ref().unwrap();

    assert_eq!(report.listed, 0);
    assert_eq!(report.repaired, vec![id.clone()]);
    assert!(report.reclaimed.is_empty());
    let restored = mock.instance(&id).unwrap().tags;
    assert!(tags::is_owned_by(&restored, common::ENGINE_ID, "east"));
    assert_eq!(tags::template_of(&restored), Some("builder"));
    assert_eq!(tags::parse_heartbeat(&restored), Some(t0()));

    // Visible to the owned listing again.
    let results = f.engine.run_orphan_sweep_at(t0()).await;
    let report = results[0].1.as_ref().unwrap();
    assert_eq!(report.listed, 1);
    assert!(report.repaired.is_empty());
}
