// Common test utilities and fixtures
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use cloudfleet_common::{tags, Cap, InstanceState, LaunchMode, TagSet, Template, TemplateConfig};
use cloudfleet_orchestrator::engine::EngineContext;
use cloudfleet_orchestrator::gateway::CloudGateway;
use cloudfleet_orchestrator::retry::RetryPolicy;
use cloudfleet_orchestrator::settings::{EngineSettings, KeyPairConfig};
use cloudfleet_orchestrator::templates::{CloudHandle, CloudPolicy};
use cloudfleet_providers::inventory::RemoteInstance;
use cloudfleet_providers::mock::{remote_instance, MockProvider, MockProviderFactory};
use cloudfleet_providers::ProviderFactory;
use std::sync::Arc;

pub const ENGINE_ID: &str = "cloudfleet";
pub const KEY_NAME: &str = "fleet-key";

/// Fixed clock used by the sweeps.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn template_config(name: &str) -> TemplateConfig {
    TemplateConfig {
        name: name.to_string(),
        image_id: "img-1".to_string(),
        instance_type: "small".to_string(),
        labels: "linux".to_string(),
        ..Default::default()
    }
}

/// Declarative description of one test cloud.
pub struct CloudSpec {
    pub name: String,
    pub instance_cap: Cap,
    pub policy: CloudPolicy,
    pub key_pair: KeyPairConfig,
    pub templates: Vec<TemplateConfig>,
}

impl CloudSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instance_cap: Cap::Unbounded,
            policy: CloudPolicy::default(),
            key_pair: KeyPairConfig {
                name: Some(KEY_NAME.to_string()),
                fingerprint: None,
            },
            templates: Vec::new(),
        }
    }

    pub fn cap(mut self, cap: u32) -> Self {
        self.instance_cap = Cap::Limited(cap);
        self
    }

    pub fn policy(mut self, f: impl FnOnce(&mut CloudPolicy)) -> Self {
        f(&mut self.policy);
        self
    }

    pub fn key_pair(mut self, key_pair: KeyPairConfig) -> Self {
        self.key_pair = key_pair;
        self
    }

    pub fn template(mut self, cfg: TemplateConfig) -> Self {
        self.templates.push(cfg);
        self
    }
}

pub struct TestCloud {
    pub mock: MockProvider,
    pub factory: Arc<MockProviderFactory>,
    pub handle: Arc<CloudHandle>,
}

/// A cloud over a fresh mock provider holding the fleet key pair.
pub fn build_cloud(spec: CloudSpec) -> TestCloud {
    let mock = MockProvider::new();
    mock.add_key_pair(KEY_NAME, "fp:01");
    let factory = Arc::new(MockProviderFactory::new(mock.clone()));
    let dyn_factory: Arc<dyn ProviderFactory> = factory.clone();
    let gateway = Arc::new(CloudGateway::with_describe_policy(
        &spec.name,
        dyn_factory,
        RetryPolicy::none(),
    ));
    let templates = spec
        .templates
        .iter()
        .map(|cfg| Template::from_config(cfg).expect("valid template"))
        .collect();
    let handle = Arc::new(CloudHandle::new(
        &spec.name,
        spec.instance_cap,
        spec.policy,
        spec.key_pair,
        gateway,
        templates,
    ));
    TestCloud {
        mock,
        factory,
        handle,
    }
}

pub struct Fleet {
    pub engine: Arc<EngineContext>,
    pub clouds: Vec<TestCloud>,
}

impl Fleet {
    pub fn cloud(&self, name: &str) -> &TestCloud {
        self.clouds
            .iter()
            .find(|c| c.handle.name == name)
            .expect("cloud exists")
    }

    pub fn mock(&self, name: &str) -> &MockProvider {
        &self.cloud(name).mock
    }

    pub fn handle(&self, name: &str) -> &Arc<CloudHandle> {
        &self.cloud(name).handle
    }
}

pub fn fleet(specs: Vec<CloudSpec>) -> Fleet {
    let clouds: Vec<TestCloud> = specs.into_iter().map(build_cloud).collect();
    let handles = clouds.iter().map(|c| c.handle.clone()).collect();
    let engine = Arc::new(EngineContext::new(EngineSettings::default(), handles));
    Fleet { engine, clouds }
}

/// One cloud named `east` with the given templates.
pub fn single(templates: Vec<TemplateConfig>) -> Fleet {
    let spec = templates
        .into_iter()
        .fold(CloudSpec::new("east"), CloudSpec::template);
    fleet(vec![spec])
}

pub fn owned_tags(cloud: &str, template: &str) -> TagSet {
    tags::classification(ENGINE_ID, cloud, template, LaunchMode::OnDemand)
}

/// An instance carrying this engine's ownership tags, with an optional heartbeat.
pub fn owned_instance(
    instance_id: &str,
    state: InstanceState,
    cloud: &str,
    template: &str,
    last_seen: Option<DateTime<Utc>>,
) -> RemoteInstance {
    let mut tags = owned_tags(cloud, template);
    if let Some(seen) = last_seen {
        tags.extend(tags::heartbeat_tag(seen));
    }
    remote_instance(instance_id, state, tags)
}
