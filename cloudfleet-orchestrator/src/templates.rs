use cloudfleet_common::{Cap, Template};
use std::sync::{Arc, PoisonError, RwLock};

use crate::gateway::CloudGateway;
use crate::settings::KeyPairConfig;

/// Cloud-wide policy toggles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudPolicy {
    pub cleanup_orphans: bool,
    /// Reattach stopped or unowned instances before launching new ones.
    pub reuse_orphans: bool,
    /// Stop online workers idle for this many minutes.
    pub idle_stop_minutes: Option<u32>,
    pub no_delay_provisioning: bool,
    /// Restart stopped workers before asking for new capacity.
    pub start_stop_nodes: bool,
}

impl Default for CloudPolicy {
    fn default() -> Self {
        Self {
            cleanup_orphans: true,
            reuse_orphans: true,
            idle_stop_minutes: None,
            no_delay_provisioning: false,
            start_stop_nodes: false,
        }
    }
}

/// One configured cloud: its gateway, caps, policies and ordered templates.
pub struct CloudHandle {
    pub name: String,
    pub instance_cap: Cap,
    pub policy: CloudPolicy,
    pub key_pair: KeyPairConfig,
    pub gateway: Arc<CloudGateway>,
    templates: RwLock<Vec<Arc<Template>>>,
}

impl CloudHandle {
    pub fn new(
        name: &str,
        instance_cap: Cap,
        policy: CloudPolicy,
        key_pair: KeyPairConfig,
        gateway: Arc<CloudGateway>,
        templates: Vec<Template>,
    ) -> Self {
        let handle = Self {
            name: name.to_string(),
            instance_cap,
            policy,
            key_pair,
            gateway,
            templates: RwLock::new(Vec::new()),
        };
        for template in templates {
            handle.upsert_template(template);
        }
        handle
    }

    /// Snapshot of the template list, in configuration order.
    pub fn templates(&self) -> Vec<Arc<Template>> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn template(&self, name: &str) -> Option<Arc<Template>> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Replace the template with the same name in place, or append it.
    /// Returns the previous version, if any.
    pub fn upsert_template(&self, template: Template) -> Option<Arc<Template>> {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let template = Arc::new(template);
        match templates.iter_mut().find(|t| t.name == template.name) {
            Some(slot) => Some(std::mem::replace(slot, template)),
            None => {
                templates.push(template);
                None
            }
        }
    }

    pub fn remove_template(&self, name: &str) -> Option<Arc<Template>> {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let idx = templates.iter().position(|t| t.name == name)?;
        Some(templates.remove(idx))
    }

    /// First template (in order) matching the label expression.
    pub fn template_for_label(&self, label: Option<&str>) -> Option<Arc<Template>> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.matches_label(label))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudfleet_common::TemplateConfig;
    use cloudfleet_providers::mock::{MockProvider, MockProviderFactory};

    fn template(name: &str, image: &str, labels: &str) -> Template {
        Template::from_config(&TemplateConfig {
            name: name.to_string(),
            image_id: image.to_string(),
            instance_type: "small".to_string(),
            labels: labels.to_string(),
            mode: cloudfleet_common::template::TemplateMode::Exclusive,
            ..Default::default()
        })
        .unwrap()
    }

    fn handle(templates: Vec<Template>) -> CloudHandle {
        let factory = Arc::new(MockProviderFactory::new(MockProvider::new()));
        CloudHandle::new(
            "east",
            Cap::Unbounded,
            CloudPolicy::default(),
            KeyPairConfig::default(),
            Arc::new(CloudGateway::new("east", factory)),
            templates,
        )
    }

    #[test]
    fn upsert_preserves_position() {
        let cloud = handle(vec![
            template("a", "img-1", "linux"),
            template("b", "img-1", "linux"),
            template("c", "img-1", "linux"),
        ]);
        let previous = cloud.upsert_template(template("b", "img-2", "linux"));
        assert_eq!(previous.unwrap().image_id, "img-1");

        let names: Vec<String> = cloud.templates().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(cloud.template("b").unwrap().image_id, "img-2");

        assert!(cloud.upsert_template(template("d", "img-1", "linux")).is_none());
        assert_eq!(cloud.templates().last().unwrap().name, "d");
    }

    #[test]
    fn label_lookup_uses_order() {
        let cloud = handle(vec![
            template("small", "img", "linux"),
            template("gpu", "img", "linux gpu"),
        ]);
        assert_eq!(cloud.template_for_label(Some("gpu")).unwrap().name, "gpu");
        assert_eq!(cloud.template_for_label(Some("linux")).unwrap().name, "small");
        assert!(cloud.template_for_label(None).is_none());
        assert!(cloud.remove_template("small").is_some());
        assert_eq!(cloud.template_for_label(Some("linux")).unwrap().name, "gpu");
    }
}
