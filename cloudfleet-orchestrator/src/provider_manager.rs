use cloudfleet_providers::ProviderFactory;
use std::env;
use std::sync::Arc;

use crate::error::FleetError;
use crate::settings::{secret_from_env, CloudConfig};

pub const DEFAULT_SECRET_KEY_ENV: &str = "FLEET_SECRET_KEY";
pub const DEFAULT_ACCESS_KEY_ENV: &str = "FLEET_ACCESS_KEY";

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name() -> String {
        env::var("PROVIDER")
            .ok()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "rest".to_string())
    }

    /// Session factory for one configured cloud.
    pub fn factory_for(cloud: &CloudConfig) -> Result<Arc<dyn ProviderFactory>, FleetError> {
        let kind = cloud
            .provider
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(Self::current_provider_name);

        match kind.as_str() {
            #[cfg(feature = "provider-rest")]
            "rest" => Self::rest_factory(cloud),
            #[cfg(feature = "provider-mock")]
            "mock" => {
                use cloudfleet_providers::mock::{MockProvider, MockProviderFactory};
                Ok(Arc::new(MockProviderFactory::new(MockProvider::new())))
            }
            other => Err(FleetError::MalformedCloud {
                cloud: cloud.name.clone(),
                reason: format!("unknown provider `{}`", other),
            }),
        }
    }

    #[cfg(feature = "provider-rest")]
    fn rest_factory(cloud: &CloudConfig) -> Result<Arc<dyn ProviderFactory>, FleetError> {
        use cloudfleet_providers::rest::RestProviderFactory;

        let missing = |what: &str| FleetError::MalformedCloud {
            cloud: cloud.name.clone(),
            reason: format!("{} is required for the rest provider", what),
        };
        let endpoint = non_blank(cloud.endpoint.as_deref()).ok_or_else(|| missing("endpoint"))?;
        let region = non_blank(cloud.region.as_deref()).ok_or_else(|| missing("region"))?;
        let access_key = non_blank(cloud.access_key.as_deref())
            .or_else(|| secret_from_env(DEFAULT_ACCESS_KEY_ENV))
            .ok_or_else(|| missing("access_key"))?;
        let secret_env = cloud
            .secret_key_env
            .as_deref()
            .unwrap_or(DEFAULT_SECRET_KEY_ENV);
        // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
        let secret_key = secret_from_env(secret_env).ok_or_else(|| missing(secret_env))?;

        Ok(Arc::new(RestProviderFactory::new(endpoint, region, access_key, secret_key)))
    }
}

#[cfg(feature = "provider-rest")]
fn non_blank(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}
