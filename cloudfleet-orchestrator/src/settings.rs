use anyhow::Context;
use cloudfleet_common::TemplateConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::time::Duration;

pub const DEFAULT_ENGINE_ID: &str = "cloudfleet";
pub const DEFAULT_ORPHAN_SWEEP_SECS: u64 = 3600;
pub const DEFAULT_ORPHAN_MULTIPLIER: u32 = 3;
pub const DEFAULT_RETENTION_SECS: u64 = 60;
pub const DEFAULT_ADMIN_ADDR: &str = "0.0.0.0:8011";

/// Process-level engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Written into the ownership tag; two engines with different ids never touch each other's instances.
    pub engine_id: String,
    pub orphan_sweep_interval: Duration,
    pub orphan_multiplier: u32,
    pub retention_interval: Duration,
    pub admin_addr: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            engine_id: DEFAULT_ENGINE_ID.to_string(),
            orphan_sweep_interval: Duration::from_secs(DEFAULT_ORPHAN_SWEEP_SECS),
            orphan_multiplier: DEFAULT_ORPHAN_MULTIPLIER,
            retention_interval: Duration::from_secs(DEFAULT_RETENTION_SECS),
            admin_addr: DEFAULT_ADMIN_ADDR.to_string(),
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            engine_id: env_trimmed("FLEET_ENGINE_ID").unwrap_or(defaults.engine_id),
            orphan_sweep_interval: Duration::from_secs(env_parse(
                "FLEET_ORPHAN_SWEEP_SECS",
                DEFAULT_ORPHAN_SWEEP_SECS,
            )?),
            orphan_multiplier: env_parse("FLEET_ORPHAN_MULTIPLIER", DEFAULT_ORPHAN_MULTIPLIER)?
                .max(1),
            retention_interval: Duration::from_secs(env_parse(
                "FLEET_RETENTION_SECS",
                DEFAULT_RETENTION_SECS,
            )?),
            admin_addr: env_trimmed("FLEET_ADMIN_ADDR").unwrap_or(defaults.admin_addr),
        })
    }

    /// Heartbeat age after which an unowned instance is reclaimed.
    pub fn orphan_threshold(&self) -> chrono::Duration {
        let secs = self
            .orphan_sweep_interval
            .as_secs()
            .saturating_mul(u64::from(self.orphan_multiplier));
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }
}

fn env_trimmed(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_trimmed(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}=`{}` is invalid: {}", key, raw, e)),
    }
}

/// Read a secret from the file named by `<KEY>_FILE` (Docker/K8s friendly), falling back to `<KEY>`.
pub fn secret_from_env(key: &str) -> Option<String> {
    env_trimmed(&format!("{}_FILE", key))
        .and_then(|path| fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| env_trimmed(key))
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairConfig {
    pub name: Option<String>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleStopConfig {
    pub max_idle_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub name: String,
    /// Provider kind (`mock`, `rest`); defaults to `PROVIDER`.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    /// Name of the environment variable holding the secret key (`*_FILE` honoured).
    #[serde(default)]
    pub secret_key_env: Option<String>,
    #[serde(default)]
    pub instance_cap: Option<String>,
    #[serde(default)]
    pub key_pair: KeyPairConfig,
    #[serde(default = "yes")]
    pub cleanup_orphans: bool,
    #[serde(default = "yes")]
    pub reuse_orphans: bool,
    #[serde(default)]
    pub no_delay_provisioning: bool,
    #[serde(default)]
    pub start_stop_nodes: bool,
    #[serde(default)]
    pub idle_stop: Option<IdleStopConfig>,
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub engine_id: Option<String>,
    #[serde(default)]
    pub clouds: Vec<CloudConfig>,
}

impl FleetConfig {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("invalid fleet configuration")
    }

    /// Load from `FLEET_CONFIG_FILE`; no file means no clouds.
    pub fn from_env() -> anyhow::Result<Self> {
        let Some(path) = env_trimmed("FLEET_CONFIG_FILE") else {
            tracing::warn!("⚠️ FLEET_CONFIG_FILE not set, starting with no clouds");
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
        Self::from_json(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_threshold_multiplies_interval() {
        let settings = EngineSettings {
            orphan_sweep_interval: Duration::from_secs(600),
            ..Default::default()
        };
        assert_eq!(settings.orphan_threshold(), chrono::Duration::minutes(30));
    }

    #[test]
    fn config_defaults_enable_cleanup_and_reuse() {
        let cfg = FleetConfig::from_json(
            r#"{"clouds":[{"name":"east","templates":[{"name":"builder","image_id":"img","instance_type":"small"}]}]}"#,
        )
        .unwrap();
        let cloud = &cfg.clouds[0];
        assert!(cloud.cleanup_orphans);
        assert!(cloud.reuse_orphans);
        assert!(!cloud.no_delay_provisioning);
        assert_eq!(cloud.templates[0].name, "builder");
        assert!(cloud.instance_cap.is_none());
    }
}
