use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::{labels, tags, ConnectionStrategy, LaunchMode};

pub const DEFAULT_NUM_EXECUTORS: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template `{template}`: {field} is required")]
    MissingField {
        template: String,
        field: &'static str,
    },
    #[error("template `{template}`: invalid {field} `{value}`")]
    InvalidValue {
        template: String,
        field: &'static str,
        value: String,
    },
    #[error("template `{template}`: tag key `{key}` is reserved for fleet classification")]
    ReservedTag { template: String, key: String },
    #[error("template `{template}`: tag key `{key}` is declared twice")]
    DuplicateTag { template: String, key: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid instance cap `{0}` (expected blank or a non-negative integer)")]
pub struct InvalidCap(pub String);

/// Instance cap. Blank configuration means unbounded, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cap {
    #[default]
    Unbounded,
    Limited(u32),
}

impl Cap {
    pub fn parse(raw: Option<&str>) -> Result<Self, InvalidCap> {
        let trimmed = raw.map(str::trim).unwrap_or("");
        if trimmed.is_empty() {
            return Ok(Cap::Unbounded);
        }
        trimmed
            .parse::<u32>()
            .map(Cap::Limited)
            .map_err(|_| InvalidCap(trimmed.to_string()))
    }

    /// True if `n` more units fit on top of `current`.
    pub fn allows(&self, current: u32, n: u32) -> bool {
        match self {
            Cap::Unbounded => true,
            Cap::Limited(max) => u64::from(current) + u64::from(n) <= u64::from(*max),
        }
    }

    /// Units still available; `None` when unbounded.
    pub fn headroom(&self, current: u32) -> Option<u32> {
        match self {
            Cap::Unbounded => None,
            Cap::Limited(max) => Some(max.saturating_sub(current)),
        }
    }
}

impl std::fmt::Display for Cap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cap::Unbounded => f.write_str("unbounded"),
            Cap::Limited(max) => write!(f, "{}", max),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserTag {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpotConfig {
    /// Maximum hourly price, as a decimal string (e.g. "0.045").
    pub max_bid_price: String,
    #[serde(default)]
    pub fallback_to_on_demand: bool,
}

/// How a template answers unlabeled demand.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateMode {
    /// Matches unlabeled demand as well as matching label expressions.
    #[default]
    Normal,
    /// Only matches demand whose label expression matches.
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub zone: Option<String>,
    pub subnet_id: Option<String>,
}

/// Raw template definition as produced by the configuration layer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TemplateConfig {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub zone: Option<String>,
    /// Space or comma separated subnet pool.
    pub subnet_ids: String,
    /// Comma separated names (or ids) of security groups.
    pub security_groups: String,
    pub associate_public_ip: bool,
    pub iam_instance_profile: Option<String>,
    pub user_data: Option<String>,
    pub tags: Vec<UserTag>,
    pub spot: Option<SpotConfig>,
    pub instance_cap: Option<String>,
    pub min_instances: u32,
    pub idle_termination_minutes: Option<String>,
    pub max_total_uses: Option<i32>,
    pub stop_on_terminate: bool,
    pub labels: String,
    pub mode: TemplateMode,
    pub num_executors: Option<u32>,
    pub connection_strategy: Option<ConnectionStrategy>,
    pub use_private_dns_name: bool,
    pub connect_using_public_ip: bool,
    pub launch_timeout_secs: Option<u64>,
}

/// Immutable blueprint for a class of worker.
///
/// Shared as `Arc<Template>`; an update builds a new value and replaces the
/// old one by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub zone: Option<String>,
    pub subnet_ids: Vec<String>,
    pub security_groups: Vec<String>,
    pub associate_public_ip: bool,
    pub iam_instance_profile: Option<String>,
    pub user_data: Option<String>,
    pub tags: Vec<UserTag>,
    pub spot: Option<SpotConfig>,
    pub instance_cap: Cap,
    pub min_instances: u32,
    /// 0 never retires; positive is a plain idle timeout; negative `-N`
    /// retires at the last N minutes of the billing hour.
    pub idle_termination_minutes: i64,
    /// `<= -1` disables the usage budget.
    pub max_total_uses: i32,
    pub stop_on_terminate: bool,
    pub labels: Vec<String>,
    pub mode: TemplateMode,
    pub num_executors: u32,
    pub connection_strategy: ConnectionStrategy,
    pub launch_timeout: Option<Duration>,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_blank(raw: &Option<String>) -> Option<String> {
    raw.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Template {
    pub fn from_config(cfg: &TemplateConfig) -> Result<Self, TemplateError> {
        let name = cfg.name.trim().to_string();
        let missing = |field: &'static str| TemplateError::MissingField {
            template: name.clone(),
            field,
        };
        let invalid = |field: &'static str, value: &str| TemplateError::InvalidValue {
            template: name.clone(),
            field,
            value: value.to_string(),
        };

        if name.is_empty() {
            return Err(missing("name"));
        }
        if cfg.image_id.trim().is_empty() {
            return Err(missing("image_id"));
        }
        if cfg.instance_type.trim().is_empty() {
            return Err(missing("instance_type"));
        }

        let instance_cap = Cap::parse(cfg.instance_cap.as_deref())
            .map_err(|e| invalid("instance_cap", &e.0))?;

        let idle_termination_minutes = match non_blank(&cfg.idle_termination_minutes) {
            None => 0,
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| invalid("idle_termination_minutes", &raw))?,
        };

        let mut seen: Vec<&str> = Vec::new();
        for tag in &cfg.tags {
            let key = tag.name.trim();
            if key.is_empty() {
                return Err(invalid("tag name", &tag.name));
            }
            if tags::is_reserved_key(key) {
                return Err(TemplateError::ReservedTag {
                    template: name.clone(),
                    key: key.to_string(),
                });
            }
            if seen.contains(&key) {
                return Err(TemplateError::DuplicateTag {
                    template: name.clone(),
                    key: key.to_string(),
                });
            }
            seen.push(key);
        }

        if let Some(spot) = &cfg.spot {
            let bid = spot.max_bid_price.trim();
            match bid.parse::<f64>() {
                Ok(v) if v > 0.0 && v.is_finite() => {}
                _ => return Err(invalid("spot max_bid_price", bid)),
            }
        }

        let num_executors = cfg.num_executors.unwrap_or(DEFAULT_NUM_EXECUTORS);
        if num_executors == 0 {
            return Err(invalid("num_executors", "0"));
        }

        let connection_strategy = cfg.connection_strategy.unwrap_or_else(|| {
            ConnectionStrategy::backwards_compatible(
                cfg.use_private_dns_name,
                cfg.connect_using_public_ip,
                cfg.associate_public_ip,
            )
        });

        Ok(Template {
            name: name.clone(),
            image_id: cfg.image_id.trim().to_string(),
            instance_type: cfg.instance_type.trim().to_string(),
            zone: non_blank(&cfg.zone),
            subnet_ids: split_list(&cfg.subnet_ids),
            security_groups: split_list(&cfg.security_groups),
            associate_public_ip: cfg.associate_public_ip,
            iam_instance_profile: non_blank(&cfg.iam_instance_profile),
            user_data: cfg.user_data.clone(),
            tags: cfg
                .tags
                .iter()
                .map(|t| UserTag {
                    name: t.name.trim().to_string(),
                    value: t.value.clone(),
                })
                .collect(),
            spot: cfg.spot.clone().map(|s| SpotConfig {
                max_bid_price: s.max_bid_price.trim().to_string(),
                fallback_to_on_demand: s.fallback_to_on_demand,
            }),
            instance_cap,
            min_instances: cfg.min_instances,
            idle_termination_minutes,
            max_total_uses: cfg.max_total_uses.unwrap_or(-1),
            stop_on_terminate: cfg.stop_on_terminate,
            labels: labels::parse_labels(&cfg.labels),
            mode: cfg.mode,
            num_executors,
            connection_strategy,
            launch_timeout: cfg
                .launch_timeout_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
        })
    }

    pub fn launch_mode(&self) -> LaunchMode {
        if self.spot.is_some() {
            LaunchMode::Spot
        } else {
            LaunchMode::OnDemand
        }
    }

    /// Network placements in rotation order. Always at least one entry.
    pub fn placements(&self) -> Vec<Placement> {
        if self.subnet_ids.is_empty() {
            return vec![Placement {
                zone: self.zone.clone(),
                subnet_id: None,
            }];
        }
        self.subnet_ids
            .iter()
            .map(|subnet| Placement {
                zone: self.zone.clone(),
                subnet_id: Some(subnet.clone()),
            })
            .collect()
    }

    /// `None` is unlabeled demand.
    pub fn matches_label(&self, expression: Option<&str>) -> bool {
        match expression.map(str::trim).filter(|e| !e.is_empty()) {
            None => self.mode == TemplateMode::Normal,
            Some(expr) => labels::expression_matches(expr, &self.labels),
        }
    }

    pub fn user_tag_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|t| (t.name.as_str(), t.value.as_str()))
    }
}
