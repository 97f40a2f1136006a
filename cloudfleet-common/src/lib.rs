use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod bus;
pub mod labels;
pub mod tags;
pub mod template;
pub mod worker;

pub use template::{Cap, SpotConfig, Template, TemplateConfig, TemplateError, UserTag};
pub use worker::{ExecutorState, RemoteSnapshot, Worker, WorkerLaunch};

/// Tags carried by a remote instance (key -> value).
pub type TagSet = BTreeMap<String, String>;

// --- Enums ---

/// Lifecycle state reported by the cloud for an instance.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    #[serde(rename = "shutting-down")]
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "shutting-down" | "shutting_down" => Some(InstanceState::ShuttingDown),
            "terminated" => Some(InstanceState::Terminated),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            _ => None,
        }
    }

    /// States counted against capacity caps.
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Pending | InstanceState::Running)
    }

    /// Fully stopped; only this state accepts a start call.
    pub fn is_stopped(&self) -> bool {
        matches!(self, InstanceState::Stopped)
    }

    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self, InstanceState::Stopping | InstanceState::Stopped)
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing mode a worker was launched with.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    OnDemand,
    Spot,
}

impl LaunchMode {
    /// Value written to the launch-mode tag.
    pub fn tag_value(&self) -> &'static str {
        match self {
            LaunchMode::OnDemand => "demand",
            LaunchMode::Spot => "spot",
        }
    }

    pub fn from_tag_value(raw: &str) -> Option<Self> {
        match raw {
            "demand" => Some(LaunchMode::OnDemand),
            "spot" => Some(LaunchMode::Spot),
            _ => None,
        }
    }
}

// --- Addressing ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct HostAddresses {
    pub public_dns: Option<String>,
    pub public_ip: Option<String>,
    pub private_dns: Option<String>,
    pub private_ip: Option<String>,
}

/// Which address the scheduler should use to reach a worker.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStrategy {
    PublicDns,
    PublicIp,
    PrivateDns,
    #[default]
    PrivateIp,
}

impl ConnectionStrategy {
    /// Map the legacy pair of booleans onto a strategy.
    ///
    /// A subnet without public addressing always uses the private IP.
    pub fn backwards_compatible(
        use_private_dns_name: bool,
        connect_using_public_ip: bool,
        associate_public_ip: bool,
    ) -> Self {
        if use_private_dns_name {
            ConnectionStrategy::PrivateDns
        } else if connect_using_public_ip || associate_public_ip {
            ConnectionStrategy::PublicIp
        } else {
            ConnectionStrategy::PrivateIp
        }
    }

    /// Pick the host to connect to, falling back from DNS names to IPs.
    pub fn resolve(&self, addresses: &HostAddresses) -> Option<String> {
        fn non_blank(v: &Option<String>) -> Option<String> {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        }

        match self {
            ConnectionStrategy::PublicDns => {
                non_blank(&addresses.public_dns).or_else(|| non_blank(&addresses.public_ip))
            }
            ConnectionStrategy::PublicIp => non_blank(&addresses.public_ip),
            ConnectionStrategy::PrivateDns => {
                non_blank(&addresses.private_dns).or_else(|| non_blank(&addresses.private_ip))
            }
            ConnectionStrategy::PrivateIp => non_blank(&addresses.private_ip),
        }
    }
}
