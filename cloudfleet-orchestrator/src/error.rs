use cloudfleet_common::TemplateError;
use cloudfleet_providers::ProviderError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FleetError {
    #[error("cloud `{cloud}`: no usable key pair ({reason})")]
    NoKeyPair { cloud: String, reason: String },

    #[error("malformed template: {0}")]
    MalformedTemplate(#[from] TemplateError),

    #[error("cloud `{cloud}`: malformed configuration ({reason})")]
    MalformedCloud { cloud: String, reason: String },

    #[error("cloud `{cloud}`, template `{template}`: provider rejected launch ({reason})")]
    ProviderRejected {
        cloud: String,
        template: String,
        reason: String,
    },

    #[error("cloud `{cloud}`: {source}")]
    Provider {
        cloud: String,
        #[source]
        source: ProviderError,
    },

    #[error("unknown cloud `{0}`")]
    UnknownCloud(String),

    #[error("cloud `{cloud}`: unknown template `{template}`")]
    UnknownTemplate { cloud: String, template: String },

    #[error("unknown worker `{0}`")]
    UnknownWorker(String),
}

impl FleetError {
    pub fn provider(cloud: &str, source: ProviderError) -> Self {
        FleetError::Provider {
            cloud: cloud.to_string(),
            source,
        }
    }

    /// Configuration-class failures: surfaced immediately, never retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            FleetError::NoKeyPair { .. }
            | FleetError::MalformedTemplate(_)
            | FleetError::MalformedCloud { .. }
            | FleetError::ProviderRejected { .. } => true,
            FleetError::Provider { source, .. } => source.is_fatal(),
            FleetError::UnknownCloud(_)
            | FleetError::UnknownTemplate { .. }
            | FleetError::UnknownWorker(_) => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FleetError::NoKeyPair { .. } => "no-keypair",
            FleetError::MalformedTemplate(_) => "malformed-template",
            FleetError::MalformedCloud { .. } => "malformed-cloud",
            FleetError::ProviderRejected { .. } => "provider-rejected",
            FleetError::Provider { .. } => "provider-error",
            FleetError::UnknownCloud(_) => "unknown-cloud",
            FleetError::UnknownTemplate { .. } => "unknown-template",
            FleetError::UnknownWorker(_) => "unknown-worker",
        }
    }
}
