use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CommandType {
    #[serde(rename = "CMD:PROVISION")]
    Provision,
    #[serde(rename = "CMD:TERMINATE")]
    Terminate,
    #[serde(rename = "CMD:RECONCILE")]
    Reconcile,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Provision => "CMD:PROVISION",
            CommandType::Terminate => "CMD:TERMINATE",
            CommandType::Reconcile => "CMD:RECONCILE",
        }
    }
}

/// Administrative command accepted by the engine.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum FleetCommand {
    #[serde(rename = "CMD:PROVISION")]
    Provision {
        cloud: String,
        template: String,
        #[serde(default = "default_count")]
        count: u32,
        /// Skip reattachment and always launch new capacity.
        #[serde(default)]
        force_new: bool,
    },
    #[serde(rename = "CMD:TERMINATE")]
    Terminate { worker: String },
    /// Runs the orphan sweep for every cloud, or only `cloud` when given.
    #[serde(rename = "CMD:RECONCILE")]
    Reconcile {
        #[serde(default)]
        cloud: Option<String>,
    },
}

fn default_count() -> u32 {
    1
}

impl FleetCommand {
    pub fn command_type(&self) -> CommandType {
        match self {
            FleetCommand::Provision { .. } => CommandType::Provision,
            FleetCommand::Terminate { .. } => CommandType::Terminate,
            FleetCommand::Reconcile { .. } => CommandType::Reconcile,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommandEnvelope {
    pub correlation_id: Uuid,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub command: FleetCommand,
}

impl CommandEnvelope {
    pub fn new(command: FleetCommand, received_at: DateTime<Utc>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            received_at,
            command,
        }
    }
}
