pub mod capacity;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod logger;
pub mod provider_manager;
pub mod provisioner;
pub mod reconcile_job;
pub mod reconciler;
pub mod registry;
pub mod retag;
pub mod retention;
pub mod retention_job;
pub mod retry;
pub mod routes;
pub mod settings;
pub mod state_machine;
pub mod strategies;
pub mod templates;

pub use engine::EngineContext;
pub use error::FleetError;
