pub mod aggregator;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod progress;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod state_machine;
pub mod status;
pub mod validation;
pub mod workflow;

pub use config::OperatorConfig;
pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use registry::{OpsBehaviour, OpsKind, OpsRegistry};
pub use status::{ConditionBuilder, OpsStatusManager};
