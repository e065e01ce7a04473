use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::Client;
use kube::runtime::events::{Recorder, Reporter};

use crate::controller::config::OperatorConfig;
use crate::controller::queue::{KubeQueueStore, QueueStore};
use crate::controller::registry::OpsRegistry;
use crate::controller::state_machine::OpsStateMachine;
use crate::health::HealthState;

/// Shared context for the OpsRequest controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Supported operation kinds, built once at startup
    pub registry: Arc<OpsRegistry>,
    pub config: Arc<OperatorConfig>,
    /// Persistence of the per-cluster ops queue
    pub queue_store: Arc<dyn QueueStore>,
    pub state_machine: Arc<OpsStateMachine>,
    pub recorder: Recorder,
    /// Health state for recording metrics
    pub health: Option<Arc<HealthState>>,
    /// Consecutive failed reconciles per request, for backoff
    retries: Arc<Mutex<HashMap<String, u32>>>,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig, health: Option<Arc<HealthState>>) -> Self {
        let reporter = Reporter {
            controller: "ops-operator".to_string(),
            instance: Some(config.pod_name.clone()),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            queue_store: Arc::new(KubeQueueStore::new(client.clone())),
            registry: Arc::new(OpsRegistry::new()),
            state_machine: Arc::new(OpsStateMachine::new()),
            config: Arc::new(config),
            client,
            health,
            retries: Arc::default(),
        }
    }

    /// Bump and return the retry attempt of `key`, starting at 0
    pub fn next_retry(&self, key: &str) -> u32 {
        let Ok(mut retries) = self.retries.lock() else {
            return 0;
        };
        let attempt = retries.entry(key.to_string()).or_insert(0);
        let current = *attempt;
        *attempt = attempt.saturating_add(1);
        current
    }

    pub fn reset_retries(&self, key: &str) {
        if let Ok(mut retries) = self.retries.lock() {
            retries.remove(key);
        }
    }
}
