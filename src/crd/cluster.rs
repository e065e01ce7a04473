//! Cluster CRD: the managed aggregate of stateful components.
//!
//! The Cluster is owned by a separate cluster controller. The ops engine
//! only mutates the component specs named by an admitted request, patches
//! the status phase to the request's target phase, and keeps its admission
//! queue in an annotation.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "apps.smoketurner.com",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub component_specs: Vec<ClusterComponentSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shardings: Vec<ShardingSpec>,

    /// Extra services on top of each component's default service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ClusterService>,
}

/// Desired state of one component
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentSpec {
    pub name: String,

    /// Component definition this component was rendered from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_def: Option<String>,

    /// Main container image of the component's pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Instances kept offline; their ordinals are skipped when naming pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline_instances: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,

    #[serde(default)]
    pub min_ready_seconds: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<ReplicaRole>,

    /// Action run to move the writable role to a candidate instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switchover: Option<ActionSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ComponentConfigSpec>,

    /// Bumping this value rolls every pod of the component (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarted_at: Option<String>,

    /// Services declared by the component definition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ComponentService>,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    pub name: String,
    /// Requested storage size (e.g., "10Gi")
    pub storage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Role a replica may hold, published as a pod label
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRole {
    pub name: String,
    #[serde(default)]
    pub serviceable: bool,
    #[serde(default)]
    pub writable: bool,
}

/// Container action executed as a Job
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub image: String,
    pub command: Vec<String>,
}

/// Where a component's configuration lives
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfigSpec {
    pub config_map_name: String,
    pub constraint_name: String,
    pub file_name: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// TCP when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,
}

impl ServicePort {
    /// `protocol-port`, e.g. `TCP-5432`
    pub fn key(&self) -> String {
        format!("{}-{}", self.protocol.as_deref().unwrap_or("TCP"), self.port)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentService {
    pub name: String,
    #[serde(default)]
    pub service_type: ServiceType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
}

/// A cluster-level service rendered by the cluster controller
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterService {
    pub name: String,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub service_type: ServiceType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
    /// Only pods holding this role are selected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_selector: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_selector: BTreeMap<String, String>,
    /// Component or sharding group the service selects
    #[serde(default)]
    pub component_selector: String,
}

/// A component template replicated into `shards` component instances
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardingSpec {
    pub name: String,
    pub shards: i32,
    pub template: ClusterComponentSpec,
}

/// Cluster lifecycle phase, as reported by the cluster controller
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    #[default]
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Deleting,
    Failed,
    Abnormal,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Creating => write!(f, "Creating"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Updating => write!(f, "Updating"),
            ClusterPhase::Stopping => write!(f, "Stopping"),
            ClusterPhase::Stopped => write!(f, "Stopped"),
            ClusterPhase::Deleting => write!(f, "Deleting"),
            ClusterPhase::Failed => write!(f, "Failed"),
            ClusterPhase::Abnormal => write!(f, "Abnormal"),
        }
    }
}

/// Component lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ComponentPhase {
    #[default]
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Deleting,
    Failed,
    Abnormal,
}

impl ComponentPhase {
    pub fn is_failed_or_abnormal(&self) -> bool {
        matches!(self, ComponentPhase::Failed | ComponentPhase::Abnormal)
    }
}

impl std::fmt::Display for ComponentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentPhase::Creating => write!(f, "Creating"),
            ComponentPhase::Running => write!(f, "Running"),
            ComponentPhase::Updating => write!(f, "Updating"),
            ComponentPhase::Stopping => write!(f, "Stopping"),
            ComponentPhase::Stopped => write!(f, "Stopped"),
            ComponentPhase::Deleting => write!(f, "Deleting"),
            ComponentPhase::Failed => write!(f, "Failed"),
            ComponentPhase::Abnormal => write!(f, "Abnormal"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Observed components, including the discovered members of sharding groups
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default)]
    pub phase: ComponentPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Set on components generated from a sharding template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding_name: Option<String>,

    /// Failure messages keyed by pod name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_messages: BTreeMap<String, String>,
}

/// Label keys stamped on workload objects by the cluster controller
pub mod labels {
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const COMPONENT_NAME: &str = "apps.smoketurner.com/component-name";
    pub const SHARDING_NAME: &str = "apps.smoketurner.com/sharding-name";
    pub const ROLE: &str = "apps.smoketurner.com/role";
    pub const VOLUME_CLAIM_TEMPLATE: &str = "apps.smoketurner.com/vct-name";
}

impl Cluster {
    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Spec of a plain component, or the template of a sharding group
    pub fn component_spec(&self, name: &str) -> Option<&ClusterComponentSpec> {
        self.spec
            .component_specs
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.sharding(name).map(|s| &s.template))
    }

    pub fn component_spec_mut(&mut self, name: &str) -> Option<&mut ClusterComponentSpec> {
        if let Some(idx) = self.spec.component_specs.iter().position(|c| c.name == name) {
            return self.spec.component_specs.get_mut(idx);
        }
        self.spec
            .shardings
            .iter_mut()
            .find(|s| s.name == name)
            .map(|s| &mut s.template)
    }

    pub fn sharding(&self, name: &str) -> Option<&ShardingSpec> {
        self.spec.shardings.iter().find(|s| s.name == name)
    }

    /// Names of the shard components currently reported for a sharding group
    pub fn shard_components(&self, sharding_name: &str) -> Vec<String> {
        self.status
            .as_ref()
            .map(|s| {
                s.components
                    .iter()
                    .filter(|(_, c)| c.sharding_name.as_deref() == Some(sharding_name))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn component_status(&self, name: &str) -> Option<&ComponentStatus> {
        self.status.as_ref().and_then(|s| s.components.get(name))
    }

    /// True once the cluster controller has observed the given generation
    pub fn observed(&self, generation: Option<i64>) -> bool {
        let observed = self.status.as_ref().and_then(|s| s.observed_generation);
        match (observed, generation) {
            (Some(o), Some(g)) => o >= g,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }
}
