//! OpsRequest CRD: a user-submitted day-2 operation against a Cluster.
//!
//! Each request names a target cluster and an operation type, and carries one
//! payload list per type. The status records the lifecycle phase, the
//! `completed/expected` progress string, a per-component progress ledger and
//! the pre-operation snapshot used for rollback.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{ClusterService, ServicePort, ServiceType};

/// OpsRequest is the Schema for day-2 operations on a Cluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "ops.smoketurner.com",
    version = "v1alpha1",
    kind = "OpsRequest",
    plural = "opsrequests",
    shortname = "ops",
    namespaced,
    status = "OpsRequestStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Progress", "type":"string", "jsonPath":".status.progress"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestSpec {
    /// Name of the target Cluster in the same namespace
    pub cluster_name: String,

    /// Operation type
    #[serde(rename = "type")]
    pub type_: OpsType,

    /// Skip the cluster phase wait and bypass the admission queue
    #[serde(default)]
    pub force: bool,

    /// Request cancellation of a running operation (only honoured by cancellable types)
    #[serde(default)]
    pub cancel: bool,

    /// Seconds a Pending request waits for the cluster to reach an allowed phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_condition_deadline_seconds: Option<i32>,

    /// Seconds a Running request may take before it is failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,

    /// Seconds after success before the request is deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_succeed: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub horizontal_scaling: Vec<HorizontalScaling>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restart: Vec<ComponentOps>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_expansion: Vec<VolumeExpansion>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub switchover: Vec<Switchover>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rebuild_from: Vec<RebuildInstance>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reconfigures: Vec<Reconfigure>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomOps>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose: Vec<Expose>,
}

/// Operation types accepted by the API.
///
/// Not every type has a registered handler; unregistered types are failed
/// with an `OpsTypeNotSupported` condition.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum OpsType {
    HorizontalScaling,
    VerticalScaling,
    VolumeExpansion,
    Restart,
    Switchover,
    RebuildInstance,
    Reconfiguring,
    Upgrade,
    Expose,
    Custom,
}

impl std::fmt::Display for OpsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpsType::HorizontalScaling => "HorizontalScaling",
            OpsType::VerticalScaling => "VerticalScaling",
            OpsType::VolumeExpansion => "VolumeExpansion",
            OpsType::Restart => "Restart",
            OpsType::Switchover => "Switchover",
            OpsType::RebuildInstance => "RebuildInstance",
            OpsType::Reconfiguring => "Reconfiguring",
            OpsType::Upgrade => "Upgrade",
            OpsType::Expose => "Expose",
            OpsType::Custom => "Custom",
        };
        write!(f, "{}", s)
    }
}

/// Anything that targets a single component (or sharding group) by name
pub trait ComponentOpsTarget {
    fn component_name(&self) -> &str;
}

/// Horizontal scaling of one component
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScaling {
    pub component_name: String,

    /// Absolute replica count; takes precedence over scaleOut/scaleIn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Number of replicas to add
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_out: Option<i32>,

    /// Number of replicas to remove
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_in: Option<i32>,

    /// Specific online instances to take offline as part of the scale in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub online_instances_to_offline: Vec<String>,
}

/// A payload that only names a component
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentOps {
    pub component_name: String,
}

/// Volume expansion of one component
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeExpansion {
    pub component_name: String,
    pub volume_claim_templates: Vec<OpsVolumeClaimTemplate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsVolumeClaimTemplate {
    /// Volume claim template name in the component spec
    pub name: String,
    /// Requested storage size (e.g., "20Gi")
    pub storage: String,
}

/// Switchover of one component to a candidate instance
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Switchover {
    pub component_name: String,
    /// Candidate pod name; "*" lets the component pick any healthy candidate
    pub instance_name: String,
}

/// Rebuild of one or more instances of a component
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RebuildInstance {
    pub component_name: String,
    pub instances: Vec<Instance>,

    /// Rebuild the instance in place, keeping its name and volumes' identity
    #[serde(default)]
    pub in_place: bool,

    /// Backup used to seed the new volumes; peer data is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
}

/// Reconfiguration of one component
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reconfigure {
    pub component_name: String,

    /// Configuration file key inside the component ConfigMap (defaults to the component's file)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<String>,

    pub parameters: Vec<ParameterPair>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterPair {
    pub key: String,
    /// New value; `None` removes the parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Add or remove extra services of one component
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Expose {
    pub component_name: String,
    pub switch: ExposeSwitch,
    pub services: Vec<OpsService>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ExposeSwitch {
    #[default]
    Enable,
    Disable,
}

/// A service to expose; ports default to the component's declared services
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsService {
    pub name: String,
    #[serde(default)]
    pub service_type: ServiceType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_selector: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_selector: BTreeMap<String, String>,
}

/// User-defined operation driven by an OpsDefinition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomOps {
    pub ops_definition_name: String,
    pub components: Vec<CustomOpsComponent>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomOpsComponent {
    pub component_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<CustomParameter>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ParameterSource>,
}

/// Reference to a ConfigMap or Secret key holding a parameter value
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeyRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyRef {
    pub name: String,
    pub key: String,
}

macro_rules! component_target {
    ($($t:ty),+) => {
        $(impl ComponentOpsTarget for $t {
            fn component_name(&self) -> &str {
                &self.component_name
            }
        })+
    };
}

component_target!(
    HorizontalScaling,
    ComponentOps,
    VolumeExpansion,
    Switchover,
    RebuildInstance,
    Reconfigure,
    CustomOpsComponent,
    Expose
);

/// OpsRequest lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum OpsPhase {
    /// Waiting for validation, the cluster phase or the admission queue
    #[default]
    Pending,
    /// Admitted; the one-shot mutation has not been applied yet
    Creating,
    /// Mutation applied; waiting for the cluster to converge
    Running,
    Succeed,
    Failed,
    Cancelled,
}

impl OpsPhase {
    /// Terminal phases never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, OpsPhase::Succeed | OpsPhase::Failed | OpsPhase::Cancelled)
    }
}

impl std::fmt::Display for OpsPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpsPhase::Pending => write!(f, "Pending"),
            OpsPhase::Creating => write!(f, "Creating"),
            OpsPhase::Running => write!(f, "Running"),
            OpsPhase::Succeed => write!(f, "Succeed"),
            OpsPhase::Failed => write!(f, "Failed"),
            OpsPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Status of the OpsRequest
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestStatus {
    #[serde(default)]
    pub phase: OpsPhase,

    /// "completed/expected"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,

    /// Cluster generation observed right after the mutation was applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_generation: Option<i64>,

    /// RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    /// RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<String>,

    /// RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, OpsRequestComponentStatus>,

    #[serde(default)]
    pub last_configuration: LastConfiguration,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Per-component view of a running operation
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestComponentStatus {
    /// Last observed component phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<crate::crd::ComponentPhase>,

    /// When the component was first seen Failed/Abnormal (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_time: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress_details: Vec<ProgressStatusDetail>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_check: Option<PreCheckResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Workflow step per rebuilt instance
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instance_steps: BTreeMap<String, RebuildStep>,

    /// Set by reconfigure when the change needs a rolling restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_required: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreCheckResult {
    pub pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Progress of one sub-resource touched by an operation
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStatusDetail {
    /// Shard or instance group the object belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Stable "Kind/Name" key
    pub object_key: String,

    /// Custom ops action that owns this detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,

    #[serde(default)]
    pub status: ProgressStatus,

    #[serde(default)]
    pub message: String,

    /// RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    /// RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ProgressStatus {
    #[default]
    Pending,
    Processing,
    Succeed,
    Failed,
}

impl ProgressStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, ProgressStatus::Succeed | ProgressStatus::Failed)
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressStatus::Pending => write!(f, "Pending"),
            ProgressStatus::Processing => write!(f, "Processing"),
            ProgressStatus::Succeed => write!(f, "Succeed"),
            ProgressStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Persisted workflow step of one instance being rebuilt.
///
/// The step only moves forward; `Failed` and `Succeed` are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum RebuildStep {
    #[default]
    Pending,
    /// Temp pod/PVCs or Restore CR created, waiting for the data to land
    ProvisioningVolumes,
    /// Rebinding restored PVs to the source claims, then deleting the instance
    RebindingVolumes,
    /// Instance deleted, waiting for it to come back available
    WaitingInstanceReady,
    /// Running the post-ready restore stage
    PostReady,
    Succeed,
    Failed,
}

/// Snapshot of component state taken once at admission
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastConfiguration {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, LastComponentConfiguration>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastComponentConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline_instances: Vec<String>,

    /// Volume claim template name -> storage size
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volume_claim_templates: BTreeMap<String, String>,

    /// Pod names that existed before the operation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_names: Vec<String>,

    /// Cluster services selecting the component before the operation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ClusterService>,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Annotation keys owned by the ops engine
pub mod annotations {
    /// JSON queue of in-flight operations, stored on the Cluster
    pub const OPS_QUEUE: &str = "ops.smoketurner.com/ops-queue";
    /// Bumped on a request to force a reconcile (e.g., after queue promotion)
    pub const RECONCILE: &str = "ops.smoketurner.com/reconcile";
    /// When the request left the waiting part of the queue (RFC3339)
    pub const QUEUE_END_TIME: &str = "ops.smoketurner.com/queue-end-time";
    /// Marks PVs/PVCs produced by a rebuild, value is the request name
    pub const REBUILD_FROM: &str = "ops.smoketurner.com/rebuild-from";
    /// Skip the role label check when deciding instance availability
    pub const IGNORE_ROLE_CHECK: &str = "ops.smoketurner.com/ignore-role-check";
    /// Name of the request that last patched a configuration ConfigMap
    pub const LAST_APPLIED_OPS: &str = "ops.smoketurner.com/last-applied-ops";
    /// Whether the last configuration change needs a restart
    pub const RESTART_REQUIRED: &str = "ops.smoketurner.com/restart-required";
}

/// Label keys used to correlate child objects with requests
pub mod labels {
    pub const OPS_NAME: &str = "ops.smoketurner.com/ops-name";
    pub const OPS_NAMESPACE: &str = "ops.smoketurner.com/ops-namespace";
    pub const OPS_TYPE: &str = "ops.smoketurner.com/ops-type";
    pub const ACTION_NAME: &str = "ops.smoketurner.com/action-name";
    /// Set on a retained PV, value is the temp PVC the data was restored into
    pub const REBUILD_TMP_PVC: &str = "ops.smoketurner.com/rebuild-tmp-pvc";
}

impl OpsRequest {
    /// Current phase, defaulting to Pending when no status exists yet
    pub fn phase(&self) -> OpsPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Names of every component targeted by this request's payload
    pub fn component_names(&self) -> Vec<String> {
        fn names<T: ComponentOpsTarget>(items: &[T]) -> Vec<String> {
            items.iter().map(|i| i.component_name().to_string()).collect()
        }
        let spec = &self.spec;
        match spec.type_ {
            OpsType::HorizontalScaling => names(&spec.horizontal_scaling),
            OpsType::Restart => names(&spec.restart),
            OpsType::VolumeExpansion => names(&spec.volume_expansion),
            OpsType::Switchover => names(&spec.switchover),
            OpsType::RebuildInstance => names(&spec.rebuild_from),
            OpsType::Reconfiguring => names(&spec.reconfigures),
            OpsType::Expose => names(&spec.expose),
            OpsType::Custom => spec
                .custom
                .as_ref()
                .map(|c| names(&c.components))
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Start timestamp parsed from status
    pub fn start_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.start_timestamp.as_deref())
            .and_then(crate::crd::parse_time)
    }
}
