//! Data protection collaborators consumed by rebuild-instance.
//!
//! Backups and restores are executed by a separate controller. The ops engine
//! only reads Backup/ActionSet objects and creates Restore objects, then
//! watches their phase.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "dataprotection.smoketurner.com",
    version = "v1alpha1",
    kind = "Backup",
    plural = "backups",
    namespaced,
    status = "BackupStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    pub backup_policy_name: String,
    pub backup_method: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum BackupPhase {
    #[default]
    New,
    Running,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum BackupType {
    #[default]
    Full,
    Incremental,
    Differential,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default)]
    pub phase: BackupPhase,

    #[serde(default)]
    pub backup_type: BackupType,

    /// Method the backup was taken with, copied from the policy at run time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_method: Option<BackupMethod>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMethod {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_set_name: Option<String>,
}

/// Backup and restore recipes of one backup method
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "dataprotection.smoketurner.com",
    version = "v1alpha1",
    kind = "ActionSet",
    plural = "actionsets"
)]
#[serde(rename_all = "camelCase")]
pub struct ActionSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreActionSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreActionSpec {
    /// Job that writes data into fresh volumes before the workload starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_data: Option<crate::crd::ActionSpec>,

    /// Actions executed against the running instance once it is ready
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_ready: Vec<crate::crd::ActionSpec>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "dataprotection.smoketurner.com",
    version = "v1alpha1",
    kind = "Restore",
    plural = "restores",
    namespaced,
    status = "RestoreStatus",
    printcolumn = r#"{"name":"Backup", "type":"string", "jsonPath":".spec.backup.name"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    pub backup: BackupRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_data_config: Option<PrepareDataConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_config: Option<ReadyConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrepareDataConfig {
    /// Claims the restore job writes into; created by the restore controller
    pub volume_claims: Vec<RestoreVolumeClaim>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreVolumeClaim {
    pub name: String,
    pub storage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub annotations: std::collections::BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadyConfig {
    /// Label selector matching the single pod post-ready actions run against
    pub pod_selector: std::collections::BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum RestorePhase {
    #[default]
    Running,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    #[serde(default)]
    pub phase: RestorePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Restore {
    pub fn phase(&self) -> Option<RestorePhase> {
        self.status.as_ref().map(|s| s.phase)
    }
}
