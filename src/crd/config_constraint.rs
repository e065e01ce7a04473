//! ConfigConstraint CRD: classifies the parameters of a configuration file.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "apps.smoketurner.com",
    version = "v1alpha1",
    kind = "ConfigConstraint",
    plural = "configconstraints"
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigConstraintSpec {
    #[serde(default)]
    pub file_format: FileFormat,

    /// Parameters that only take effect after a restart
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_parameters: Vec<String>,

    /// Parameters that can be reloaded online
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dynamic_parameters: Vec<String>,

    /// Parameters that may never be changed by a reconfigure
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub immutable_parameters: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum FileFormat {
    #[default]
    Ini,
    Properties,
}
