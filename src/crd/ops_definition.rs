//! OpsDefinition CRD: the recipe behind a Custom OpsRequest.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "ops.smoketurner.com",
    version = "v1alpha1",
    kind = "OpsDefinition",
    plural = "opsdefinitions",
    shortname = "opsdef",
    printcolumn = r#"{"name":"Actions", "type":"integer", "jsonPath":".spec.actions.length"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpsDefinitionSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_conditions: Vec<PreCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_schema: Option<ParametersSchema>,

    /// Component definitions this recipe applies to; empty means any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_definition_names: Vec<String>,

    pub actions: Vec<OpsAction>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreCondition {
    pub rule: Rule,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// `<path> == <literal>` or `<path> != <literal>`
    pub expression: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParametersSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, ParameterProperty>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterProperty {
    #[serde(rename = "type")]
    pub type_: ParameterType,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsAction {
    pub name: String,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    pub image: String,
    pub command: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Fail,
    Ignore,
}
