//! Common utilities for child objects created on behalf of an OpsRequest
//!
//! Every child carries the request's name, namespace and type as labels so a
//! restarted operator re-discovers its work by label selector alone.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::PostParams;
use kube::{Api, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::controller::error::Result;
use crate::crd::{OpsRequest, cluster_labels, labels};

/// API version for the OpsRequest CRD
pub const API_VERSION: &str = "ops.smoketurner.com/v1alpha1";

/// Kind for the OpsRequest CRD
pub const KIND: &str = "OpsRequest";

/// Operator field manager name
pub const FIELD_MANAGER: &str = "ops-operator";

/// Owner reference that garbage-collects a child with its request
pub fn owner_reference(ops: &OpsRequest) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: ops.name_any(),
        uid: ops.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels correlating a child object with its request
pub fn ops_labels(ops: &OpsRequest) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            cluster_labels::MANAGED_BY.to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (labels::OPS_NAME.to_string(), ops.name_any()),
        (
            labels::OPS_NAMESPACE.to_string(),
            ops.namespace().unwrap_or_default(),
        ),
        (labels::OPS_TYPE.to_string(), ops.spec.type_.to_string()),
    ])
}

/// Request labels plus the owning cluster and component
pub fn component_ops_labels(ops: &OpsRequest, component: &str) -> BTreeMap<String, String> {
    let mut l = ops_labels(ops);
    l.extend(component_labels(&ops.spec.cluster_name, component));
    l
}

/// Labels the cluster controller puts on a component's pods and claims
pub fn component_labels(cluster_name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (cluster_labels::INSTANCE.to_string(), cluster_name.to_string()),
        (
            cluster_labels::COMPONENT_NAME.to_string(),
            component.to_string(),
        ),
    ])
}

/// Render labels as a `k=v,k=v` selector
pub fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Selector over the children of one request
pub fn ops_selector(ops: &OpsRequest) -> String {
    selector(&BTreeMap::from([
        (labels::OPS_NAME.to_string(), ops.name_any()),
        (
            labels::OPS_NAMESPACE.to_string(),
            ops.namespace().unwrap_or_default(),
        ),
    ]))
}

/// First `n` characters of `s`
pub fn cut(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => s.get(..idx).unwrap_or(s),
        None => s,
    }
}

/// Create `obj`, treating "already exists" as success
pub async fn create_if_absent<T>(api: &Api<T>, obj: &T) -> Result<()>
where
    T: kube::Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => {
            debug!("Created {}", obj.name_any());
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete `name`, treating "not found" as success
pub async fn delete_if_present<T>(api: &Api<T>, name: &str) -> Result<()>
where
    T: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
