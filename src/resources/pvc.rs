//! PersistentVolumeClaim lookups, expansion state and rebuild claims

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ListParams;
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};

use crate::controller::error::Result;
use crate::crd::cluster_labels;
use crate::resources::common::{component_labels, selector};
use crate::resources::quantity::compare_quantity;

pub const PVC_KIND: &str = "PersistentVolumeClaim";

/// Claims of one volume claim template of a component, sorted by name
pub async fn list_component_pvcs(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
    component: &str,
    vct: &str,
) -> Result<Vec<PersistentVolumeClaim>> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let mut labels = component_labels(cluster_name, component);
    labels.insert(
        cluster_labels::VOLUME_CLAIM_TEMPLATE.to_string(),
        vct.to_string(),
    );
    let lp = ListParams::default().labels(&selector(&labels));
    let mut pvcs = api.list(&lp).await?.items;
    pvcs.sort_by_key(|p| p.name_any());
    Ok(pvcs)
}

/// Name the cluster controller gives a component claim: `<vct>-<cluster>-<component>-<ordinal>`
pub fn claim_name(vct: &str, pod_name: &str) -> String {
    format!("{}-{}", vct, pod_name)
}

pub fn pvc_bound(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound")
}

/// Storage request in the claim spec
pub fn pvc_request(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.as_str())
}

/// Storage capacity reported in the claim status
pub fn pvc_capacity(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .map(|q| q.0.as_str())
}

/// A resize condition (`Resizing` or `FileSystemResizePending`) is set
pub fn pvc_resizing(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds.iter().any(|c| {
                c.status == "True"
                    && (c.type_ == "Resizing" || c.type_ == "FileSystemResizePending")
            })
        })
}

/// Where one claim stands in an expansion to `requested`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionState {
    /// Capacity reached the request and the claim is bound
    Expanded,
    /// A resize is in progress
    Resizing,
    /// Nothing has picked the claim up yet
    Waiting,
}

pub fn expansion_state(pvc: &PersistentVolumeClaim, requested: &str) -> ExpansionState {
    let reached = |q: Option<&str>| {
        q.and_then(|q| compare_quantity(q, requested))
            .is_some_and(|o| o.is_ge())
    };
    let request_matches = pvc_request(pvc)
        .and_then(|q| compare_quantity(q, requested))
        .is_some_and(|o| o.is_eq());
    if reached(pvc_capacity(pvc)) && request_matches && pvc_bound(pvc) {
        return ExpansionState::Expanded;
    }
    if pvc_resizing(pvc) {
        return ExpansionState::Resizing;
    }
    ExpansionState::Waiting
}

/// Inputs of a claim created by the rebuild workflow
#[derive(Debug, Clone, Default)]
pub struct RebuildClaim {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub storage: String,
    pub storage_class_name: Option<String>,
    /// Bind to this pre-existing volume instead of provisioning one
    pub volume_name: Option<String>,
}

impl RebuildClaim {
    pub fn build(&self) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.clone()),
                annotations: Some(self.annotations.clone()).filter(|a| !a.is_empty()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: self.storage_class_name.clone(),
                volume_name: self.volume_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(self.storage.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
