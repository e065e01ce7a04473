//! Pod lookups and the throwaway pod used to provision rebuild volumes

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use kube::api::ListParams;
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};

use crate::controller::error::Result;
use crate::crd::{ReplicaRole, cluster_labels};
use crate::resources::common::{component_labels, selector};

/// Image used for throwaway pods when the component declares none
pub const DEFAULT_HELPER_IMAGE: &str = "busybox:1.36";

/// Pods of one component, sorted by name
pub async fn list_component_pods(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
    component: &str,
) -> Result<Vec<Pod>> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&selector(&component_labels(cluster_name, component)));
    let mut pods = api.list(&lp).await?.items;
    pods.sort_by_key(|p| p.name_any());
    Ok(pods)
}

/// Role label of a pod
pub fn pod_role(pod: &Pod) -> Option<&str> {
    pod.labels().get(cluster_labels::ROLE).map(String::as_str)
}

/// Pods whose role is both serviceable and writable
pub fn writable_pods<'a>(pods: &'a [Pod], roles: &[ReplicaRole]) -> Vec<&'a Pod> {
    pods.iter()
        .filter(|p| {
            pod_role(p).is_some_and(|role| {
                roles
                    .iter()
                    .any(|r| r.name == role && r.serviceable && r.writable)
            })
        })
        .collect()
}

/// A pod that mounts `claims` and exits, forcing dynamic provisioning of their volumes
pub fn volume_provisioning_pod(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    image: &str,
    claims: &[(String, String)],
    node_name: Option<String>,
) -> Pod {
    let volumes = claims
        .iter()
        .map(|(volume, claim)| Volume {
            name: volume.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.clone(),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect();
    let mounts = claims
        .iter()
        .map(|(volume, _)| VolumeMount {
            name: volume.clone(),
            mount_path: format!("/data/{}", volume),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            node_name,
            containers: vec![Container {
                name: "rebuild".to_string(),
                image: Some(image.to_string()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "echo 'rebuild done.'".to_string(),
                ]),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod finished successfully
pub fn pod_succeeded(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Succeeded")
}

pub fn pod_failed(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed")
}
