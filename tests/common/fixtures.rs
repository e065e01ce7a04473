//! Test fixtures and builders for Cluster and OpsRequest resources
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let cluster = ClusterBuilder::new("pg", "default").component("db", 3).build();
//! let ops = OpsRequestBuilder::new("restart-db", "default", "pg", OpsType::Restart)
//!     .restart("db")
//!     .build();
//! ```
//!
//! [`MemoryVolumeWorld`] stands in for the API server when driving the
//! volume rebind of a rebuild, and can be told to fail after a number of
//! writes to simulate the operator crashing mid-protocol.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeSpec, Pod, PodCondition, PodStatus,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use ops_operator::controller::error::{Error, Result};
use ops_operator::crd::{
    Cluster, ClusterComponentSpec, ClusterPhase, ClusterSpec, ClusterStatus, ComponentOps,
    ComponentPhase, ComponentStatus, HorizontalScaling, OpsPhase, OpsRequest, OpsRequestSpec,
    OpsRequestStatus, OpsType, OpsVolumeClaimTemplate, ReplicaRole, Switchover, VolumeExpansion,
    annotations, cluster_labels, labels, to_k8s_time,
};
use ops_operator::handlers::rebuild_instance::rebind::{PvPatch, VolumeWorld};

/// Fixed reference time so tests never depend on the wall clock
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

// =============================================================================
// Cluster Builder
// =============================================================================

/// Builder for Cluster fixtures
///
/// Every component added starts Running, in a Running cluster whose
/// observed generation matches its generation.
pub struct ClusterBuilder {
    cluster: Cluster,
}

impl ClusterBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        let mut cluster = Cluster::new(name, ClusterSpec::default());
        cluster.metadata.namespace = Some(namespace.to_string());
        cluster.metadata.generation = Some(1);
        cluster.status = Some(ClusterStatus {
            phase: ClusterPhase::Running,
            observed_generation: Some(1),
            components: BTreeMap::new(),
        });
        Self { cluster }
    }

    pub fn component(mut self, name: &str, replicas: i32) -> Self {
        self.cluster.spec.component_specs.push(ClusterComponentSpec {
            name: name.to_string(),
            replicas,
            ..Default::default()
        });
        self.status().components.insert(
            name.to_string(),
            ComponentStatus {
                phase: ComponentPhase::Running,
                ..Default::default()
            },
        );
        self
    }

    /// Primary/secondary roles, the primary being the only writable one
    pub fn with_primary_secondary_roles(mut self, component: &str) -> Self {
        if let Some(spec) = self.cluster.component_spec_mut(component) {
            spec.roles = vec![
                ReplicaRole {
                    name: "primary".into(),
                    serviceable: true,
                    writable: true,
                },
                ReplicaRole {
                    name: "secondary".into(),
                    serviceable: true,
                    writable: false,
                },
            ];
        }
        self
    }

    pub fn phase(mut self, phase: ClusterPhase) -> Self {
        self.status().phase = phase;
        self
    }

    pub fn component_phase(mut self, component: &str, phase: ComponentPhase) -> Self {
        self.status()
            .components
            .entry(component.to_string())
            .or_default()
            .phase = phase;
        self
    }

    pub fn pod_message(mut self, component: &str, pod: &str, message: &str) -> Self {
        self.status()
            .components
            .entry(component.to_string())
            .or_default()
            .pod_messages
            .insert(pod.to_string(), message.to_string());
        self
    }

    pub fn build(self) -> Cluster {
        self.cluster
    }

    fn status(&mut self) -> &mut ClusterStatus {
        self.cluster.status.get_or_insert_with(ClusterStatus::default)
    }
}

// =============================================================================
// OpsRequest Builder
// =============================================================================

/// An empty spec of the given type
pub fn ops_spec(cluster: &str, type_: OpsType) -> OpsRequestSpec {
    OpsRequestSpec {
        cluster_name: cluster.to_string(),
        type_,
        force: false,
        cancel: false,
        pre_condition_deadline_seconds: None,
        timeout_seconds: None,
        ttl_seconds_after_succeed: None,
        horizontal_scaling: vec![],
        restart: vec![],
        volume_expansion: vec![],
        switchover: vec![],
        rebuild_from: vec![],
        reconfigures: vec![],
        custom: None,
        expose: vec![],
    }
}

/// Builder for OpsRequest fixtures, created at [`t0`]
pub struct OpsRequestBuilder {
    ops: OpsRequest,
}

impl OpsRequestBuilder {
    pub fn new(name: &str, namespace: &str, cluster: &str, type_: OpsType) -> Self {
        let mut ops = OpsRequest::new(name, ops_spec(cluster, type_));
        ops.metadata.namespace = Some(namespace.to_string());
        ops.metadata.uid = Some(format!("uid-{}", name));
        ops.metadata.creation_timestamp = Some(to_k8s_time(t0()));
        Self { ops }
    }

    pub fn horizontal_scaling(mut self, component: &str, replicas: i32) -> Self {
        self.ops.spec.horizontal_scaling.push(HorizontalScaling {
            component_name: component.to_string(),
            replicas: Some(replicas),
            ..Default::default()
        });
        self
    }

    pub fn restart(mut self, component: &str) -> Self {
        self.ops.spec.restart.push(ComponentOps {
            component_name: component.to_string(),
        });
        self
    }

    pub fn volume_expansion(mut self, component: &str, vct: &str, storage: &str) -> Self {
        self.ops.spec.volume_expansion.push(VolumeExpansion {
            component_name: component.to_string(),
            volume_claim_templates: vec![OpsVolumeClaimTemplate {
                name: vct.to_string(),
                storage: storage.to_string(),
            }],
        });
        self
    }

    pub fn switchover(mut self, component: &str, instance: &str) -> Self {
        self.ops.spec.switchover.push(Switchover {
            component_name: component.to_string(),
            instance_name: instance.to_string(),
        });
        self
    }

    pub fn force(mut self) -> Self {
        self.ops.spec.force = true;
        self
    }

    pub fn phase(mut self, phase: OpsPhase) -> Self {
        self.ops
            .status
            .get_or_insert_with(OpsRequestStatus::default)
            .phase = phase;
        self
    }

    pub fn build(self) -> OpsRequest {
        self.ops
    }
}

// =============================================================================
// Pods and claims
// =============================================================================

/// A component pod created at `created`; ready pods have been Ready since creation
pub fn pod(cluster: &str, component: &str, name: &str, created: DateTime<Utc>, ready: bool) -> Pod {
    let mut pod_labels = BTreeMap::new();
    pod_labels.insert(cluster_labels::INSTANCE.to_string(), cluster.to_string());
    pod_labels.insert(cluster_labels::COMPONENT_NAME.to_string(), component.to_string());
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(pod_labels),
            creation_timestamp: Some(to_k8s_time(created)),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: if ready { "True" } else { "False" }.into(),
                last_transition_time: Some(to_k8s_time(created)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn with_role(mut pod: Pod, role: &str) -> Pod {
    pod.labels_mut()
        .insert(cluster_labels::ROLE.to_string(), role.to_string());
    pod
}

/// A claim requesting `requested`, with `capacity` reported in its status
pub fn pvc(name: &str, requested: &str, capacity: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(requested.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".into()),
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(capacity.to_string()),
            )])),
            ..Default::default()
        }),
    }
}

/// A claim bound to `volume`
pub fn bound_pvc(name: &str, volume: &str) -> PersistentVolumeClaim {
    let mut claim = pvc(name, "10Gi", "10Gi");
    if let Some(spec) = claim.spec.as_mut() {
        spec.volume_name = Some(volume.to_string());
    }
    claim
}

/// A dynamically provisioned volume bound to `claim`, deleted with its claim
pub fn pv(name: &str, claim: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some("Delete".into()),
            claim_ref: Some(ObjectReference {
                name: Some(claim.to_string()),
                namespace: Some("default".into()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn claim_ref_name(pv: &PersistentVolume) -> Option<String> {
    pv.spec
        .as_ref()
        .and_then(|s| s.claim_ref.as_ref())
        .and_then(|r| r.name.clone())
}

pub fn reclaim_policy(pv: &PersistentVolume) -> Option<String> {
    pv.spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.clone())
}

// =============================================================================
// In-memory volume world
// =============================================================================

#[derive(Default)]
struct WorldState {
    pvcs: BTreeMap<String, PersistentVolumeClaim>,
    pvs: BTreeMap<String, PersistentVolume>,
    deleted_pods: Vec<String>,
    /// Claims whose deletion is accepted but which stay terminating
    lingering: BTreeSet<String>,
    /// Writes still allowed before every write fails
    writes_left: Option<usize>,
    writes: usize,
}

/// Claims and volumes of one namespace, with the binding rules that matter
/// to a rebind: deleting a claim deletes a `Delete` volume bound to it, and
/// creating a claim for a free volume binds the two.
#[derive(Default)]
pub struct MemoryVolumeWorld {
    state: Mutex<WorldState>,
}

impl MemoryVolumeWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pvc(&self, pvc: PersistentVolumeClaim) {
        let mut s = self.state.lock().unwrap();
        s.pvcs.insert(pvc.name_any(), pvc);
    }

    pub fn insert_pv(&self, pv: PersistentVolume) {
        let mut s = self.state.lock().unwrap();
        s.pvs.insert(pv.name_any(), pv);
    }

    pub fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.state.lock().unwrap().pvcs.get(name).cloned()
    }

    pub fn pv(&self, name: &str) -> Option<PersistentVolume> {
        self.state.lock().unwrap().pvs.get(name).cloned()
    }

    pub fn pv_names(&self) -> Vec<String> {
        self.state.lock().unwrap().pvs.keys().cloned().collect()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_pods.clone()
    }

    /// Successful writes so far
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Let `n` more writes through, then fail every write until [`heal`](Self::heal)
    pub fn crash_after(&self, n: usize) {
        self.state.lock().unwrap().writes_left = Some(n);
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().writes_left = None;
    }

    /// Keep `name` around, terminating, when it is deleted
    pub fn linger_on_delete(&self, name: &str) {
        self.state.lock().unwrap().lingering.insert(name.to_string());
    }

    /// Let every terminating claim go away
    pub fn finish_terminating(&self) {
        let mut s = self.state.lock().unwrap();
        let names: Vec<String> = std::mem::take(&mut s.lingering).into_iter().collect();
        for name in names {
            let terminating = s
                .pvcs
                .get(&name)
                .is_some_and(|c| c.metadata.deletion_timestamp.is_some());
            if terminating {
                remove_claim(&mut s, &name);
            }
        }
    }

    fn write<R>(&self, f: impl FnOnce(&mut WorldState) -> R) -> Result<R> {
        let mut s = self.state.lock().unwrap();
        match s.writes_left {
            Some(0) => return Err(Error::Transient("injected crash".into())),
            Some(n) => s.writes_left = Some(n - 1),
            None => {}
        }
        s.writes += 1;
        Ok(f(&mut s))
    }
}

/// Drop a claim together with a non-retained volume bound to it
fn remove_claim(s: &mut WorldState, name: &str) {
    if s.pvcs.remove(name).is_none() {
        return;
    }
    s.pvs.retain(|_, pv| {
        let bound_here = claim_ref_name(pv).as_deref() == Some(name);
        !(bound_here && reclaim_policy(pv).as_deref() != Some("Retain"))
    });
}

#[async_trait]
impl VolumeWorld for MemoryVolumeWorld {
    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.pvc(name))
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        let pvc = pvc.clone();
        self.write(|s| {
            let name = pvc.name_any();
            if s.pvcs.contains_key(&name) {
                return;
            }
            let mut pvc = pvc;
            let volume = pvc.spec.as_ref().and_then(|sp| sp.volume_name.clone());
            if let Some(volume) = volume
                && let Some(pv) = s.pvs.get_mut(&volume)
                && let Some(spec) = pv.spec.as_mut()
                && spec.claim_ref.is_none()
            {
                spec.claim_ref = Some(ObjectReference {
                    name: Some(name.clone()),
                    namespace: pvc.namespace(),
                    ..Default::default()
                });
                pvc.status = Some(PersistentVolumeClaimStatus {
                    phase: Some("Bound".into()),
                    ..Default::default()
                });
            }
            s.pvcs.insert(name, pvc);
        })
    }

    async fn delete_pvc(&self, name: &str) -> Result<()> {
        self.write(|s| {
            if s.lingering.contains(name) {
                if let Some(claim) = s.pvcs.get_mut(name) {
                    claim.metadata.deletion_timestamp = Some(to_k8s_time(t0()));
                }
                return;
            }
            remove_claim(s, name);
        })
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.pv(name))
    }

    async fn find_pv_by_tmp_claim(&self, tmp_claim: &str) -> Result<Option<PersistentVolume>> {
        let s = self.state.lock().unwrap();
        Ok(s.pvs
            .values()
            .find(|pv| pv.labels().get(labels::REBUILD_TMP_PVC).map(String::as_str) == Some(tmp_claim))
            .cloned())
    }

    async fn patch_pv(&self, name: &str, patch: &PvPatch) -> Result<()> {
        let patch = patch.clone();
        let missing = self.write(|s| {
            let Some(pv) = s.pvs.get_mut(name) else {
                return true;
            };
            match patch {
                PvPatch::RetainAndLabel { tmp_claim } => {
                    pv.labels_mut()
                        .insert(labels::REBUILD_TMP_PVC.to_string(), tmp_claim);
                    pv.spec.get_or_insert_with(Default::default).persistent_volume_reclaim_policy =
                        Some("Retain".into());
                }
                PvPatch::Release { ops_name } => {
                    pv.annotations_mut()
                        .insert(annotations::REBUILD_FROM.to_string(), ops_name);
                    pv.spec.get_or_insert_with(Default::default).claim_ref = None;
                }
            }
            false
        })?;
        if missing {
            return Err(Error::NotFound(format!("pv {}", name)));
        }
        Ok(())
    }

    async fn delete_pod(&self, name: &str, _force: bool) -> Result<()> {
        let name = name.to_string();
        self.write(|s| s.deleted_pods.push(name))
    }
}
