//! RebuildInstance: replace the storage of broken instances from a backup or from peers.
//!
//! In-place rebuilds provision fresh volumes next to the instance (a temp pod,
//! or a prepare-data Restore when the backup's action set has one), rebind
//! them to the instance's own claims and delete the pod so it comes back on
//! the new data. Otherwise the component is scaled out by one replica per
//! instance and each broken instance is taken offline once its replacement
//! is available.
//!
//! Progress of every instance is persisted as a [`RebuildStep`] in
//! `status.components[c].instanceSteps`; see [`steps::advance`].

pub mod rebind;
pub mod steps;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DeleteParams, ListParams};
use kube::{Api, ResourceExt};
use tracing::{info, warn};

use crate::controller::Context;
use crate::controller::aggregator::{
    POD_KIND, ProgressSummary, generate_pod_names, pod_is_available, resolve_components,
};
use crate::controller::error::{Error, Result};
use crate::controller::progress::{detail, object_key, set_progress_detail};
use crate::crd::{
    ActionSet, Backup, BackupPhase, BackupRef, BackupType, ClusterComponentSpec, ComponentPhase,
    LastComponentConfiguration, PrepareDataConfig, ProgressStatus, ReadyConfig, RebuildInstance,
    RebuildStep, Restore, RestoreActionSpec, RestorePhase, RestoreSpec, RestoreVolumeClaim,
    annotations, cluster_labels,
};
use crate::handlers::{OpsResource, ReconcileOutcome, component_not_found, update_cluster};
use crate::resources::common::{component_labels, create_if_absent, cut, ops_labels, ops_selector, owner_reference};
use crate::resources::pod::{DEFAULT_HELPER_IMAGE, list_component_pods, pod_failed, pod_succeeded, volume_provisioning_pod};
use crate::resources::pvc::{RebuildClaim, claim_name};

use rebind::{KubeVolumeWorld, VolumeWorld, rebind_volume};
use steps::{Observation, Phase, StepAction};

const REQUEUE: Duration = Duration::from_secs(5);
const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";
const STAGE_PREPARE_DATA: &str = "preparedata";
const STAGE_POST_READY: &str = "postready";

/// Prefix of every temp object of a request
pub fn temp_prefix(ops_uid: &str) -> String {
    format!("rebuild-{}", cut(ops_uid, 8))
}

pub fn tmp_pvc_name(prefix: &str, component: &str, vct: &str, idx: usize) -> String {
    let comp_vct = format!("{}-{}", component, vct);
    format!("{}-{}-{}", prefix, cut(&comp_vct, 30), idx)
}

pub fn tmp_pod_name(prefix: &str, ops_name: &str, component: &str, idx: usize) -> String {
    format!("{}-{}-{}-{}", prefix, cut(ops_name, 20), component, idx)
}

pub fn restore_name(prefix: &str, stage: &str, ops_name: &str, component: &str, idx: usize) -> String {
    format!("{}-{}-{}-{}-{}", prefix, stage, cut(ops_name, 10), component, idx)
}

/// A backup can seed a rebuild only when it is a completed full backup with a method
pub fn check_backup(backup: &Backup) -> Result<()> {
    let name = backup.name_any();
    let status = backup.status.clone().unwrap_or_default();
    if status.backup_type != BackupType::Full {
        return Err(Error::ValidationError(format!(
            "it is not supported to rebuild the instance from a non-full backup \"{}\"",
            name
        )));
    }
    if status.phase != BackupPhase::Completed {
        return Err(Error::ValidationError(format!(
            "the backup \"{}\" is not completed",
            name
        )));
    }
    if status.backup_method.is_none() {
        return Err(Error::ValidationError(format!(
            "the backupMethod of the backup \"{}\" can not be empty",
            name
        )));
    }
    Ok(())
}

/// Whether an instance serves traffic again.
///
/// A failed pod is fatal for the instance being rebuilt.
pub fn instance_available(
    pod: &Pod,
    spec: &ClusterComponentSpec,
    ignore_role_check: bool,
    now: DateTime<Utc>,
) -> Result<bool> {
    if pod.metadata.deletion_timestamp.is_some() {
        return Ok(false);
    }
    if pod_failed(pod) {
        return Err(Error::fatal(format!(
            "the new instance \"{}\" is failed, please check it",
            pod.name_any()
        )));
    }
    if !pod_is_available(pod, spec.min_ready_seconds, now) {
        return Ok(false);
    }
    Ok(spec.roles.is_empty()
        || ignore_role_check
        || pod.labels().contains_key(cluster_labels::ROLE))
}

/// Pods added by the scale out, in name order
pub fn replacement_pods(
    cluster_name: &str,
    component: &str,
    current: &ClusterComponentSpec,
    last: &LastComponentConfiguration,
) -> Vec<String> {
    let before = generate_pod_names(
        cluster_name,
        component,
        last.replicas.unwrap_or(current.replicas),
        &last.offline_instances,
    );
    let after = generate_pod_names(
        cluster_name,
        component,
        current.replicas,
        &current.offline_instances,
    );
    after.difference(&before).cloned().collect()
}

/// Component an instance belongs to: its shard for a sharding, else `target`
pub fn instance_component(pod: Option<&Pod>, target: &str) -> String {
    pod.and_then(|p| p.labels().get(cluster_labels::COMPONENT_NAME).cloned())
        .unwrap_or_else(|| target.to_string())
}

/// Labels of a recreated source claim
pub fn source_claim_labels(
    cluster_name: &str,
    sharding: Option<&str>,
    component: &str,
    vct: &str,
) -> BTreeMap<String, String> {
    let mut labels = component_labels(cluster_name, component);
    labels.insert(cluster_labels::VOLUME_CLAIM_TEMPLATE.to_string(), vct.to_string());
    if let Some(sharding) = sharding {
        labels.insert(cluster_labels::SHARDING_NAME.to_string(), sharding.to_string());
    }
    labels
}

fn ignore_role_check(res: &OpsResource) -> bool {
    res.ops
        .annotations()
        .get(annotations::IGNORE_ROLE_CHECK)
        .is_some_and(|v| v == "true")
}

async fn component_pods(ctx: &Context, res: &OpsResource, target: &str) -> Result<Vec<Pod>> {
    let ns = res.namespace();
    let cluster_name = res.cluster.name_any();
    let mut pods = Vec::new();
    for resolved in resolve_components(&res.cluster, target) {
        pods.extend(list_component_pods(&ctx.client, &ns, &cluster_name, &resolved.name).await?);
    }
    Ok(pods)
}

fn find_pod<'a>(pods: &'a [Pod], name: &str) -> Option<&'a Pod> {
    pods.iter().find(|p| p.name_any() == name)
}

/// Restore recipes of the backup a rebuild uses
async fn restore_actions(ctx: &Context, namespace: &str, backup_name: &str) -> Result<RestoreActionSpec> {
    let backups: Api<Backup> = Api::namespaced(ctx.client.clone(), namespace);
    let backup = backups
        .get_opt(backup_name)
        .await?
        .ok_or_else(|| Error::fatal(format!("backup \"{}\" not found", backup_name)))?;
    let Some(action_set_name) = backup
        .status
        .as_ref()
        .and_then(|s| s.backup_method.as_ref())
        .and_then(|m| m.action_set_name.clone())
    else {
        return Ok(RestoreActionSpec::default());
    };
    let action_sets: Api<ActionSet> = Api::all(ctx.client.clone());
    let action_set = action_sets
        .get_opt(&action_set_name)
        .await?
        .ok_or_else(|| Error::fatal(format!("actionSet \"{}\" not found", action_set_name)))?;
    Ok(action_set.spec.restore.unwrap_or_default())
}

pub async fn validate(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    let force = res.ops.spec.force;
    let ignore_roles = ignore_role_check(res);
    for rebuild in res.ops.spec.rebuild_from.clone() {
        let target = rebuild.component_name.as_str();
        let spec = res
            .cluster
            .component_spec(target)
            .cloned()
            .ok_or_else(|| component_not_found(&res.cluster, target))?;

        if !force {
            let phases: Vec<ComponentPhase> = resolve_components(&res.cluster, target)
                .iter()
                .filter_map(|c| res.cluster.component_status(&c.name).map(|s| s.phase))
                .collect();
            let rebuildable = phases.iter().any(|p| {
                matches!(
                    p,
                    ComponentPhase::Failed | ComponentPhase::Abnormal | ComponentPhase::Updating
                )
            });
            if !rebuildable {
                return Err(Error::ValidationError(format!(
                    "the phase of component {} must be Failed, Abnormal or Updating to rebuild instances",
                    target
                )));
            }
        }
        if rebuild.instances.is_empty() {
            return Err(Error::ValidationError(format!(
                "instances of component {} can not be empty",
                target
            )));
        }
        if !rebuild.in_place && res.cluster.sharding(target).is_some() {
            return Err(Error::ValidationError(
                "sharding cluster only supports to rebuild instance in place".to_string(),
            ));
        }

        let pods = component_pods(ctx, res, target).await?;
        for instance in &rebuild.instances {
            let pod = find_pod(&pods, &instance.name).ok_or_else(|| {
                Error::ValidationError(format!(
                    "instance \"{}\" not found in component {}",
                    instance.name, target
                ))
            })?;
            if !force && instance_available(pod, &spec, ignore_roles, res.now).unwrap_or(false) {
                return Err(Error::ValidationError(format!(
                    "instance \"{}\" is available, can not rebuild it",
                    instance.name
                )));
            }
        }

        if !rebuild.in_place {
            let rebuilding: BTreeSet<&str> =
                rebuild.instances.iter().map(|i| i.name.as_str()).collect();
            let peer_available = pods.iter().any(|p| {
                !rebuilding.contains(p.name_any().as_str())
                    && instance_available(p, &spec, ignore_roles, res.now).unwrap_or(false)
            });
            if !peer_available {
                return Err(Error::ValidationError(format!(
                    "component {} has no available instance to rebuild from",
                    target
                )));
            }
        }

        if let Some(backup_name) = &rebuild.backup_name {
            let backups: Api<Backup> = Api::namespaced(ctx.client.clone(), &res.namespace());
            let backup = backups.get_opt(backup_name).await?.ok_or_else(|| {
                Error::ValidationError(format!("backup \"{}\" not found", backup_name))
            })?;
            check_backup(&backup)?;
        }
    }
    Ok(())
}

pub fn save_last_configuration(res: &mut OpsResource) {
    for rebuild in &res.ops.spec.rebuild_from {
        let Some(spec) = res.cluster.component_spec(&rebuild.component_name) else {
            continue;
        };
        res.status.last_configuration.components.insert(
            rebuild.component_name.clone(),
            LastComponentConfiguration {
                replicas: Some(spec.replicas),
                offline_instances: spec.offline_instances.clone(),
                ..Default::default()
            },
        );
    }
}

/// Scale out the components rebuilt by replacement
pub async fn action(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    let scale_out: Vec<(String, i32)> = res
        .ops
        .spec
        .rebuild_from
        .iter()
        .filter(|r| !r.in_place)
        .map(|r| {
            let n = i32::try_from(r.instances.len()).unwrap_or(i32::MAX);
            (r.component_name.clone(), n)
        })
        .collect();
    if scale_out.is_empty() {
        return Ok(());
    }
    let last = res.status.last_configuration.components.clone();

    update_cluster(ctx, res, |cluster| {
        for (component, n) in &scale_out {
            let saved = last.get(component).and_then(|l| l.replicas);
            let spec = cluster
                .component_spec_mut(component)
                .ok_or_else(|| Error::fatal(format!("component {} not found", component)))?;
            match saved {
                Some(r) if spec.replicas == r => spec.replicas += n,
                Some(r) if spec.replicas == r + n => {}
                _ => {
                    return Err(Error::fatal(format!(
                        "the replicas of component {} has been modified by another operation",
                        component
                    )));
                }
            }
        }
        Ok(())
    })
    .await
}

/// Source of restored data for one rebuild entry
#[derive(Debug, Clone)]
struct RestoreSource {
    backup_name: String,
    actions: RestoreActionSpec,
}

/// Per-component inputs shared by every instance
#[derive(Debug, Clone)]
struct Plan {
    ops_name: String,
    namespace: String,
    cluster_name: String,
    /// Target of the rebuild entry; a sharding name for shards
    component: String,
    sharded: bool,
    spec: ClusterComponentSpec,
    in_place: bool,
    prefix: String,
    owner: OwnerReference,
    tmp_labels: BTreeMap<String, String>,
    restore: Option<RestoreSource>,
    ignore_role_check: bool,
}

impl Plan {
    fn prepares_data(&self) -> bool {
        self.restore
            .as_ref()
            .is_some_and(|r| r.actions.prepare_data.is_some())
    }

    fn has_post_ready(&self) -> bool {
        self.restore
            .as_ref()
            .is_some_and(|r| !r.actions.post_ready.is_empty())
    }

    fn tmp_claim(&self, vct: &str, idx: usize) -> Result<PersistentVolumeClaim> {
        let template = self
            .spec
            .volume_claim_templates
            .iter()
            .find(|v| v.name == vct)
            .ok_or_else(|| Error::fatal(format!("volumeClaimTemplate {} not found", vct)))?;
        let mut labels = self.tmp_labels.clone();
        labels.insert(cluster_labels::VOLUME_CLAIM_TEMPLATE.to_string(), vct.to_string());
        Ok(RebuildClaim {
            name: tmp_pvc_name(&self.prefix, &self.component, vct, idx),
            namespace: self.namespace.clone(),
            labels,
            annotations: BTreeMap::from([(
                annotations::REBUILD_FROM.to_string(),
                self.ops_name.clone(),
            )]),
            storage: template.storage.clone(),
            storage_class_name: template.storage_class_name.clone(),
            volume_name: None,
        }
        .build())
    }

    fn tmp_claims(&self, idx: usize) -> Result<Vec<(String, PersistentVolumeClaim)>> {
        self.spec
            .volume_claim_templates
            .iter()
            .map(|v| Ok((v.name.clone(), self.tmp_claim(&v.name, idx)?)))
            .collect()
    }

    fn source_labels(&self, target: &Target<'_>, vct: &str) -> BTreeMap<String, String> {
        let sharding = self.sharded.then_some(self.component.as_str());
        source_claim_labels(&self.cluster_name, sharding, &target.component, vct)
    }

    fn restore_object(&self, stage: &str, idx: usize, spec: RestoreSpec) -> Restore {
        let mut restore = Restore::new(
            &restore_name(&self.prefix, stage, &self.ops_name, &self.component, idx),
            spec,
        );
        restore.metadata.namespace = Some(self.namespace.clone());
        restore.metadata.labels = Some(self.tmp_labels.clone());
        restore.metadata.owner_references = Some(vec![self.owner.clone()]);
        restore
    }

    fn backup_ref(&self) -> Result<BackupRef> {
        let source = self
            .restore
            .as_ref()
            .ok_or_else(|| Error::fatal("rebuilding from a Restore requires a backup"))?;
        Ok(BackupRef {
            name: source.backup_name.clone(),
            namespace: self.namespace.clone(),
        })
    }
}

fn restore_phase(restore: Option<&Restore>, stage: &str, instance: &str) -> Phase {
    let Some(restore) = restore else {
        return Phase::Missing;
    };
    let name = restore.name_any();
    match restore.phase() {
        Some(RestorePhase::Completed) => Phase::Completed,
        Some(RestorePhase::Failed) => Phase::Failed(format!(
            "pod \"{}\" rebuild failed, due to the Restore \"{}\" is Failed",
            instance, name
        )),
        _ => Phase::Running(format!(
            "Waiting for {} Restore \"{}\" to be completed",
            stage, name
        )),
    }
}

fn tmp_pod_phase(pod: Option<&Pod>) -> Phase {
    let Some(pod) = pod else {
        return Phase::Missing;
    };
    let name = pod.name_any();
    if pod_succeeded(pod) {
        Phase::Completed
    } else if pod_failed(pod) {
        Phase::Failed(format!("the rebuilding pod \"{}\" is failed", name))
    } else {
        Phase::Running(format!("Waiting for rebuilding pod \"{}\" to be completed", name))
    }
}

/// One instance being rebuilt
struct Target<'a> {
    idx: usize,
    instance: &'a str,
    /// The pod expected to come back available: the instance itself, or its replacement
    pod: String,
    /// Component of the instance; the shard for a sharding
    component: String,
}

async fn observe(
    ctx: &Context,
    plan: &Plan,
    step: RebuildStep,
    target: &Target<'_>,
    pods: &[Pod],
    now: DateTime<Utc>,
) -> Result<Observation> {
    let restores: Api<Restore> = Api::namespaced(ctx.client.clone(), &plan.namespace);
    let mut obs = Observation {
        in_place: plan.in_place,
        has_post_ready: plan.has_post_ready(),
        ..Default::default()
    };
    match step {
        RebuildStep::ProvisioningVolumes if plan.prepares_data() => {
            let name = restore_name(&plan.prefix, STAGE_PREPARE_DATA, &plan.ops_name, &plan.component, target.idx);
            let restore = restores.get_opt(&name).await?;
            obs.provisioning = restore_phase(restore.as_ref(), STAGE_PREPARE_DATA, target.instance);
        }
        RebuildStep::ProvisioningVolumes => {
            let tmp_pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &plan.namespace);
            let name = tmp_pod_name(&plan.prefix, &plan.ops_name, &plan.component, target.idx);
            obs.provisioning = tmp_pod_phase(tmp_pods.get_opt(&name).await?.as_ref());
        }
        RebuildStep::WaitingInstanceReady => {
            obs.instance_ready = match find_pod(pods, &target.pod) {
                Some(pod) => instance_available(pod, &plan.spec, plan.ignore_role_check, now)?,
                None => false,
            };
            obs.source_gone = find_pod(pods, target.instance).is_none();
        }
        RebuildStep::PostReady => {
            let name = restore_name(&plan.prefix, STAGE_POST_READY, &plan.ops_name, &plan.component, target.idx);
            let restore = restores.get_opt(&name).await?;
            obs.post_ready = restore_phase(restore.as_ref(), STAGE_POST_READY, target.instance);
        }
        _ => {}
    }
    Ok(obs)
}

async fn provision(ctx: &Context, plan: &Plan, target: &Target<'_>, pods: &[Pod]) -> Result<()> {
    let claims = plan.tmp_claims(target.idx)?;
    if plan.prepares_data() {
        let volume_claims = claims
            .iter()
            .map(|(vct, pvc)| {
                let template = plan.spec.volume_claim_templates.iter().find(|v| &v.name == vct);
                RestoreVolumeClaim {
                    name: pvc.name_any(),
                    storage: template.map(|t| t.storage.clone()).unwrap_or_default(),
                    storage_class_name: template.and_then(|t| t.storage_class_name.clone()),
                    labels: pvc.labels().clone(),
                    annotations: pvc.annotations().clone(),
                }
            })
            .collect();
        let restore = plan.restore_object(
            STAGE_PREPARE_DATA,
            target.idx,
            RestoreSpec {
                backup: plan.backup_ref()?,
                prepare_data_config: Some(PrepareDataConfig { volume_claims }),
                ready_config: None,
            },
        );
        let api: Api<Restore> = Api::namespaced(ctx.client.clone(), &plan.namespace);
        return create_if_absent(&api, &restore).await;
    }

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &plan.namespace);
    for (_, pvc) in &claims {
        create_if_absent(&pvcs, pvc).await?;
    }
    // Local volumes have to be provisioned on the instance's node
    let node = find_pod(pods, target.instance)
        .and_then(|p| p.spec.as_ref())
        .and_then(|s| s.node_name.clone());
    let mounts: Vec<(String, String)> = claims
        .iter()
        .map(|(vct, pvc)| (vct.clone(), pvc.name_any()))
        .collect();
    let pod = volume_provisioning_pod(
        &tmp_pod_name(&plan.prefix, &plan.ops_name, &plan.component, target.idx),
        &plan.namespace,
        plan.tmp_labels.clone(),
        plan.owner.clone(),
        plan.spec.image.as_deref().unwrap_or(DEFAULT_HELPER_IMAGE),
        &mounts,
        node,
    );
    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &plan.namespace);
    create_if_absent(&api, &pod).await
}

async fn rebind<W: VolumeWorld + ?Sized>(world: &W, plan: &Plan, target: &Target<'_>) -> Result<()> {
    for (vct, tmp) in plan.tmp_claims(target.idx)? {
        let source = claim_name(&vct, target.instance);
        rebind_volume(world, &plan.ops_name, &source, &tmp, &plan.source_labels(target, &vct)).await?;
    }
    world.delete_pod(target.instance, true).await
}

async fn start_post_ready(ctx: &Context, plan: &Plan, target: &Target<'_>) -> Result<()> {
    let mut pod_selector = component_labels(&plan.cluster_name, &target.component);
    pod_selector.insert(POD_NAME_LABEL.to_string(), target.pod.clone());
    let restore = plan.restore_object(
        STAGE_POST_READY,
        target.idx,
        RestoreSpec {
            backup: plan.backup_ref()?,
            prepare_data_config: None,
            ready_config: Some(ReadyConfig { pod_selector }),
        },
    );
    let api: Api<Restore> = Api::namespaced(ctx.client.clone(), &plan.namespace);
    create_if_absent(&api, &restore).await
}

/// Take a replaced instance offline; a no-op once it is
async fn take_offline(ctx: &Context, res: &mut OpsResource, component: &str, instance: &str) -> Result<()> {
    update_cluster(ctx, res, |cluster| {
        let spec = cluster
            .component_spec_mut(component)
            .ok_or_else(|| Error::fatal(format!("component {} not found", component)))?;
        if !spec.offline_instances.iter().any(|i| i == instance) {
            spec.offline_instances.push(instance.to_string());
            spec.replicas -= 1;
        }
        Ok(())
    })
    .await
}

/// Run a step action; returns the detail to record
async fn execute(
    ctx: &Context,
    res: &mut OpsResource,
    plan: &Plan,
    target: &Target<'_>,
    pods: &[Pod],
    action: StepAction,
) -> Result<Option<(ProgressStatus, String)>> {
    match action {
        StepAction::Provision => {
            provision(ctx, plan, target, pods).await?;
            Ok(Some((
                ProgressStatus::Processing,
                format!("Start to rebuild pod \"{}\"", target.instance),
            )))
        }
        StepAction::Rebind => {
            let world = KubeVolumeWorld::new(ctx.client.clone(), &plan.namespace);
            rebind(&world, plan, target).await?;
            Ok(Some((ProgressStatus::Processing, steps::WAITING_FOR_INSTANCE_READY.to_string())))
        }
        StepAction::StartPostReady => {
            start_post_ready(ctx, plan, target).await?;
            Ok(Some((
                ProgressStatus::Processing,
                format!("Start the {} Restore of pod \"{}\"", STAGE_POST_READY, target.pod),
            )))
        }
        StepAction::Offline => {
            take_offline(ctx, res, &plan.component, target.instance).await?;
            Ok(Some((
                ProgressStatus::Processing,
                format!("Taking the instance \"{}\" offline", target.instance),
            )))
        }
        StepAction::Wait(msg) => Ok(Some((ProgressStatus::Processing, msg))),
        StepAction::Succeed => Ok(Some((
            ProgressStatus::Succeed,
            format!("Rebuild pod {} successfully", target.instance),
        ))),
        StepAction::Fail(msg) => Ok(Some((ProgressStatus::Failed, msg))),
        StepAction::Done => Ok(None),
    }
}

async fn plan_for(ctx: &Context, res: &OpsResource, rebuild: &RebuildInstance) -> Result<Plan> {
    let namespace = res.namespace();
    let spec = res
        .cluster
        .component_spec(&rebuild.component_name)
        .cloned()
        .ok_or_else(|| component_not_found(&res.cluster, &rebuild.component_name))?;
    let restore = match &rebuild.backup_name {
        Some(backup_name) => Some(RestoreSource {
            backup_name: backup_name.clone(),
            actions: restore_actions(ctx, &namespace, backup_name).await?,
        }),
        None => None,
    };
    Ok(Plan {
        ops_name: res.name(),
        cluster_name: res.cluster.name_any(),
        component: rebuild.component_name.clone(),
        sharded: res.cluster.sharding(&rebuild.component_name).is_some(),
        spec,
        in_place: rebuild.in_place,
        prefix: temp_prefix(res.ops.metadata.uid.as_deref().unwrap_or_default()),
        owner: owner_reference(&res.ops),
        tmp_labels: ops_labels(&res.ops),
        restore,
        ignore_role_check: ignore_role_check(res),
        namespace,
    })
}

pub async fn reconcile_action(ctx: &Context, res: &mut OpsResource) -> Result<ReconcileOutcome> {
    let mut summary = ProgressSummary::default();

    for rebuild in res.ops.spec.rebuild_from.clone() {
        let plan = plan_for(ctx, res, &rebuild).await?;
        let component = plan.component.clone();
        let replacements = if plan.in_place {
            Vec::new()
        } else {
            let last = res
                .status
                .last_configuration
                .components
                .get(&component)
                .cloned()
                .unwrap_or_default();
            replacement_pods(&plan.cluster_name, &component, &plan.spec, &last)
        };
        let mut instances: Vec<&str> = rebuild.instances.iter().map(|i| i.name.as_str()).collect();
        instances.sort_unstable();
        let pods = component_pods(ctx, res, &component).await?;

        for (idx, instance) in instances.iter().copied().enumerate() {
            summary.expected += 1;
            let step = res
                .status
                .components
                .get(&component)
                .and_then(|s| s.instance_steps.get(instance))
                .copied()
                .unwrap_or_default();
            let target_pod = if plan.in_place {
                Some(instance.to_string())
            } else {
                replacements.get(idx).cloned()
            };

            let result = match target_pod {
                Some(pod) => {
                    let target = Target {
                        idx,
                        instance,
                        pod,
                        component: instance_component(find_pod(&pods, instance), &component),
                    };
                    match observe(ctx, &plan, step, &target, &pods, res.now).await {
                        Ok(obs) => {
                            let (next, action) = steps::advance(step, &obs);
                            execute(ctx, res, &plan, &target, &pods, action)
                                .await
                                .map(|d| (next, d))
                        }
                        Err(e) => Err(e),
                    }
                }
                None => Err(Error::fatal(format!(
                    "can not find the replacement of instance \"{}\"",
                    instance
                ))),
            };

            let (next, new_detail) = match result {
                Ok(r) => r,
                Err(e) if e.is_fatal() => {
                    warn!(instance, error = %e, "Rebuild of instance failed");
                    (RebuildStep::Failed, Some((ProgressStatus::Failed, e.to_string())))
                }
                Err(e) => return Err(e),
            };

            let now = res.now;
            let status = res.component_status_mut(&component);
            if next != step {
                info!(instance, from = ?step, to = ?next, "Rebuild step advanced");
            }
            status.instance_steps.insert(instance.to_string(), next);
            if let Some((progress, message)) = new_detail {
                let key = object_key(POD_KIND, instance);
                let event = set_progress_detail(&mut status.progress_details, detail(key, progress, message), now);
                res.events.extend(event);
            }
            match next {
                RebuildStep::Succeed => {
                    summary.completed += 1;
                    summary.succeeded += 1;
                }
                RebuildStep::Failed => summary.completed += 1,
                _ => {}
            }
        }
    }

    if summary.is_complete() && summary.failed() == 0 {
        cleanup_temp_objects(ctx, res).await?;
    }
    Ok(ReconcileOutcome::new(summary, REQUEUE))
}

/// Remove temp pods and claims left behind by the request
async fn cleanup_temp_objects(ctx: &Context, res: &OpsResource) -> Result<()> {
    let ns = res.namespace();
    let lp = ListParams::default().labels(&ops_selector(&res.ops));
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
    pods.delete_collection(&DeleteParams::background(), &lp).await?;
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);
    pvcs.delete_collection(&DeleteParams::background(), &lp).await?;
    Ok(())
}
