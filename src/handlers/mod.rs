//! Operation handlers.
//!
//! Each kind implements the same five entry points: `validate`,
//! `save_last_configuration`, `action` (the one-shot cluster mutation),
//! `reconcile_action` (the repeatable progress check) and, where supported,
//! `cancel`. The functions below dispatch on [`OpsKind`].

pub mod custom;
pub mod expose;
pub mod horizontal_scaling;
pub mod rebuild_instance;
pub mod reconfigure;
pub mod restart;
pub mod switchover;
pub mod volume_expansion;

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::controller::Context;
use crate::controller::aggregator::{PodRules, ProgressSummary, ops_processed};
use crate::controller::error::{Error, Result};
use crate::controller::progress::ProgressEvent;
use crate::controller::registry::{OpsBehaviour, OpsKind};
use crate::crd::{
    Cluster, ClusterPhase, OpsRequest, OpsRequestComponentStatus, OpsRequestStatus, from_k8s_time,
    parse_time,
};
use crate::resources::FIELD_MANAGER;

/// Attempts of an optimistic cluster spec update
const MAX_CLUSTER_UPDATE_ATTEMPTS: u32 = 5;

/// Everything a handler works on during one reconcile
#[derive(Debug, Clone)]
pub struct OpsResource {
    pub ops: OpsRequest,
    pub cluster: Cluster,
    pub behaviour: OpsBehaviour,
    /// Working copy of the request status; persisted by the manager
    pub status: OpsRequestStatus,
    /// Ledger events to publish after the status is written
    pub events: Vec<ProgressEvent>,
    pub now: DateTime<Utc>,
}

impl OpsResource {
    pub fn new(ops: OpsRequest, cluster: Cluster, behaviour: OpsBehaviour, now: DateTime<Utc>) -> Self {
        let status = ops.status.clone().unwrap_or_default();
        Self {
            ops,
            cluster,
            behaviour,
            status,
            events: Vec::new(),
            now,
        }
    }

    pub fn namespace(&self) -> String {
        self.ops.namespace().unwrap_or_default()
    }

    pub fn name(&self) -> String {
        self.ops.name_any()
    }

    /// When the operation started; falls back to creation, then to now
    pub fn start_time(&self) -> DateTime<Utc> {
        self.status
            .start_timestamp
            .as_deref()
            .and_then(parse_time)
            .or_else(|| self.ops.metadata.creation_timestamp.as_ref().map(from_k8s_time))
            .unwrap_or(self.now)
    }

    /// The cluster controller has reconciled the mutation
    pub fn processed(&self) -> bool {
        ops_processed(
            &self.cluster,
            self.behaviour.to_cluster_phase,
            self.status.cluster_generation,
        )
    }

    pub fn component_status_mut(&mut self, component: &str) -> &mut OpsRequestComponentStatus {
        self.status
            .components
            .entry(component.to_string())
            .or_default()
    }
}

/// Build the pod rules of one resolved component
#[allow(clippy::too_many_arguments)]
pub fn pod_rules<'a>(
    cluster: &'a Cluster,
    component: &'a str,
    group: Option<&'a str>,
    verb: &'a str,
    min_ready_seconds: i32,
    ops_start: DateTime<Utc>,
    processed: bool,
    now: DateTime<Utc>,
) -> PodRules<'a> {
    PodRules {
        cluster,
        component,
        group,
        verb,
        min_ready_seconds,
        ops_start,
        processed,
        now,
    }
}

/// Result of one progress check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub summary: ProgressSummary,
    /// Recheck after this long while not complete
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub fn new(summary: ProgressSummary, requeue_after: Duration) -> Self {
        Self {
            summary,
            requeue_after: Some(requeue_after),
        }
    }
}

pub async fn validate(kind: OpsKind, ctx: &Context, res: &mut OpsResource) -> Result<()> {
    match kind {
        OpsKind::HorizontalScaling => horizontal_scaling::validate(res),
        OpsKind::Restart => restart::validate(res),
        OpsKind::VolumeExpansion => volume_expansion::validate(res),
        OpsKind::Switchover => switchover::validate(res),
        OpsKind::RebuildInstance => rebuild_instance::validate(ctx, res).await,
        OpsKind::Reconfiguring => reconfigure::validate(res),
        OpsKind::Expose => expose::validate(res),
        OpsKind::Custom => custom::validate(ctx, res).await,
    }
}

/// Snapshot what the operation is about to change, once
pub fn save_last_configuration(kind: OpsKind, res: &mut OpsResource) {
    if !res.status.last_configuration.components.is_empty() {
        return;
    }
    match kind {
        OpsKind::HorizontalScaling => horizontal_scaling::save_last_configuration(res),
        OpsKind::VolumeExpansion => volume_expansion::save_last_configuration(res),
        OpsKind::RebuildInstance => rebuild_instance::save_last_configuration(res),
        OpsKind::Expose => expose::save_last_configuration(res),
        OpsKind::Restart | OpsKind::Switchover | OpsKind::Reconfiguring | OpsKind::Custom => {}
    }
}

pub async fn action(kind: OpsKind, ctx: &Context, res: &mut OpsResource) -> Result<()> {
    match kind {
        OpsKind::HorizontalScaling => horizontal_scaling::action(ctx, res).await,
        OpsKind::Restart => restart::action(ctx, res).await,
        OpsKind::VolumeExpansion => volume_expansion::action(ctx, res).await,
        OpsKind::Switchover => switchover::action(ctx, res).await,
        OpsKind::RebuildInstance => rebuild_instance::action(ctx, res).await,
        OpsKind::Reconfiguring => reconfigure::action(ctx, res).await,
        OpsKind::Expose => expose::action(ctx, res).await,
        OpsKind::Custom => custom::action(ctx, res).await,
    }
}

/// Whether `action` left work for the cluster controller
pub fn mutated_cluster(kind: OpsKind, res: &OpsResource) -> bool {
    match kind {
        OpsKind::Switchover => !switchover::all_skipped(res),
        _ => true,
    }
}

pub async fn reconcile_action(
    kind: OpsKind,
    ctx: &Context,
    res: &mut OpsResource,
) -> Result<ReconcileOutcome> {
    match kind {
        OpsKind::HorizontalScaling => horizontal_scaling::reconcile_action(ctx, res).await,
        OpsKind::Restart => restart::reconcile_action(ctx, res).await,
        OpsKind::VolumeExpansion => volume_expansion::reconcile_action(ctx, res).await,
        OpsKind::Switchover => switchover::reconcile_action(ctx, res).await,
        OpsKind::RebuildInstance => rebuild_instance::reconcile_action(ctx, res).await,
        OpsKind::Reconfiguring => reconfigure::reconcile_action(ctx, res).await,
        OpsKind::Expose => expose::reconcile_action(ctx, res).await,
        OpsKind::Custom => custom::reconcile_action(ctx, res).await,
    }
}

pub async fn cancel(kind: OpsKind, ctx: &Context, res: &mut OpsResource) -> Result<()> {
    match kind {
        OpsKind::HorizontalScaling => horizontal_scaling::cancel(ctx, res).await,
        other => Err(Error::fatal(format!(
            "cancel is not supported for {}",
            other.ops_type()
        ))),
    }
}

/// Read-modify-replace the cluster with optimistic concurrency.
///
/// `mutate` may run several times; the replaced object is stored back in
/// `res.cluster`.
pub async fn update_cluster<F>(ctx: &Context, res: &mut OpsResource, mut mutate: F) -> Result<()>
where
    F: FnMut(&mut Cluster) -> Result<()>,
{
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &res.namespace());
    let name = res.cluster.name_any();
    for attempt in 0..MAX_CLUSTER_UPDATE_ATTEMPTS {
        let mut cluster = api.get(&name).await?;
        let before = cluster.spec.clone();
        mutate(&mut cluster)?;
        if cluster.spec == before {
            res.cluster = cluster;
            return Ok(());
        }
        match api.replace(&name, &PostParams::default(), &cluster).await {
            Ok(updated) => {
                res.cluster = updated;
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(cluster = %name, attempt, "cluster changed concurrently, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Transient(format!("cluster {} kept changing", name)))
}

/// Patch the cluster status phase
pub async fn patch_cluster_phase(ctx: &Context, res: &mut OpsResource, phase: ClusterPhase) -> Result<()> {
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &res.namespace());
    let patch = serde_json::json!({
        "status": { "phase": phase }
    });
    res.cluster = api
        .patch_status(
            &res.cluster.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}

/// Fail with a fatal error naming a component missing from the cluster
pub fn component_not_found(cluster: &Cluster, component: &str) -> Error {
    Error::ValidationError(format!(
        "component {} not found in cluster {}",
        component,
        cluster.name_any()
    ))
}
