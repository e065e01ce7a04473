//! HorizontalScaling: change the replica count and offline instances of components

use std::collections::BTreeSet;
use std::time::Duration;

use kube::ResourceExt;

use crate::controller::Context;
use crate::controller::aggregator::{
    ProgressSummary, ScalingSets, generate_pod_names, resolve_components, scaling_progress,
};
use crate::controller::error::{Error, Result};
use crate::crd::{
    Cluster, ClusterComponentSpec, ClusterPhase, HorizontalScaling, LastComponentConfiguration,
};
use crate::handlers::{OpsResource, ReconcileOutcome, component_not_found, pod_rules, update_cluster};
use crate::resources::pod::list_component_pods;

const REQUEUE: Duration = Duration::from_secs(5);

/// Replica count a scaling request asks for
pub fn target_replicas(current: i32, hs: &HorizontalScaling) -> Result<i32> {
    let target = match hs.replicas {
        Some(replicas) => replicas,
        None => {
            let scale_in = hs.scale_in.unwrap_or_else(|| {
                i32::try_from(hs.online_instances_to_offline.len()).unwrap_or(i32::MAX)
            });
            current + hs.scale_out.unwrap_or(0) - scale_in
        }
    };
    if target < 0 {
        return Err(Error::ValidationError(format!(
            "the replicas of component {} can not be negative",
            hs.component_name
        )));
    }
    Ok(target)
}

/// Apply one scaling request to a component spec
pub fn apply_scaling(spec: &mut ClusterComponentSpec, hs: &HorizontalScaling) -> Result<()> {
    spec.replicas = target_replicas(spec.replicas, hs)?;
    for instance in &hs.online_instances_to_offline {
        if !spec.offline_instances.contains(instance) {
            spec.offline_instances.push(instance.clone());
        }
    }
    Ok(())
}

/// Pod names of a component spec
fn pod_names(cluster: &Cluster, component: &str, spec: &ClusterComponentSpec) -> BTreeSet<String> {
    generate_pod_names(
        &cluster.name_any(),
        component,
        spec.replicas,
        &spec.offline_instances,
    )
}

pub fn validate(res: &mut OpsResource) -> Result<()> {
    let cluster = &res.cluster;
    for hs in &res.ops.spec.horizontal_scaling {
        let spec = cluster
            .component_spec(&hs.component_name)
            .ok_or_else(|| component_not_found(cluster, &hs.component_name))?;
        target_replicas(spec.replicas, hs)?;

        let online = pod_names(cluster, &hs.component_name, spec);
        for instance in &hs.online_instances_to_offline {
            if !online.contains(instance) {
                return Err(Error::ValidationError(format!(
                    "instance {} of component {} is not online",
                    instance, hs.component_name
                )));
            }
        }
    }
    Ok(())
}

pub fn save_last_configuration(res: &mut OpsResource) {
    for hs in &res.ops.spec.horizontal_scaling {
        let Some(spec) = res.cluster.component_spec(&hs.component_name) else {
            continue;
        };
        let pod_names = if res.cluster.sharding(&hs.component_name).is_some() {
            Vec::new()
        } else {
            pod_names(&res.cluster, &hs.component_name, spec)
                .into_iter()
                .collect()
        };
        res.status.last_configuration.components.insert(
            hs.component_name.clone(),
            LastComponentConfiguration {
                replicas: Some(spec.replicas),
                offline_instances: spec.offline_instances.clone(),
                pod_names,
                ..Default::default()
            },
        );
    }
}

pub async fn action(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    if matches!(
        res.cluster.phase(),
        ClusterPhase::Stopped | ClusterPhase::Stopping
    ) {
        return Err(Error::fatal(
            "please start the cluster before scaling the cluster horizontally",
        ));
    }
    let requests = res.ops.spec.horizontal_scaling.clone();
    update_cluster(ctx, res, |cluster| {
        for hs in &requests {
            let name = cluster.name_any();
            let spec = cluster
                .component_spec_mut(&hs.component_name)
                .ok_or_else(|| Error::fatal(format!(
                    "component {} not found in cluster {}",
                    hs.component_name, name
                )))?;
            apply_scaling(spec, hs)?;
        }
        Ok(())
    })
    .await
}

pub async fn reconcile_action(ctx: &Context, res: &mut OpsResource) -> Result<ReconcileOutcome> {
    let ns = res.namespace();
    let start = res.start_time();
    let processed = res.processed();
    let mut total = ProgressSummary::default();

    for hs in res.ops.spec.horizontal_scaling.clone() {
        let target = hs.component_name.as_str();
        let Some(spec) = res.cluster.component_spec(target).cloned() else {
            return Err(component_not_found(&res.cluster, target));
        };
        let last = res
            .status
            .last_configuration
            .components
            .get(target)
            .cloned()
            .unwrap_or_default();
        let before_spec = ClusterComponentSpec {
            replicas: last.replicas.unwrap_or(spec.replicas),
            offline_instances: last.offline_instances.clone(),
            ..spec.clone()
        };

        for resolved in resolve_components(&res.cluster, target) {
            let before = pod_names(&res.cluster, &resolved.name, &before_spec);
            let after = pod_names(&res.cluster, &resolved.name, &spec);
            let sets = ScalingSets::between(&before, &after);
            let pods =
                list_component_pods(&ctx.client, &ns, &res.cluster.name_any(), &resolved.name)
                    .await?;

            let rules = pod_rules(
                &res.cluster,
                &resolved.name,
                resolved.group.as_deref(),
                "scale",
                spec.min_ready_seconds,
                start,
                processed,
                res.now,
            );
            let ledger = &mut res
                .status
                .components
                .entry(target.to_string())
                .or_default()
                .progress_details;
            let summary =
                scaling_progress(&rules, spec.replicas, &pods, &sets, ledger, &mut res.events)?;
            total.merge(summary);
        }
    }
    Ok(ReconcileOutcome::new(total, REQUEUE))
}

/// Restore the replicas and offline instances saved before the operation
pub async fn cancel(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    let last = res.status.last_configuration.clone();
    update_cluster(ctx, res, |cluster| {
        for (component, saved) in &last.components {
            if let Some(spec) = cluster.component_spec_mut(component) {
                if let Some(replicas) = saved.replicas {
                    spec.replicas = replicas;
                }
                spec.offline_instances = saved.offline_instances.clone();
            }
        }
        Ok(())
    })
    .await
}
