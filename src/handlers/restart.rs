//! Restart: roll every pod of the targeted components

use std::time::Duration;

use kube::ResourceExt;

use crate::controller::Context;
use crate::controller::aggregator::{ProgressSummary, pods_progress, resolve_components};
use crate::controller::error::{Error, Result};
use crate::crd::format_time;
use crate::handlers::{OpsResource, ReconcileOutcome, component_not_found, pod_rules, update_cluster};
use crate::resources::pod::list_component_pods;

const REQUEUE: Duration = Duration::from_secs(5);

pub fn validate(res: &mut OpsResource) -> Result<()> {
    for r in &res.ops.spec.restart {
        if res.cluster.component_spec(&r.component_name).is_none() {
            return Err(component_not_found(&res.cluster, &r.component_name));
        }
    }
    Ok(())
}

/// Stamp `restartedAt` on the targeted components
pub async fn action(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    let components: Vec<String> = res
        .ops
        .spec
        .restart
        .iter()
        .map(|r| r.component_name.clone())
        .collect();
    let stamp = format_time(res.start_time());
    stamp_restart(ctx, res, &components, &stamp).await
}

/// Set `restartedAt` on `components`; shared with reconfigure
pub async fn stamp_restart(
    ctx: &Context,
    res: &mut OpsResource,
    components: &[String],
    stamp: &str,
) -> Result<()> {
    update_cluster(ctx, res, |cluster| {
        for component in components {
            let name = cluster.name_any();
            let spec = cluster.component_spec_mut(component).ok_or_else(|| {
                Error::fatal(format!("component {} not found in cluster {}", component, name))
            })?;
            spec.restarted_at = Some(stamp.to_string());
        }
        Ok(())
    })
    .await
}

/// Track every pod of `components` with the restart rules
pub async fn track_pods(
    ctx: &Context,
    res: &mut OpsResource,
    components: &[String],
) -> Result<ProgressSummary> {
    let ns = res.namespace();
    let start = res.start_time();
    let processed = res.processed();
    let mut total = ProgressSummary::default();

    for target in components {
        let Some(spec) = res.cluster.component_spec(target).cloned() else {
            return Err(component_not_found(&res.cluster, target));
        };
        for resolved in resolve_components(&res.cluster, target) {
            let pods =
                list_component_pods(&ctx.client, &ns, &res.cluster.name_any(), &resolved.name)
                    .await?;
            let rules = pod_rules(
                &res.cluster,
                &resolved.name,
                resolved.group.as_deref(),
                "restart",
                spec.min_ready_seconds,
                start,
                processed,
                res.now,
            );
            let ledger = &mut res
                .status
                .components
                .entry(target.clone())
                .or_default()
                .progress_details;
            total.merge(pods_progress(
                &rules,
                spec.replicas,
                &pods,
                ledger,
                &mut res.events,
            )?);
        }
    }
    Ok(total)
}

pub async fn reconcile_action(ctx: &Context, res: &mut OpsResource) -> Result<ReconcileOutcome> {
    let components: Vec<String> = res
        .ops
        .spec
        .restart
        .iter()
        .map(|r| r.component_name.clone())
        .collect();
    let summary = track_pods(ctx, res, &components).await?;
    Ok(ReconcileOutcome::new(summary, REQUEUE))
}
