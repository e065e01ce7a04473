//! Reconfiguring: patch a component's configuration file, restarting it when needed

pub mod diff;
pub mod pipeline;

use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::info;

use crate::controller::Context;
use crate::controller::aggregator::ProgressSummary;
use crate::controller::error::{Error, Result};
use crate::controller::progress::{detail, object_key, set_progress_detail};
use crate::crd::{ConfigConstraint, ProgressStatus, Reconfigure, annotations, format_time};
use crate::handlers::restart::{stamp_restart, track_pods};
use crate::handlers::{OpsResource, ReconcileOutcome, component_not_found};
use crate::resources::FIELD_MANAGER;

use pipeline::{ReconfigureInput, plan};

const REQUEUE: Duration = Duration::from_secs(5);
const CONFIG_MAP_KIND: &str = "ConfigMap";

pub fn validate(res: &mut OpsResource) -> Result<()> {
    for r in &res.ops.spec.reconfigures {
        let spec = res
            .cluster
            .component_spec(&r.component_name)
            .ok_or_else(|| component_not_found(&res.cluster, &r.component_name))?;
        if spec.config.is_none() {
            return Err(Error::ValidationError(format!(
                "component {} has no configuration to reconfigure",
                r.component_name
            )));
        }
        if r.parameters.is_empty() {
            return Err(Error::ValidationError(format!(
                "parameters of component {} can not be empty",
                r.component_name
            )));
        }
    }
    Ok(())
}

/// Apply one component's change; returns whether it needs a restart
async fn apply(ctx: &Context, res: &OpsResource, r: &Reconfigure) -> Result<(String, bool)> {
    let ops_name = res.name();
    let config = res
        .cluster
        .component_spec(&r.component_name)
        .and_then(|s| s.config.clone())
        .ok_or_else(|| Error::fatal(format!("component {} has no configuration", r.component_name)))?;
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &res.namespace());
    let cm = config_maps
        .get_opt(&config.config_map_name)
        .await?
        .ok_or_else(|| Error::fatal(format!("ConfigMap {} not found", config.config_map_name)))?;

    // Already synced by this request before a restart of the operator
    if cm.annotations().get(annotations::LAST_APPLIED_OPS) == Some(&ops_name) {
        let restart = cm
            .annotations()
            .get(annotations::RESTART_REQUIRED)
            .is_some_and(|v| v == "true");
        return Ok((config.config_map_name, restart));
    }

    let constraints: Api<ConfigConstraint> = Api::all(ctx.client.clone());
    let constraint = constraints
        .get_opt(&config.constraint_name)
        .await?
        .map(|c| c.spec);
    let file_name = r.config_file.clone().unwrap_or(config.file_name);
    let current = cm.data.as_ref().and_then(|d| d.get(&file_name)).cloned();

    let plan = plan(ReconfigureInput {
        ops_name: ops_name.clone(),
        component: r.component_name.clone(),
        config_map: config.config_map_name.clone(),
        file_name: file_name.clone(),
        current,
        constraint,
        parameters: r.parameters.clone(),
    })?;

    if let Some(content) = &plan.content {
        let patch = serde_json::json!({
            "metadata": { "annotations": plan.annotations },
            "data": { (file_name.as_str()): content }
        });
        config_maps
            .patch(
                &config.config_map_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        info!(
            configmap = %config.config_map_name,
            restart = plan.restart_required,
            changed = plan.diff.changed_keys().count(),
            "Configuration synced"
        );
    }
    Ok((config.config_map_name, plan.restart_required))
}

pub async fn action(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    let mut restart = Vec::new();
    for r in res.ops.spec.reconfigures.clone() {
        let (config_map, restart_required) = apply(ctx, res, &r).await?;
        let key = object_key(CONFIG_MAP_KIND, &config_map);
        let now = res.now;
        let status = res.component_status_mut(&r.component_name);
        status.restart_required = Some(restart_required);
        let event = set_progress_detail(
            &mut status.progress_details,
            detail(
                key,
                ProgressStatus::Succeed,
                format!("Successfully merged the configuration of component {}", r.component_name),
            ),
            now,
        );
        res.events.extend(event);
        if restart_required {
            restart.push(r.component_name.clone());
        }
    }
    if !restart.is_empty() {
        let stamp = format_time(res.start_time());
        stamp_restart(ctx, res, &restart, &stamp).await?;
    }
    Ok(())
}

pub async fn reconcile_action(ctx: &Context, res: &mut OpsResource) -> Result<ReconcileOutcome> {
    let mut summary = ProgressSummary::default();
    let mut restart = Vec::new();
    for r in &res.ops.spec.reconfigures {
        let status = res.status.components.get(&r.component_name);
        if status.and_then(|s| s.restart_required) == Some(true) {
            restart.push(r.component_name.clone());
            continue;
        }
        // Online changes are done once the ConfigMap is synced
        let synced = status.is_some_and(|s| {
            s.progress_details
                .iter()
                .any(|d| d.object_key.starts_with(CONFIG_MAP_KIND) && d.status == ProgressStatus::Succeed)
        });
        let done = i32::from(synced);
        summary.merge(ProgressSummary::new(1, done, done));
    }
    if !restart.is_empty() {
        summary.merge(track_pods(ctx, res, &restart).await?);
    }
    Ok(ReconcileOutcome::new(summary, REQUEUE))
}
