//! Custom: run the actions of an OpsDefinition as Jobs, in order, per component

pub mod parameters;
pub mod precondition;

use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use kube::{Api, ResourceExt};
use tracing::info;

use crate::controller::Context;
use crate::controller::aggregator::ProgressSummary;
use crate::controller::error::{Error, Result};
use crate::controller::progress::{find_progress_detail, object_key, set_progress_detail};
use crate::crd::{
    CustomOps, FailurePolicy, OpsAction, OpsDefinition, ProgressStatus, ProgressStatusDetail, labels,
};
use crate::handlers::{OpsResource, ReconcileOutcome, component_not_found};
use crate::resources::common::{component_ops_labels, create_if_absent, cut, owner_reference};
use crate::resources::job::{ActionJob, JobState, job_state};

use parameters::{resolve_parameters, validate_parameters};
use precondition::Facts;

const REQUEUE: Duration = Duration::from_secs(5);
const JOB_KIND: &str = "Job";
pub const ENV_CLUSTER_NAME: &str = "KB_CLUSTER_NAME";
pub const ENV_COMP_NAME: &str = "KB_COMP_NAME";

/// Where a component stands in its action list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    /// Action `i` has no record yet
    Start(usize),
    /// Action `i` is running
    Poll(usize),
    /// Action `failed` failed with the Fail policy; the rest will never run
    Abort { failed: usize },
    Finished,
}

/// Next step of a component given the ledger status of each action
pub fn sequence(actions: &[OpsAction], statuses: &[Option<ProgressStatus>]) -> Sequence {
    for (i, action) in actions.iter().enumerate() {
        match statuses.get(i).copied().flatten() {
            Some(ProgressStatus::Succeed) => {}
            Some(ProgressStatus::Failed) if action.failure_policy == FailurePolicy::Ignore => {}
            Some(ProgressStatus::Failed) => return Sequence::Abort { failed: i },
            Some(_) => return Sequence::Poll(i),
            None => return Sequence::Start(i),
        }
    }
    Sequence::Finished
}

pub fn job_name(ops_name: &str, component: &str, action: &str, idx: usize) -> String {
    format!(
        "{}-{}-{}-{}",
        cut(ops_name, 20),
        cut(component, 15),
        cut(action, 15),
        idx
    )
}

fn action_detail(key: &str, action: &str, status: ProgressStatus, message: String) -> ProgressStatusDetail {
    ProgressStatusDetail {
        object_key: key.to_string(),
        action_name: Some(action.to_string()),
        status,
        message,
        ..Default::default()
    }
}

fn custom_spec(res: &OpsResource) -> Result<CustomOps> {
    res.ops
        .spec
        .custom
        .clone()
        .ok_or_else(|| Error::ValidationError("spec.custom can not be empty".to_string()))
}

async fn ops_definition(ctx: &Context, name: &str) -> Result<OpsDefinition> {
    let api: Api<OpsDefinition> = Api::all(ctx.client.clone());
    api.get_opt(name)
        .await?
        .ok_or_else(|| Error::ValidationError(format!("OpsDefinition {} not found", name)))
}

pub async fn validate(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    let custom = custom_spec(res)?;
    let def = ops_definition(ctx, &custom.ops_definition_name).await?;
    if def.spec.actions.is_empty() {
        return Err(Error::ValidationError(format!(
            "OpsDefinition {} has no actions",
            custom.ops_definition_name
        )));
    }

    for comp in &custom.components {
        let spec = res
            .cluster
            .component_spec(&comp.component_name)
            .cloned()
            .ok_or_else(|| component_not_found(&res.cluster, &comp.component_name))?;
        let allowed = &def.spec.component_definition_names;
        if !allowed.is_empty()
            && !spec
                .component_def
                .as_ref()
                .is_some_and(|d| allowed.contains(d))
        {
            return Err(Error::ValidationError(format!(
                "OpsDefinition {} does not support component {}",
                custom.ops_definition_name, comp.component_name
            )));
        }

        let facts = Facts {
            cluster_phase: res.cluster.phase().to_string(),
            component_phase: res
                .cluster
                .component_status(&comp.component_name)
                .map(|s| s.phase.to_string())
                .unwrap_or_default(),
            component_replicas: spec.replicas,
            component_name: comp.component_name.clone(),
        };
        let result = precondition::check(&def.spec.pre_conditions, &facts)?;
        let passed = result.pass;
        let message = result.message.clone();
        res.component_status_mut(&comp.component_name).pre_check = Some(result);
        if !passed {
            return Err(Error::fatal(format!(
                "pre-check failed for component {}: {}",
                comp.component_name,
                message.unwrap_or_default()
            )));
        }

        let values = resolve_parameters(&ctx.client, &res.namespace(), &comp.parameters).await?;
        validate_parameters(def.spec.parameters_schema.as_ref(), &values)?;
    }
    Ok(())
}

pub async fn action(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    advance(ctx, res).await.map(|_| ())
}

pub async fn reconcile_action(ctx: &Context, res: &mut OpsResource) -> Result<ReconcileOutcome> {
    let summary = advance(ctx, res).await?;
    Ok(ReconcileOutcome::new(summary, REQUEUE))
}

fn statuses(
    res: &OpsResource,
    component: &str,
    keys: &[(String, &OpsAction)],
) -> Vec<Option<ProgressStatus>> {
    let ledger = res
        .status
        .components
        .get(component)
        .map(|s| s.progress_details.as_slice())
        .unwrap_or_default();
    keys.iter()
        .map(|(key, action)| find_progress_detail(ledger, key, Some(&action.name)).map(|d| d.status))
        .collect()
}

fn record(res: &mut OpsResource, component: &str, new: ProgressStatusDetail) {
    let now = res.now;
    let ledger = &mut res.component_status_mut(component).progress_details;
    let event = set_progress_detail(ledger, new, now);
    res.events.extend(event);
}

/// Drive every component's action list as far as it goes without waiting
async fn advance(ctx: &Context, res: &mut OpsResource) -> Result<ProgressSummary> {
    let custom = custom_spec(res)?;
    let def = ops_definition(ctx, &custom.ops_definition_name).await?;
    let ns = res.namespace();
    let ops_name = res.name();
    let cluster_name = res.cluster.name_any();
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    let mut summary = ProgressSummary::default();

    for comp in &custom.components {
        let component = comp.component_name.as_str();
        let keys: Vec<(String, &OpsAction)> = def
            .spec
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| (object_key(JOB_KIND, &job_name(&ops_name, component, &a.name, i)), a))
            .collect();

        // Each pass either waits or records a terminal status, so this is bounded
        for _ in 0..=keys.len() {
            match sequence(&def.spec.actions, &statuses(res, component, &keys)) {
                Sequence::Finished => break,
                Sequence::Abort { failed } => {
                    let failed_name = keys.get(failed).map(|(_, a)| a.name.clone()).unwrap_or_default();
                    for (key, action) in keys.iter().skip(failed + 1) {
                        record(
                            res,
                            component,
                            action_detail(
                                key,
                                &action.name,
                                ProgressStatus::Failed,
                                format!("Skipped because action {} failed", failed_name),
                            ),
                        );
                    }
                    break;
                }
                Sequence::Start(i) | Sequence::Poll(i) => {
                    let Some((key, action)) = keys.get(i) else {
                        break;
                    };
                    let name = job_name(&ops_name, component, &action.name, i);
                    match jobs.get_opt(&name).await? {
                        None => {
                            let values =
                                resolve_parameters(&ctx.client, &ns, &comp.parameters).await?;
                            let mut env: Vec<(String, String)> = values.into_iter().collect();
                            env.push((ENV_CLUSTER_NAME.to_string(), cluster_name.clone()));
                            env.push((ENV_COMP_NAME.to_string(), component.to_string()));
                            let mut job_labels = component_ops_labels(&res.ops, component);
                            job_labels.insert(labels::ACTION_NAME.to_string(), action.name.clone());
                            let job = ActionJob {
                                name: name.clone(),
                                namespace: ns.clone(),
                                labels: job_labels,
                                owner: Some(owner_reference(&res.ops)),
                                image: action.image.clone(),
                                command: action.command.clone(),
                                env,
                            }
                            .build();
                            create_if_absent(&jobs, &job).await?;
                            info!(job = %name, action = %action.name, component, "Started custom action");
                            record(
                                res,
                                component,
                                action_detail(
                                    key,
                                    &action.name,
                                    ProgressStatus::Processing,
                                    format!("Start to run action {} in Component: {}", action.name, component),
                                ),
                            );
                            break;
                        }
                        Some(job) => match job_state(&job) {
                            JobState::Running => {
                                if matches!(statuses(res, component, &keys).get(i), Some(None)) {
                                    record(
                                        res,
                                        component,
                                        action_detail(
                                            key,
                                            &action.name,
                                            ProgressStatus::Processing,
                                            format!("Action {} is running", action.name),
                                        ),
                                    );
                                }
                                break;
                            }
                            JobState::Succeeded => record(
                                res,
                                component,
                                action_detail(
                                    key,
                                    &action.name,
                                    ProgressStatus::Succeed,
                                    format!("Successfully run action {} in Component: {}", action.name, component),
                                ),
                            ),
                            JobState::Failed(msg) => record(
                                res,
                                component,
                                action_detail(
                                    key,
                                    &action.name,
                                    ProgressStatus::Failed,
                                    format!("Action {} failed: {}", action.name, msg),
                                ),
                            ),
                        },
                    }
                }
            }
        }

        let expected = i32::try_from(keys.len()).unwrap_or(i32::MAX);
        let mut component_summary = ProgressSummary::new(expected, 0, 0);
        for status in statuses(res, component, &keys).into_iter().flatten() {
            match status {
                ProgressStatus::Succeed => {
                    component_summary.completed += 1;
                    component_summary.succeeded += 1;
                }
                ProgressStatus::Failed => component_summary.completed += 1,
                _ => {}
            }
        }
        summary.merge(component_summary);
    }
    Ok(summary)
}
