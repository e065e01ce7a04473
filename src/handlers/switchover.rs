//! Switchover: move the writable role of a component to a candidate instance

use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, ResourceExt};
use tracing::info;

use crate::controller::Context;
use crate::controller::aggregator::ProgressSummary;
use crate::controller::error::{Error, Result};
use crate::controller::progress::{ProgressEvent, detail, object_key, set_progress_detail};
use crate::controller::status::reasons;
use crate::crd::{ProgressStatus, ReplicaRole, Switchover};
use crate::handlers::{OpsResource, ReconcileOutcome, component_not_found};
use crate::resources::common::{component_ops_labels, create_if_absent, cut, owner_reference};
use crate::resources::job::{ActionJob, JobState, job_state};
use crate::resources::pod::{list_component_pods, writable_pods};

const REQUEUE: Duration = Duration::from_secs(1);
const JOB_KIND: &str = "Job";

/// Candidate value that accepts any other instance
pub const ANY_CANDIDATE: &str = "*";
pub const ENV_CANDIDATE: &str = "KB_SWITCHOVER_CANDIDATE";
pub const ENV_CURRENT: &str = "KB_SWITCHOVER_CURRENT";

/// What a switchover has to do for one component
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precheck {
    /// The candidate already holds the writable role
    Skip,
    /// Move the role away from `current`
    Switch { current: String },
}

/// Name of the single pod holding a serviceable and writable role
pub fn current_writable(component: &str, pods: &[Pod], roles: &[ReplicaRole]) -> Result<String> {
    let writable = writable_pods(pods, roles);
    match writable.as_slice() {
        [pod] => Ok(pod.name_any()),
        other => Err(Error::fatal(format!(
            "component {} has {} writable instances, expected exactly one",
            component,
            other.len()
        ))),
    }
}

pub fn precheck(
    component: &str,
    candidate: &str,
    pods: &[Pod],
    roles: &[ReplicaRole],
) -> Result<Precheck> {
    let current = current_writable(component, pods, roles)?;
    if candidate == current {
        return Ok(Precheck::Skip);
    }
    Ok(Precheck::Switch { current })
}

/// The role moved to the candidate (or, for `*`, away from `previous`).
///
/// Zero writable pods means the role labels are still being updated. More
/// than one after the action finished can not settle by waiting and fails.
pub fn role_converged(
    component: &str,
    pods: &[Pod],
    roles: &[ReplicaRole],
    candidate: &str,
    previous: &str,
) -> Result<bool> {
    match writable_pods(pods, roles).as_slice() {
        [] => Ok(false),
        [pod] if candidate == ANY_CANDIDATE => Ok(pod.name_any() != previous),
        [pod] => Ok(pod.name_any() == candidate),
        many => Err(Error::fatal(format!(
            "component {} has {} writable instances after switchover: {}",
            component,
            many.len(),
            many.iter().map(|p| p.name_any()).collect::<Vec<_>>().join(",")
        ))),
    }
}

pub fn skip_message(component: &str) -> String {
    format!(
        "This component {} is already in the expected state, skip the switchover operation",
        component
    )
}

fn is_skipped(res: &OpsResource, component: &str) -> bool {
    res.status
        .components
        .get(component)
        .and_then(|s| s.reason.as_deref())
        == Some(reasons::SKIP_SWITCHOVER)
}

/// No component needed a Job, so the cluster is left untouched
pub fn all_skipped(res: &OpsResource) -> bool {
    !res.ops.spec.switchover.is_empty()
        && res
            .ops
            .spec
            .switchover
            .iter()
            .all(|so| is_skipped(res, &so.component_name))
}

fn job_name(ops_name: &str, component: &str) -> String {
    format!("{}-switchover-{}", cut(ops_name, 30), cut(component, 20))
}

/// Read an env value of the action container
fn job_env<'a>(job: &'a Job, name: &str) -> Option<&'a str> {
    job.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.containers.first())
        .and_then(|c| c.env.as_ref())
        .and_then(|env| env.iter().find(|e| e.name == name))
        .and_then(|e| e.value.as_deref())
}

pub fn validate(res: &mut OpsResource) -> Result<()> {
    for so in &res.ops.spec.switchover {
        let spec = res
            .cluster
            .component_spec(&so.component_name)
            .ok_or_else(|| component_not_found(&res.cluster, &so.component_name))?;
        if spec.switchover.is_none() {
            return Err(Error::ValidationError(format!(
                "component {} does not define a switchover action",
                so.component_name
            )));
        }
        if so.instance_name.is_empty() {
            return Err(Error::ValidationError(format!(
                "instanceName of component {} can not be empty",
                so.component_name
            )));
        }
    }
    Ok(())
}

/// Mark a component skipped: a succeeded ledger record and the skip reason
pub fn mark_skipped(
    res: &mut OpsResource,
    so: &Switchover,
    key: &str,
) -> ProgressEvent {
    let msg = skip_message(&so.component_name);
    let now = res.now;
    let status = res.component_status_mut(&so.component_name);
    status.reason = Some(reasons::SKIP_SWITCHOVER.to_string());
    status.message = Some(msg.clone());
    set_progress_detail(
        &mut status.progress_details,
        detail(key, ProgressStatus::Succeed, msg.clone()),
        now,
    );
    ProgressEvent {
        warning: false,
        reason: reasons::SKIP_SWITCHOVER,
        message: msg,
    }
}

pub async fn action(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    let ns = res.namespace();
    let cluster_name = res.cluster.name_any();
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);

    for so in res.ops.spec.switchover.clone() {
        let spec = res
            .cluster
            .component_spec(&so.component_name)
            .cloned()
            .ok_or_else(|| component_not_found(&res.cluster, &so.component_name))?;
        let Some(switch_action) = spec.switchover.clone() else {
            return Err(Error::fatal(format!(
                "component {} does not define a switchover action",
                so.component_name
            )));
        };

        let pods = list_component_pods(&ctx.client, &ns, &cluster_name, &so.component_name).await?;
        let name = job_name(&res.name(), &so.component_name);
        let key = object_key(JOB_KIND, &name);

        match precheck(&so.component_name, &so.instance_name, &pods, &spec.roles)? {
            Precheck::Skip => {
                info!(component = %so.component_name, "Switchover candidate already writable, skipping");
                let event = mark_skipped(res, &so, &key);
                res.events.push(event);
            }
            Precheck::Switch { current } => {
                let job = ActionJob {
                    name: name.clone(),
                    namespace: ns.clone(),
                    labels: component_ops_labels(&res.ops, &so.component_name),
                    owner: Some(owner_reference(&res.ops)),
                    image: switch_action.image.clone(),
                    command: switch_action.command.clone(),
                    env: vec![
                        (ENV_CANDIDATE.to_string(), so.instance_name.clone()),
                        (ENV_CURRENT.to_string(), current),
                    ],
                }
                .build();
                create_if_absent(&jobs, &job).await?;
                let now = res.now;
                let ledger = &mut res.component_status_mut(&so.component_name).progress_details;
                let event = set_progress_detail(
                    ledger,
                    detail(
                        &key,
                        ProgressStatus::Processing,
                        format!("Start to switchover component {}", so.component_name),
                    ),
                    now,
                );
                res.events.extend(event);
            }
        }
    }
    Ok(())
}

pub async fn reconcile_action(ctx: &Context, res: &mut OpsResource) -> Result<ReconcileOutcome> {
    let ns = res.namespace();
    let cluster_name = res.cluster.name_any();
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    let mut summary = ProgressSummary::default();

    for so in res.ops.spec.switchover.clone() {
        summary.expected += 1;
        let name = job_name(&res.name(), &so.component_name);
        let key = object_key(JOB_KIND, &name);
        let new = if is_skipped(res, &so.component_name) {
            None
        } else {
            match jobs.get_opt(&name).await? {
                None => Some(detail(
                    &key,
                    ProgressStatus::Failed,
                    format!("switchover job {} not found", name),
                )),
                Some(job) => match job_state(&job) {
                    JobState::Running => None,
                    JobState::Failed(msg) => Some(detail(
                        &key,
                        ProgressStatus::Failed,
                        format!("switchover job failed: {}", msg),
                    )),
                    JobState::Succeeded => {
                        let roles = res
                            .cluster
                            .component_spec(&so.component_name)
                            .map(|s| s.roles.clone())
                            .unwrap_or_default();
                        let pods =
                            list_component_pods(&ctx.client, &ns, &cluster_name, &so.component_name)
                                .await?;
                        let previous = job_env(&job, ENV_CURRENT).unwrap_or_default();
                        if role_converged(&so.component_name, &pods, &roles, &so.instance_name, previous)? {
                            Some(detail(
                                &key,
                                ProgressStatus::Succeed,
                                format!("switchover of component {} succeed", so.component_name),
                            ))
                        } else {
                            Some(detail(
                                &key,
                                ProgressStatus::Processing,
                                "switchover succeed, wait role label to be updated",
                            ))
                        }
                    }
                },
            }
        };

        let now = res.now;
        let ledger = &mut res.component_status_mut(&so.component_name).progress_details;
        if let Some(new) = new {
            let event = set_progress_detail(ledger, new, now);
            res.events.extend(event);
        }
        let ledger = &res.component_status_mut(&so.component_name).progress_details;
        match ledger.iter().find(|d| d.object_key == key).map(|d| d.status) {
            Some(ProgressStatus::Succeed) => {
                summary.completed += 1;
                summary.succeeded += 1;
            }
            Some(ProgressStatus::Failed) => summary.completed += 1,
            _ => {}
        }
    }
    Ok(ReconcileOutcome::new(summary, REQUEUE))
}
