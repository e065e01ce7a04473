//! Lifecycle driver of one OpsRequest.
//!
//! Each reconcile looks at the persisted phase and does the work of that
//! phase only: `Pending` validates and competes for admission, `Creating`
//! applies the one-shot mutation, `Running` aggregates progress until a
//! verdict. Terminal requests release their queue record and honour the
//! success TTL. Every wait is a requeue; nothing blocks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use crate::controller::Context;
use crate::controller::aggregator::{ComponentHealth, check_component_health, resolve_components};
use crate::controller::error::{Error, Result};
use crate::controller::queue::{DequeueOutcome, QueueMode, QueueStore, Removal, update_queue};
use crate::controller::registry::OpsBehaviour;
use crate::controller::state_machine::{OpsEvent, OpsStateMachine};
use crate::controller::status::{
    ConditionBuilder, OpsStatusManager, apply_transition, condition_status, condition_types,
    reasons,
};
use crate::controller::validation::{PhaseCheck, check_cluster_phase, validate_ops_request};
use crate::crd::{
    Cluster, OpsPhase, OpsRequest, OpsRequestStatus, annotations, format_time, parse_time,
};
use crate::handlers::{self, OpsResource};
use crate::resources::FIELD_MANAGER;

/// Requeue while waiting behind another request in the queue
const QUEUE_WAIT_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue after the mutation is applied
const APPLIED_REQUEUE: Duration = Duration::from_secs(1);
/// Requeue when the informer cache lags our own writes
const CACHE_REFRESH_REQUEUE: Duration = Duration::from_secs(1);

/// Drive `ops` one step forward
pub async fn do_ops(ops: &OpsRequest, ctx: &Context) -> Result<Action> {
    let now = Utc::now();
    if ops.phase().is_terminal() {
        return on_terminal(ops, ctx, now).await;
    }

    let Some(behaviour) = ctx.registry.get(ops.spec.type_).cloned() else {
        return fail_early(
            ops,
            ctx,
            reasons::OPS_TYPE_NOT_SUPPORTED,
            &format!("spec.type {} is not supported by operator", ops.spec.type_),
        )
        .await;
    };

    let ns = ops.namespace().unwrap_or_default();
    let clusters: Api<Cluster> = Api::namespaced(ctx.client.clone(), &ns);
    let Some(cluster) = clusters.get_opt(&ops.spec.cluster_name).await? else {
        return fail_early(
            ops,
            ctx,
            reasons::CLUSTER_NOT_FOUND,
            &format!("spec.clusterName {} is not found", ops.spec.cluster_name),
        )
        .await;
    };

    let mut res = OpsResource::new(ops.clone(), cluster, behaviour, now);

    if ops.spec.cancel
        && let Some(action) = do_cancel(ctx, &mut res).await?
    {
        return Ok(action);
    }

    if let Some(action) = check_timeout(ctx, &mut res).await? {
        return Ok(action);
    }

    match res.status.phase {
        OpsPhase::Pending => do_pending(ctx, &mut res).await,
        OpsPhase::Creating => do_creating(ctx, &mut res).await,
        OpsPhase::Running => do_running(ctx, &mut res).await,
        OpsPhase::Succeed | OpsPhase::Failed | OpsPhase::Cancelled => Ok(Action::await_change()),
    }
}

/// Fail a request that never got as far as loading its cluster
async fn fail_early(ops: &OpsRequest, ctx: &Context, reason: &str, message: &str) -> Result<Action> {
    warn!(reason, message, "OpsRequest can not be processed");
    let mut status = ops.status.clone().unwrap_or_default();
    OpsStatusManager::new(ops, ctx)
        .transition(&mut status, OpsEvent::Failed, reason, message)
        .await?;
    release_queue(ctx, ops, Removal::Failed).await?;
    Ok(Action::await_change())
}

/// Move the request to a terminal phase and release its queue record
async fn finish(
    ctx: &Context,
    res: &mut OpsResource,
    event: OpsEvent,
    reason: &str,
    message: &str,
) -> Result<Action> {
    let manager = OpsStatusManager::new(&res.ops, ctx);
    if !manager.transition(&mut res.status, event, reason, message).await? {
        return Ok(Action::await_change());
    }
    publish_events(ctx, res).await;

    let removal = match res.status.phase {
        OpsPhase::Succeed => Removal::Succeed,
        OpsPhase::Cancelled => Removal::Cancelled,
        _ => Removal::Failed,
    };
    info!(phase = %res.status.phase, reason, "OpsRequest finished");
    release_queue(ctx, &res.ops, removal).await?;

    let mut finished = res.ops.clone();
    finished.status = Some(res.status.clone());
    Ok(ttl_action(&finished, res.now).unwrap_or_else(Action::await_change))
}

/// Persist the working status, logging instead of failing
async fn save_status_best_effort(ctx: &Context, res: &OpsResource) {
    if let Err(e) = OpsStatusManager::new(&res.ops, ctx).update(&res.status).await {
        warn!("Failed to persist OpsRequest status: {}", e);
    }
}

async fn publish_events(ctx: &Context, res: &mut OpsResource) {
    let manager = OpsStatusManager::new(&res.ops, ctx);
    for event in std::mem::take(&mut res.events) {
        manager.publish(event.warning, event.reason, &event.message).await;
    }
}

async fn do_cancel(ctx: &Context, res: &mut OpsResource) -> Result<Option<Action>> {
    let phase = res.status.phase;
    if phase == OpsPhase::Pending {
        let message = format!("OpsRequest {} is cancelled before it started", res.name());
        return finish(ctx, res, OpsEvent::Cancelled, reasons::CANCELLED, &message)
            .await
            .map(Some);
    }
    if !res.behaviour.cancellable {
        debug!(ops_type = %res.ops.spec.type_, "cancel is not supported, ignoring");
        return Ok(None);
    }

    match handlers::cancel(res.behaviour.kind, ctx, res).await {
        Ok(()) => {}
        Err(e) if e.is_fatal() => {
            let message = format!("Failed to cancel the OpsRequest: {}", e);
            return finish(ctx, res, OpsEvent::Failed, reasons::FAILED, &message)
                .await
                .map(Some);
        }
        Err(e) => return Err(e),
    }
    let message = format!("OpsRequest {} is cancelled", res.name());
    finish(ctx, res, OpsEvent::Cancelled, reasons::CANCELLED, &message)
        .await
        .map(Some)
}

async fn check_timeout(ctx: &Context, res: &mut OpsResource) -> Result<Option<Action>> {
    let Some(timeout) = res.ops.spec.timeout_seconds else {
        return Ok(None);
    };
    if !matches!(res.status.phase, OpsPhase::Creating | OpsPhase::Running) {
        return Ok(None);
    }
    let elapsed = res.now - res.start_time();
    if elapsed < chrono::Duration::seconds(i64::from(timeout)) {
        return Ok(None);
    }
    let message = format!("OpsRequest exceeded its timeout of {}s", timeout);
    finish(ctx, res, OpsEvent::Failed, reasons::TIMEOUT, &message)
        .await
        .map(Some)
}

fn pre_check_failed(res: &OpsResource) -> bool {
    res.status
        .components
        .values()
        .any(|c| c.pre_check.as_ref().is_some_and(|p| !p.pass))
}

async fn do_pending(ctx: &Context, res: &mut OpsResource) -> Result<Action> {
    let kind = res.behaviour.kind;
    let validated = match validate_ops_request(&res.ops, &res.cluster) {
        Ok(()) => handlers::validate(kind, ctx, res).await,
        Err(e) => Err(e),
    };
    match validated {
        Ok(()) => {}
        Err(e) if e.is_fatal() => {
            let reason = if pre_check_failed(res) {
                reasons::PRE_CHECK_FAILED
            } else {
                reasons::VALIDATE_FAILED
            };
            return finish(ctx, res, OpsEvent::Failed, reason, &e.to_string()).await;
        }
        Err(e) => return Err(e),
    }

    let ns = res.namespace();
    let (admission, depth) = compete_for_admission(
        ctx.queue_store.as_ref(),
        &res.ops,
        &res.cluster,
        &res.behaviour,
        res.now,
    )
    .await?;
    if let Some(depth) = depth {
        record_queue_depth(ctx, &ns, &res.ops.spec.cluster_name, depth);
    }
    match admission {
        Admission::Admitted => {}
        Admission::Queued => return wait_in_queue(ctx, res).await,
        Admission::WaitForPhase(after) => {
            debug!(cluster_phase = %res.cluster.phase(), "waiting for an allowed cluster phase");
            return Ok(Action::requeue(after));
        }
        Admission::Rejected(message) => {
            return finish(ctx, res, OpsEvent::Failed, reasons::VALIDATE_FAILED, &message).await;
        }
    }

    handlers::save_last_configuration(kind, res);
    let message = format!("Start to process the OpsRequest: {}", res.name());
    let manager = OpsStatusManager::new(&res.ops, ctx);
    if !manager
        .transition(&mut res.status, OpsEvent::Admitted, reasons::STARTED, &message)
        .await?
    {
        return Ok(Action::await_change());
    }
    info!(cluster = %res.ops.spec.cluster_name, "OpsRequest admitted");
    do_creating(ctx, res).await
}

/// How a pending request fared against its cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Holds a queue record still waiting for its turn
    Queued,
    /// Stays Pending until the cluster reaches an allowed phase
    WaitForPhase(Duration),
    Rejected(String),
}

/// Pass the cluster phase gate and enter the cluster queue.
///
/// The queue depth is returned whenever the queue was touched.
pub async fn compete_for_admission(
    store: &dyn QueueStore,
    ops: &OpsRequest,
    cluster: &Cluster,
    behaviour: &OpsBehaviour,
    now: DateTime<Utc>,
) -> Result<(Admission, Option<usize>)> {
    let ns = ops.namespace().unwrap_or_default();
    let cluster_name = &ops.spec.cluster_name;
    let mode = behaviour.queue_mode;
    let queue = if mode == QueueMode::None {
        Default::default()
    } else {
        store.load(&ns, cluster_name).await?.value
    };

    match check_cluster_phase(ops, cluster, behaviour, &queue, now) {
        PhaseCheck::Allowed => {}
        PhaseCheck::Wait(after) => return Ok((Admission::WaitForPhase(after), None)),
        PhaseCheck::Rejected(message) => return Ok((Admission::Rejected(message), None)),
    }
    if mode == QueueMode::None {
        return Ok((Admission::Admitted, None));
    }

    let name = ops.name_any();
    let (entered, depth) = update_queue(store, &ns, cluster_name, |q| {
        let record = q.enqueue(&name, ops.spec.type_, behaviour.to_cluster_phase, mode, ops.spec.force);
        Ok((record, q.len()))
    })
    .await?;
    let admission = match entered {
        Ok(record) if record.in_queue => Admission::Queued,
        Ok(_) => Admission::Admitted,
        Err(_) => Admission::Rejected(format!("the ops queue of cluster {} is full", cluster_name)),
    };
    Ok((admission, Some(depth)))
}

/// Surface the Waiting condition and requeue
async fn wait_in_queue(ctx: &Context, res: &mut OpsResource) -> Result<Action> {
    let cluster = res.ops.spec.cluster_name.clone();
    let generation = res.ops.metadata.generation;
    let conditions = ConditionBuilder::from_existing(res.status.conditions.clone(), generation)
        .at(res.now)
        .set_condition(
            condition_types::WAITING,
            condition_status::TRUE,
            reasons::WAIT_FOR_PROGRESSING,
            &format!("wait for the ops queue of cluster {} to admit the OpsRequest", cluster),
        )
        .build();
    if conditions != res.status.conditions {
        res.status.conditions = conditions;
        OpsStatusManager::new(&res.ops, ctx).update(&res.status).await?;
    }
    debug!(cluster = %cluster, "OpsRequest is waiting in the queue");
    Ok(Action::requeue(QUEUE_WAIT_REQUEUE))
}

async fn do_creating(ctx: &Context, res: &mut OpsResource) -> Result<Action> {
    let kind = res.behaviour.kind;
    match handlers::action(kind, ctx, res).await {
        Ok(()) => {}
        Err(e) if e.is_fatal() => {
            return finish(ctx, res, OpsEvent::Failed, reasons::FAILED, &e.to_string()).await;
        }
        Err(e) => {
            save_status_best_effort(ctx, res).await;
            return Err(e);
        }
    }

    if let Some(phase) = res.behaviour.to_cluster_phase
        && handlers::mutated_cluster(kind, res)
    {
        handlers::patch_cluster_phase(ctx, res, phase).await?;
    }
    res.status.cluster_generation = res.cluster.metadata.generation;
    publish_events(ctx, res).await;

    let message = format!("The mutation of OpsRequest {} is applied", res.name());
    OpsStatusManager::new(&res.ops, ctx)
        .transition(&mut res.status, OpsEvent::ActionApplied, reasons::STARTED, &message)
        .await?;
    Ok(Action::requeue(APPLIED_REQUEUE))
}

/// Check the targeted components; the first one failing past its grace window fails the request
fn component_health(ctx: &Context, res: &mut OpsResource) -> (Option<String>, Option<Duration>) {
    let processed = res.processed();
    let timeout = ctx.config.component_failed_timeout;
    let mut grace: Option<Duration> = None;
    for target in res.ops.component_names() {
        for comp in resolve_components(&res.cluster, &target) {
            let observed = res.cluster.component_status(&comp.name).cloned();
            let now = res.now;
            let status = res.component_status_mut(&comp.name);
            match check_component_health(status, observed.as_ref(), processed, timeout, now) {
                ComponentHealth::Healthy => {}
                ComponentHealth::Grace(left) => {
                    grace = Some(grace.map_or(left, |g| g.min(left)));
                }
                ComponentHealth::Failed(msg) => {
                    return (Some(format!("component {} failed: {}", comp.name, msg)), None);
                }
            }
        }
    }
    (None, grace)
}

async fn do_running(ctx: &Context, res: &mut OpsResource) -> Result<Action> {
    let kind = res.behaviour.kind;
    let before = res.status.clone();
    let outcome = match handlers::reconcile_action(kind, ctx, res).await {
        Ok(outcome) => outcome,
        Err(Error::WaitCacheRefresh(msg)) => {
            debug!(%msg, "waiting for the cache to refresh");
            return Ok(Action::requeue(CACHE_REFRESH_REQUEUE));
        }
        Err(e) if e.is_fatal() => {
            return finish(ctx, res, OpsEvent::Failed, reasons::FAILED, &e.to_string()).await;
        }
        Err(e) => {
            save_status_best_effort(ctx, res).await;
            return Err(e);
        }
    };

    let (component_failure, grace) = if kind.tracks_component_health() {
        component_health(ctx, res)
    } else {
        (None, None)
    };
    res.status.progress = Some(outcome.summary.to_string());

    if let Some(message) = component_failure {
        return finish(ctx, res, OpsEvent::Failed, reasons::FAILED, &message).await;
    }

    match outcome.summary.verdict(false) {
        Some(OpsPhase::Succeed) => {
            let message = format!("Successfully processed the OpsRequest: {}", res.name());
            finish(ctx, res, OpsEvent::Completed, reasons::SUCCEED, &message).await
        }
        Some(_) => {
            let message = format!(
                "Failed to process the OpsRequest: {}, {} of {} objects failed",
                res.name(),
                outcome.summary.failed(),
                outcome.summary.expected
            );
            finish(ctx, res, OpsEvent::Failed, reasons::FAILED, &message).await
        }
        None => {
            if res.status != before {
                OpsStatusManager::new(&res.ops, ctx).update(&res.status).await?;
            }
            publish_events(ctx, res).await;
            let after = match (outcome.requeue_after, grace) {
                (Some(a), Some(g)) => Some(a.min(g)),
                (a, g) => a.or(g),
            };
            Ok(after.map_or_else(Action::await_change, Action::requeue))
        }
    }
}

/// Requeue or delete a succeeded request carrying a TTL
fn ttl_action(ops: &OpsRequest, now: DateTime<Utc>) -> Option<Action> {
    let ttl = ops.spec.ttl_seconds_after_succeed?;
    if ops.phase() != OpsPhase::Succeed {
        return None;
    }
    let completed = ops
        .status
        .as_ref()
        .and_then(|s| s.completion_timestamp.as_deref())
        .and_then(parse_time)
        .unwrap_or(now);
    let left = (completed + chrono::Duration::seconds(i64::from(ttl)) - now)
        .to_std()
        .unwrap_or_default();
    Some(Action::requeue(left))
}

fn ttl_expired(ops: &OpsRequest, now: DateTime<Utc>) -> bool {
    let Some(ttl) = ops.spec.ttl_seconds_after_succeed else {
        return false;
    };
    ops.phase() == OpsPhase::Succeed
        && ops
            .status
            .as_ref()
            .and_then(|s| s.completion_timestamp.as_deref())
            .and_then(parse_time)
            .is_some_and(|t| t + chrono::Duration::seconds(i64::from(ttl)) <= now)
}

async fn on_terminal(ops: &OpsRequest, ctx: &Context, now: DateTime<Utc>) -> Result<Action> {
    // A crash between the phase patch and the dequeue leaves the record behind
    let removal = match ops.phase() {
        OpsPhase::Succeed => Removal::Succeed,
        OpsPhase::Cancelled => Removal::Cancelled,
        _ => Removal::Failed,
    };
    release_queue(ctx, ops, removal).await?;

    if ttl_expired(ops, now) {
        let api: Api<OpsRequest> = Api::namespaced(ctx.client.clone(), &ops.namespace().unwrap_or_default());
        info!("Deleting OpsRequest after its success TTL");
        match api.delete(&ops.name_any(), &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(Action::await_change());
    }
    Ok(ttl_action(ops, now).unwrap_or_else(Action::await_change))
}

fn record_queue_depth(ctx: &Context, ns: &str, cluster: &str, depth: usize) {
    if let Some(health) = &ctx.health {
        health
            .metrics
            .set_queue_depth(ns, cluster, i64::try_from(depth).unwrap_or(i64::MAX));
    }
}

/// Remove `name` from its cluster queue; `None` when there was nothing to remove
pub async fn leave_queue(
    store: &dyn QueueStore,
    namespace: &str,
    cluster: &str,
    name: &str,
    removal: Removal,
) -> Result<Option<(DequeueOutcome, usize)>> {
    let released = update_queue(store, namespace, cluster, |q| {
        let outcome = q.dequeue(name, removal);
        Ok((outcome, q.len()))
    })
    .await;
    match released {
        Ok((outcome, depth)) if outcome.removed.is_some() => Ok(Some((outcome, depth))),
        Ok(_) => Ok(None),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn cascade_message(failed: &str) -> String {
    format!("cancelled because OpsRequest {} failed", failed)
}

/// Status of a waiter cancelled because `failed` failed; `None` once it is terminal
pub fn cascade_cancelled_status(
    victim: &OpsRequest,
    failed: &str,
    sm: &OpsStateMachine,
    now: DateTime<Utc>,
) -> Option<OpsRequestStatus> {
    if victim.phase().is_terminal() {
        return None;
    }
    let mut status = victim.status.clone().unwrap_or_default();
    apply_transition(
        &mut status,
        sm,
        OpsEvent::Cancelled,
        None,
        victim.metadata.generation,
        reasons::CANCELLED_BY_FAILED_OPS,
        &cascade_message(failed),
        now,
    )
    .is_success()
    .then_some(status)
}

/// Remove the request's queue record, waking its successor and cancelling
/// waiters when it failed
pub async fn release_queue(ctx: &Context, ops: &OpsRequest, removal: Removal) -> Result<()> {
    let queued = ctx
        .registry
        .get(ops.spec.type_)
        .is_some_and(|b| b.queue_mode != QueueMode::None);
    if !queued {
        return Ok(());
    }
    let ns = ops.namespace().unwrap_or_default();
    let cluster = &ops.spec.cluster_name;
    let name = ops.name_any();

    let Some((outcome, depth)) =
        leave_queue(ctx.queue_store.as_ref(), &ns, cluster, &name, removal).await?
    else {
        return Ok(());
    };
    record_queue_depth(ctx, &ns, cluster, depth);
    debug!(cluster = %cluster, ?removal, "released ops queue record");

    let api: Api<OpsRequest> = Api::namespaced(ctx.client.clone(), &ns);
    if let Some(next) = &outcome.promoted {
        let stamp = format_time(Utc::now());
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    (annotations::RECONCILE): stamp,
                    (annotations::QUEUE_END_TIME): stamp
                }
            }
        });
        match api
            .patch(next, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!(next = %next, "Promoted the next OpsRequest in the queue"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    for victim in &outcome.cancelled {
        let Some(other) = api.get_opt(victim).await? else {
            continue;
        };
        let Some(status) = cascade_cancelled_status(&other, &name, &ctx.state_machine, Utc::now())
        else {
            continue;
        };
        let manager = OpsStatusManager::new(&other, ctx);
        manager.update(&status).await?;
        if let Some(health) = &ctx.health {
            health
                .metrics
                .record_phase(&other.spec.type_.to_string(), &status.phase.to_string());
        }
        manager
            .publish(false, reasons::CANCELLED_BY_FAILED_OPS, &cascade_message(&name))
            .await;
        info!(victim = %victim, "Cancelled a queued OpsRequest");
    }
    Ok(())
}
