//! Reconciliation entry points for OpsRequest resources
//!
//! The kube `Controller` runs at most one reconcile per request at a time
//! and different requests concurrently. Everything requests share lives in
//! the Cluster object and is updated with compare-and-swap.

use std::sync::Arc;
use std::time::Instant;

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::manager::{do_ops, release_queue};
use crate::controller::queue::Removal;
use crate::crd::OpsRequest;
use crate::resources::FIELD_MANAGER;

/// Finalizer name for cleanup
pub const FINALIZER: &str = "ops.smoketurner.com/finalizer";

fn retry_key(ops: &OpsRequest) -> String {
    format!("{}/{}", ops.namespace().unwrap_or_default(), ops.name_any())
}

/// Main reconciliation function
#[instrument(skip(ops, ctx), fields(name = %ops.name_any(), namespace = ops.namespace().unwrap_or_default(), ops_type = %ops.spec.type_))]
pub async fn reconcile(ops: Arc<OpsRequest>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let ns = ops.namespace().unwrap_or_default();
    let name = ops.name_any();

    debug!(phase = %ops.phase(), "Reconciling OpsRequest");

    let result = if ops.metadata.deletion_timestamp.is_some() {
        handle_deletion(&ops, &ctx, &ns).await
    } else if !has_finalizer(&ops) {
        add_finalizer(&ops, &ctx, &ns)
            .await
            .map(|()| Action::requeue(std::time::Duration::from_secs(1)))
    } else {
        do_ops(&ops, &ctx).await
    };

    if let Some(health) = &ctx.health {
        health
            .metrics
            .record_reconcile(&ns, &name, started.elapsed().as_secs_f64());
        if result.is_err() {
            health.metrics.record_error(&ns, &name);
        }
    }
    if result.is_ok() {
        ctx.reset_retries(&retry_key(&ops));
    }
    result
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(ops: Arc<OpsRequest>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = ops.name_any();
    let backoff = BackoffConfig::default();
    let attempt = ctx.next_retry(&retry_key(&ops));
    let delay = backoff.delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(
            "Retryable error for {} (attempt {}): {}, requeuing in {:?}",
            name, attempt, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// Check if the finalizer is present
fn has_finalizer(ops: &OpsRequest) -> bool {
    ops.finalizers().iter().any(|f| f == FINALIZER)
}

async fn add_finalizer(ops: &OpsRequest, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<OpsRequest> = Api::namespaced(ctx.client.clone(), ns);
    let name = ops.name_any();
    let mut finalizers = ops.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!("Added finalizer to {}", name);
    Ok(())
}

/// Release the queue record of a deleted request, then let deletion proceed.
///
/// Already-applied cluster mutations are not rolled back.
async fn handle_deletion(ops: &OpsRequest, ctx: &Context, ns: &str) -> Result<Action> {
    let name = ops.name_any();
    info!("Handling deletion of {}", name);

    release_queue(ctx, ops, Removal::Deleted).await?;

    if has_finalizer(ops) {
        let api: Api<OpsRequest> = Api::namespaced(ctx.client.clone(), ns);
        let remaining: Vec<&String> = ops.finalizers().iter().filter(|f| *f != FINALIZER).collect();
        let finalizers = if remaining.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::json!(remaining)
        };
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        match api
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!("Removed finalizer from {}", name),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Action::await_change())
}
