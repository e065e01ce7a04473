//! Request-level validation shared by every operation kind.
//!
//! Kind-specific checks live with the handlers; this module covers what
//! holds for any request: a non-empty payload naming known, distinct
//! components, and the cluster phase gate with its pre-condition deadline.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::controller::queue::OpsQueue;
use crate::controller::registry::OpsBehaviour;
use crate::crd::{Cluster, OpsPhase, OpsRequest, annotations, from_k8s_time, parse_time};

/// Requeue interval while waiting for the cluster to reach an allowed phase
pub const PHASE_WAIT_REQUEUE: Duration = Duration::from_secs(5);

/// Validate the payload against the current cluster
pub fn validate_ops_request(ops: &OpsRequest, cluster: &Cluster) -> Result<()> {
    let names = ops.component_names();
    if names.is_empty() {
        return Err(Error::ValidationError(format!(
            "spec of {} OpsRequest names no components",
            ops.spec.type_
        )));
    }

    let mut seen = BTreeSet::new();
    for name in &names {
        if !seen.insert(name.as_str()) {
            return Err(Error::ValidationError(format!(
                "component {} is listed more than once",
                name
            )));
        }
        if cluster.component_spec(name).is_none() {
            return Err(Error::ValidationError(format!(
                "component {} not found in cluster {}",
                name,
                cluster.name_any()
            )));
        }
    }
    Ok(())
}

/// Outcome of the cluster phase gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseCheck {
    Allowed,
    /// Stay Pending and recheck after the interval
    Wait(Duration),
    Rejected(String),
}

/// When the pre-condition deadline starts counting
fn deadline_base(ops: &OpsRequest, now: DateTime<Utc>) -> DateTime<Utc> {
    ops.annotations()
        .get(annotations::QUEUE_END_TIME)
        .and_then(|t| parse_time(t))
        .or_else(|| ops.metadata.creation_timestamp.as_ref().map(from_k8s_time))
        .unwrap_or(now)
}

/// Decide whether a request may start from the cluster's current phase.
///
/// A queued kind passes while it holds a record in `queue`, or when it would
/// wait behind an admitted conflicting request: the phase that request drove
/// the cluster into is not held against its successors.
pub fn check_cluster_phase(
    ops: &OpsRequest,
    cluster: &Cluster,
    behaviour: &OpsBehaviour,
    queue: &OpsQueue,
    now: DateTime<Utc>,
) -> PhaseCheck {
    if ops.spec.force
        || behaviour.from_cluster_phases.is_empty()
        || ops.phase() != OpsPhase::Pending
        || behaviour.allows_cluster_phase(cluster.phase())
        || queue.holds_or_would_wait(&ops.name_any(), ops.spec.type_, behaviour.queue_mode)
    {
        return PhaseCheck::Allowed;
    }

    let message = format!(
        "OpsRequest.spec.type={} is forbidden when Cluster.status.phase={}",
        ops.spec.type_,
        cluster.phase()
    );
    let Some(deadline) = ops.spec.pre_condition_deadline_seconds else {
        return PhaseCheck::Rejected(message);
    };
    let deadline = deadline_base(ops, now) + chrono::Duration::seconds(i64::from(deadline));
    if now < deadline {
        PhaseCheck::Wait(PHASE_WAIT_REQUEUE)
    } else {
        PhaseCheck::Rejected(format!("{}, pre-condition deadline exceeded", message))
    }
}
