//! Status and conditions management for OpsRequest resources
//!
//! Phase changes go through [`apply_transition`], which checks the move
//! against the [`OpsStateMachine`] and stamps conditions and timestamps.
//! [`OpsStatusManager`] persists the result and publishes the matching
//! Kubernetes event.

use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType};
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::controller::Context;
use crate::controller::error::Result;
use crate::controller::state_machine::{OpsEvent, OpsStateMachine, TransitionResult};
use crate::crd::{Condition, OpsPhase, OpsRequest, OpsRequestStatus, format_time};
use crate::resources::FIELD_MANAGER;

/// Condition types set on an OpsRequest
pub mod condition_types {
    pub const VALIDATED: &str = "Validated";
    pub const SUCCEED: &str = "Succeed";
    pub const FAILED: &str = "Failed";
    pub const CANCELLED: &str = "Cancelled";
    /// Waiting in the cluster's ops queue
    pub const WAITING: &str = "WaitForProgressing";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Reasons recorded on conditions and events
pub mod reasons {
    pub const OPS_TYPE_NOT_SUPPORTED: &str = "OpsTypeNotSupported";
    pub const CLUSTER_NOT_FOUND: &str = "ClusterNotFound";
    pub const VALIDATE_FAILED: &str = "ValidateFailed";
    pub const VALIDATE_PASSED: &str = "ValidateOpsRequestPassed";
    pub const WAIT_FOR_PROGRESSING: &str = "WaitForProgressing";
    pub const STARTED: &str = "OpsRequestStarted";
    pub const SUCCEED: &str = "OpsRequestProcessedSuccessfully";
    pub const FAILED: &str = "OpsRequestFailed";
    pub const TIMEOUT: &str = "Timeout";
    pub const CANCELLED: &str = "OpsRequestCancelled";
    pub const CANCELLED_BY_FAILED_OPS: &str = "CancelledByFailedOps";
    pub const SKIP_SWITCHOVER: &str = "SkipSwitchover";
    pub const PRE_CHECK_FAILED: &str = "PreCheckFailed";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
    now: String,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self::from_existing(Vec::new(), generation)
    }

    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
            now: format_time(Utc::now()),
        }
    }

    /// Use `now` as the transition time of changed conditions
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = format_time(now);
        self
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            // the transition time only moves when the status flips
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = self.now.clone();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: self.now.clone(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn validated(self, passed: bool, reason: &str, message: &str) -> Self {
        let status = if passed {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(condition_types::VALIDATED, status, reason, message)
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Apply `event` to an in-memory status.
///
/// On success the phase, conditions and timestamps are updated; an invalid
/// transition leaves the status untouched. `started` is the kind's started
/// condition type, if the request has a registered kind.
#[allow(clippy::too_many_arguments)]
pub fn apply_transition(
    status: &mut OpsRequestStatus,
    sm: &OpsStateMachine,
    event: OpsEvent,
    started: Option<&str>,
    generation: Option<i64>,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> TransitionResult {
    let result = sm.transition(status.phase, event);
    let TransitionResult::Success { from, to, .. } = &result else {
        return result;
    };

    let mut builder =
        ConditionBuilder::from_existing(std::mem::take(&mut status.conditions), generation).at(now);
    match to {
        OpsPhase::Creating => {
            builder = builder.validated(true, reasons::VALIDATE_PASSED, "OpsRequest is validated");
            if let Some(started) = started {
                builder = builder.set_condition(started, condition_status::TRUE, reason, message);
            }
            builder = builder.set_condition(
                condition_types::WAITING,
                condition_status::FALSE,
                reasons::STARTED,
                "OpsRequest left the queue",
            );
            if status.start_timestamp.is_none() {
                status.start_timestamp = Some(format_time(now));
            }
        }
        OpsPhase::Running => {
            if let Some(started) = started {
                builder = builder.set_condition(started, condition_status::TRUE, reason, message);
            }
        }
        OpsPhase::Succeed => {
            builder = builder.set_condition(condition_types::SUCCEED, condition_status::TRUE, reason, message);
            status.completion_timestamp = Some(format_time(now));
        }
        OpsPhase::Failed => {
            if *from == OpsPhase::Pending {
                builder = builder.validated(false, reason, message);
            }
            builder = builder.set_condition(condition_types::FAILED, condition_status::TRUE, reason, message);
            status.completion_timestamp = Some(format_time(now));
        }
        OpsPhase::Cancelled => {
            builder = builder.set_condition(condition_types::CANCELLED, condition_status::TRUE, reason, message);
            let stamp = format_time(now);
            status.cancel_timestamp.get_or_insert_with(|| stamp.clone());
            status.completion_timestamp = Some(stamp);
        }
        OpsPhase::Pending => {}
    }
    status.conditions = builder.build();
    status.phase = *to;
    result
}

/// Persists OpsRequest status and publishes events
pub struct OpsStatusManager<'a> {
    ops: &'a OpsRequest,
    ctx: &'a Context,
}

impl<'a> OpsStatusManager<'a> {
    pub fn new(ops: &'a OpsRequest, ctx: &'a Context) -> Self {
        Self { ops, ctx }
    }

    /// Write the full status object
    pub async fn update(&self, status: &OpsRequestStatus) -> Result<()> {
        let ns = self.ops.namespace().unwrap_or_default();
        let api: Api<OpsRequest> = Api::namespaced(self.ctx.client.clone(), &ns);
        let patch = serde_json::json!({
            "status": status
        });

        api.patch_status(
            &self.ops.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    /// Move the request to the phase `event` leads to and persist it.
    ///
    /// Returns `false` without writing when the state machine rejects the move.
    pub async fn transition(
        &self,
        status: &mut OpsRequestStatus,
        event: OpsEvent,
        reason: &str,
        message: &str,
    ) -> Result<bool> {
        let started = self
            .ctx
            .registry
            .get(self.ops.spec.type_)
            .map(|b| b.kind.started_condition());
        let result = apply_transition(
            status,
            &self.ctx.state_machine,
            event,
            started,
            self.ops.metadata.generation,
            reason,
            message,
            Utc::now(),
        );

        match result {
            TransitionResult::Success { from, to, description, .. } => {
                debug!(%from, %to, description, "OpsRequest phase transition");
                self.update(status).await?;
                if let Some(health) = &self.ctx.health {
                    health
                        .metrics
                        .record_phase(&self.ops.spec.type_.to_string(), &to.to_string());
                }
                self.publish(to == OpsPhase::Failed, reason, message).await;
                Ok(true)
            }
            TransitionResult::InvalidTransition { current, event } => {
                warn!(%current, %event, "Ignoring invalid OpsRequest phase transition");
                Ok(false)
            }
        }
    }

    /// Publish an event on the request; failures are only logged
    pub async fn publish(&self, warning: bool, reason: &str, note: &str) {
        let event = Event {
            type_: if warning {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: self.ops.spec.type_.to_string(),
            secondary: None,
        };
        if let Err(e) = self
            .ctx
            .recorder
            .publish(&event, &self.ops.object_ref(&()))
            .await
        {
            warn!("Failed to publish event {}: {}", reason, e);
        }
    }
}
