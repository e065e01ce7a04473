//! Per-instance rebuild steps.
//!
//! [`advance`] is a pure function of the persisted [`RebuildStep`] and what a
//! reconcile observed. It returns the action to run now and the step to
//! persist once that action succeeded, so a crash between the two simply
//! reruns an idempotent action.

use crate::crd::RebuildStep;

pub const WAITING_FOR_INSTANCE_READY: &str = "Waiting for the rebuilding instance to be ready";
pub const REBINDING_VOLUMES: &str = "Rebinding the restored volumes to the instance";

/// Observed state of a child object driving a step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Phase {
    /// Not created yet
    #[default]
    Missing,
    Running(String),
    Completed,
    Failed(String),
}

/// What one reconcile saw for an instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub in_place: bool,
    /// Temp pod or prepare-data Restore
    pub provisioning: Phase,
    /// The rebuilt (or replacement) instance is available
    pub instance_ready: bool,
    /// The backup's action set has a post-ready stage
    pub has_post_ready: bool,
    pub post_ready: Phase,
    /// The replaced instance no longer exists (scale-out rebuild)
    pub source_gone: bool,
}

/// Side effect a step asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Create temp claims and pod, or the prepare-data Restore
    Provision,
    /// Rebind restored volumes to the source claims and delete the instance
    Rebind,
    StartPostReady,
    /// Take the replaced instance offline
    Offline,
    /// Nothing to do; record the message
    Wait(String),
    Succeed,
    Fail(String),
    Done,
}

/// Next step and action for an instance
pub fn advance(step: RebuildStep, obs: &Observation) -> (RebuildStep, StepAction) {
    use RebuildStep as S;

    match step {
        S::Succeed | S::Failed => (step, StepAction::Done),
        S::Pending if obs.in_place => (S::ProvisioningVolumes, StepAction::Provision),
        // Scale-out rebuilds are started by the one-shot action
        S::Pending => (S::WaitingInstanceReady, StepAction::Wait(WAITING_FOR_INSTANCE_READY.into())),
        S::ProvisioningVolumes => match &obs.provisioning {
            Phase::Missing => (S::ProvisioningVolumes, StepAction::Provision),
            Phase::Running(msg) => (S::ProvisioningVolumes, StepAction::Wait(msg.clone())),
            Phase::Failed(msg) => (S::Failed, StepAction::Fail(msg.clone())),
            Phase::Completed => (S::RebindingVolumes, StepAction::Wait(REBINDING_VOLUMES.into())),
        },
        // Rebinding is resumed from the volume labels
        S::RebindingVolumes => (S::WaitingInstanceReady, StepAction::Rebind),
        S::WaitingInstanceReady => {
            if !obs.instance_ready {
                return (S::WaitingInstanceReady, StepAction::Wait(WAITING_FOR_INSTANCE_READY.into()));
            }
            if !obs.in_place {
                if obs.source_gone {
                    return (S::Succeed, StepAction::Succeed);
                }
                return (S::WaitingInstanceReady, StepAction::Offline);
            }
            if obs.has_post_ready {
                return (S::PostReady, StepAction::StartPostReady);
            }
            (S::Succeed, StepAction::Succeed)
        }
        S::PostReady => match &obs.post_ready {
            Phase::Missing => (S::PostReady, StepAction::StartPostReady),
            Phase::Running(msg) => (S::PostReady, StepAction::Wait(msg.clone())),
            Phase::Failed(msg) => (S::Failed, StepAction::Fail(msg.clone())),
            Phase::Completed => (S::Succeed, StepAction::Succeed),
        },
    }
}
