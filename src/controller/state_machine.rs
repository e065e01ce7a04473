//! Finite state machine for the OpsRequest lifecycle
//!
//! Every phase change the manager makes is checked against this table, so
//! `status.phase` only moves forward and terminal phases never change again.

use std::fmt;

use crate::crd::OpsPhase;

/// Events that trigger OpsRequest phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpsEvent {
    /// Validation passed and the request was admitted by the queue
    Admitted,
    /// The one-shot mutation was applied to the cluster
    ActionApplied,
    /// Every target reached a terminal state without failure
    Completed,
    /// Validation, a fatal error, a timeout or a failed target
    Failed,
    /// User cancellation, or cascade from a failed predecessor
    Cancelled,
}

impl fmt::Display for OpsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpsEvent::Admitted => write!(f, "Admitted"),
            OpsEvent::ActionApplied => write!(f, "ActionApplied"),
            OpsEvent::Completed => write!(f, "Completed"),
            OpsEvent::Failed => write!(f, "Failed"),
            OpsEvent::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: OpsPhase,
    pub to: OpsPhase,
    pub event: OpsEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    const fn new(from: OpsPhase, to: OpsPhase, event: OpsEvent, description: &'static str) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    Success {
        from: OpsPhase,
        to: OpsPhase,
        event: OpsEvent,
        description: &'static str,
    },
    /// Transition was not valid for current state
    InvalidTransition { current: OpsPhase, event: OpsEvent },
}

impl TransitionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransitionResult::Success { .. })
    }
}

/// Formal state machine for OpsRequest phases
pub struct OpsStateMachine {
    transitions: Vec<Transition>,
}

impl Default for OpsStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl OpsStateMachine {
    pub fn new() -> Self {
        use OpsPhase::*;
        Self {
            transitions: vec![
                // === Pending ===
                Transition::new(Pending, Creating, OpsEvent::Admitted, "Request admitted, applying the operation"),
                Transition::new(Pending, Failed, OpsEvent::Failed, "Request rejected before admission"),
                Transition::new(Pending, Cancelled, OpsEvent::Cancelled, "Request cancelled while queued"),
                // === Creating ===
                Transition::new(Creating, Running, OpsEvent::ActionApplied, "Mutation applied, waiting for the cluster"),
                Transition::new(Creating, Failed, OpsEvent::Failed, "Applying the operation failed"),
                Transition::new(Creating, Cancelled, OpsEvent::Cancelled, "Request cancelled before it ran"),
                // === Running ===
                Transition::new(Running, Succeed, OpsEvent::Completed, "Every target completed"),
                Transition::new(Running, Failed, OpsEvent::Failed, "A target failed or the request timed out"),
                Transition::new(Running, Cancelled, OpsEvent::Cancelled, "Request cancelled while running"),
                // Succeed, Failed and Cancelled are terminal
            ],
        }
    }

    /// Attempt to transition to a new phase based on an event
    pub fn transition(&self, current: OpsPhase, event: OpsEvent) -> TransitionResult {
        match self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
        {
            Some(t) => TransitionResult::Success {
                from: t.from,
                to: t.to,
                event,
                description: t.description,
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    pub fn can_transition(&self, from: OpsPhase, event: OpsEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    /// Get all valid events for a given phase
    pub fn valid_events(&self, phase: OpsPhase) -> Vec<OpsEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == phase)
            .map(|t| t.event)
            .collect()
    }
}

/// Event that moves a request into `target`
pub fn event_for_target(target: OpsPhase) -> Option<OpsEvent> {
    match target {
        OpsPhase::Pending => None,
        OpsPhase::Creating => Some(OpsEvent::Admitted),
        OpsPhase::Running => Some(OpsEvent::ActionApplied),
        OpsPhase::Succeed => Some(OpsEvent::Completed),
        OpsPhase::Failed => Some(OpsEvent::Failed),
        OpsPhase::Cancelled => Some(OpsEvent::Cancelled),
    }
}
