//! Unit tests for status management

use ops_operator::controller::state_machine::{OpsEvent, OpsStateMachine};
use ops_operator::controller::status::{
    ConditionBuilder, apply_transition, condition_status, condition_types, find_condition, reasons,
};
use ops_operator::crd::{OpsPhase, OpsRequestStatus, format_time};

use crate::common::*;

fn step(status: &mut OpsRequestStatus, event: OpsEvent, reason: &str, at: i64) -> bool {
    apply_transition(
        status,
        &OpsStateMachine::new(),
        event,
        Some("HorizontalScaling"),
        Some(1),
        reason,
        "message",
        t0() + secs(at),
    )
    .is_success()
}

fn condition_status_of(status: &OpsRequestStatus, type_: &str) -> Option<String> {
    find_condition(&status.conditions, type_).map(|c| c.status.clone())
}

mod condition_builder_tests {
    use super::*;

    #[test]
    fn test_new_condition_builder_is_empty() {
        assert!(ConditionBuilder::new(Some(1)).build().is_empty());
    }

    #[test]
    fn test_set_condition_adds_then_updates() {
        let conditions = ConditionBuilder::new(Some(1))
            .at(t0())
            .set_condition("Restarting", condition_status::TRUE, "Started", "restarting")
            .set_condition(condition_types::WAITING, condition_status::TRUE, "Queued", "queued")
            .set_condition("Restarting", condition_status::TRUE, "Started", "still restarting")
            .build();
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].message, "still restarting");
        assert_eq!(conditions[0].last_transition_time, format_time(t0()));
    }

    #[test]
    fn test_validated_helper() {
        let conditions = ConditionBuilder::new(None)
            .validated(false, reasons::VALIDATE_FAILED, "bad spec")
            .build();
        let c = find_condition(&conditions, condition_types::VALIDATED).unwrap();
        assert_eq!(c.status, condition_status::FALSE);
        assert_eq!(c.reason, reasons::VALIDATE_FAILED);
        assert_eq!(c.observed_generation, None);
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_successful_lifecycle() {
        let mut status = OpsRequestStatus::default();
        assert!(step(&mut status, OpsEvent::Admitted, reasons::STARTED, 0));
        assert!(step(&mut status, OpsEvent::ActionApplied, reasons::STARTED, 1));
        assert!(step(&mut status, OpsEvent::Completed, reasons::SUCCEED, 60));

        assert_eq!(status.phase, OpsPhase::Succeed);
        assert_eq!(status.start_timestamp, Some(format_time(t0())));
        assert_eq!(status.completion_timestamp, Some(format_time(t0() + secs(60))));
        assert_eq!(
            condition_status_of(&status, condition_types::VALIDATED).as_deref(),
            Some(condition_status::TRUE)
        );
        assert_eq!(
            condition_status_of(&status, condition_types::WAITING).as_deref(),
            Some(condition_status::FALSE)
        );
        assert_eq!(
            condition_status_of(&status, "HorizontalScaling").as_deref(),
            Some(condition_status::TRUE)
        );
        assert_eq!(
            condition_status_of(&status, condition_types::SUCCEED).as_deref(),
            Some(condition_status::TRUE)
        );
    }

    #[test]
    fn test_cancel_while_running() {
        let mut status = OpsRequestStatus::default();
        step(&mut status, OpsEvent::Admitted, reasons::STARTED, 0);
        step(&mut status, OpsEvent::ActionApplied, reasons::STARTED, 1);
        assert!(step(&mut status, OpsEvent::Cancelled, reasons::CANCELLED, 30));

        assert_eq!(status.phase, OpsPhase::Cancelled);
        assert_eq!(status.cancel_timestamp, Some(format_time(t0() + secs(30))));
        assert_eq!(status.completion_timestamp, status.cancel_timestamp);
        // Validation happened at admission and is left as it was
        assert_eq!(
            condition_status_of(&status, condition_types::VALIDATED).as_deref(),
            Some(condition_status::TRUE)
        );
    }

    #[test]
    fn test_running_failure_keeps_validation() {
        let mut status = OpsRequestStatus::default();
        step(&mut status, OpsEvent::Admitted, reasons::STARTED, 0);
        step(&mut status, OpsEvent::ActionApplied, reasons::STARTED, 1);
        assert!(step(&mut status, OpsEvent::Failed, reasons::TIMEOUT, 90));
        let failed = find_condition(&status.conditions, condition_types::FAILED).unwrap();
        assert_eq!(failed.reason, reasons::TIMEOUT);
        assert_eq!(
            condition_status_of(&status, condition_types::VALIDATED).as_deref(),
            Some(condition_status::TRUE)
        );
    }

    #[test]
    fn test_skipping_a_phase_is_rejected() {
        let mut status = OpsRequestStatus::default();
        assert!(!step(&mut status, OpsEvent::Completed, reasons::SUCCEED, 0));
        assert_eq!(status.phase, OpsPhase::Pending);
        assert!(status.conditions.is_empty());
        assert!(status.completion_timestamp.is_none());
    }

    #[test]
    fn test_readmission_keeps_the_first_start_time() {
        let mut status = OpsRequestStatus {
            start_timestamp: Some(format_time(t0())),
            ..Default::default()
        };
        step(&mut status, OpsEvent::Admitted, reasons::STARTED, 120);
        assert_eq!(status.start_timestamp, Some(format_time(t0())));
    }
}
