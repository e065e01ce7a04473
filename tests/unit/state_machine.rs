//! Additional unit tests for OpsRequest phase transitions

use ops_operator::controller::state_machine::{
    OpsEvent, OpsStateMachine, TransitionResult, event_for_target,
};
use ops_operator::crd::OpsPhase;

const ALL_PHASES: [OpsPhase; 6] = [
    OpsPhase::Pending,
    OpsPhase::Creating,
    OpsPhase::Running,
    OpsPhase::Succeed,
    OpsPhase::Failed,
    OpsPhase::Cancelled,
];

const ALL_EVENTS: [OpsEvent; 5] = [
    OpsEvent::Admitted,
    OpsEvent::ActionApplied,
    OpsEvent::Completed,
    OpsEvent::Failed,
    OpsEvent::Cancelled,
];

mod transition_tests {
    use super::*;

    #[test]
    fn test_every_non_terminal_phase_can_fail_and_cancel() {
        let sm = OpsStateMachine::new();
        for phase in [OpsPhase::Pending, OpsPhase::Creating, OpsPhase::Running] {
            assert!(sm.can_transition(phase, OpsEvent::Failed), "{:?}", phase);
            assert!(sm.can_transition(phase, OpsEvent::Cancelled), "{:?}", phase);
        }
    }

    #[test]
    fn test_only_running_completes() {
        let sm = OpsStateMachine::new();
        for phase in ALL_PHASES {
            assert_eq!(
                sm.can_transition(phase, OpsEvent::Completed),
                phase == OpsPhase::Running
            );
        }
    }

    #[test]
    fn test_terminal_phases_are_absorbing() {
        let sm = OpsStateMachine::new();
        for phase in ALL_PHASES.into_iter().filter(|p| p.is_terminal()) {
            for event in ALL_EVENTS {
                assert!(matches!(
                    sm.transition(phase, event),
                    TransitionResult::InvalidTransition { current, .. } if current == phase
                ));
            }
        }
    }

    #[test]
    fn test_transition_reports_both_ends() {
        let sm = OpsStateMachine::new();
        match sm.transition(OpsPhase::Creating, OpsEvent::ActionApplied) {
            TransitionResult::Success { from, to, event, .. } => {
                assert_eq!(from, OpsPhase::Creating);
                assert_eq!(to, OpsPhase::Running);
                assert_eq!(event, OpsEvent::ActionApplied);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pending_has_three_exits() {
        let sm = OpsStateMachine::new();
        let mut events = sm.valid_events(OpsPhase::Pending);
        events.sort_by_key(|e| format!("{:?}", e));
        assert_eq!(
            events,
            vec![OpsEvent::Admitted, OpsEvent::Cancelled, OpsEvent::Failed]
        );
    }
}

mod event_for_target_tests {
    use super::*;

    #[test]
    fn test_event_for_target_reaches_the_target() {
        let sm = OpsStateMachine::new();
        let sources = [
            (OpsPhase::Creating, OpsPhase::Pending),
            (OpsPhase::Running, OpsPhase::Creating),
            (OpsPhase::Succeed, OpsPhase::Running),
            (OpsPhase::Failed, OpsPhase::Running),
            (OpsPhase::Cancelled, OpsPhase::Pending),
        ];
        for (target, from) in sources {
            let event = event_for_target(target).unwrap();
            match sm.transition(from, event) {
                TransitionResult::Success { to, .. } => assert_eq!(to, target),
                other => panic!("{:?} -> {:?}: {:?}", from, target, other),
            }
        }
    }

    #[test]
    fn test_nothing_moves_back_to_pending() {
        assert_eq!(event_for_target(OpsPhase::Pending), None);
    }
}
