//! Unit tests for the per-object progress ledger

use ops_operator::controller::aggregator::{ComponentHealth, check_component_health};
use ops_operator::controller::progress::{detail, object_key, set_progress_detail, tally};
use ops_operator::crd::{
    ComponentPhase, ComponentStatus, OpsRequestComponentStatus, ProgressStatus, format_time,
};
use std::time::Duration;

use crate::common::*;

mod ledger_tests {
    use super::*;

    #[test]
    fn test_processing_then_succeed_stamps_both_times() {
        let key = object_key("Pod", "pg-db-0");
        let mut ledger = Vec::new();
        set_progress_detail(&mut ledger, detail(&key, ProgressStatus::Processing, "restarting"), t0());
        let event = set_progress_detail(
            &mut ledger,
            detail(&key, ProgressStatus::Succeed, "restarted"),
            t0() + secs(30),
        )
        .unwrap();

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].start_time, Some(format_time(t0())));
        assert_eq!(ledger[0].end_time, Some(format_time(t0() + secs(30))));
        assert_eq!(event.reason, "Succeed");
        assert!(!event.warning);
    }

    #[test]
    fn test_unchanged_status_is_silent() {
        let key = object_key("Pod", "pg-db-0");
        let mut ledger = Vec::new();
        set_progress_detail(&mut ledger, detail(&key, ProgressStatus::Processing, "a"), t0());
        let event = set_progress_detail(
            &mut ledger,
            detail(&key, ProgressStatus::Processing, "b"),
            t0() + secs(5),
        );
        assert!(event.is_none());
        assert_eq!(ledger[0].message, "a");
    }

    #[test]
    fn test_failed_only_yields_to_succeed() {
        let key = object_key("PersistentVolumeClaim", "data-pg-db-0");
        let mut ledger = Vec::new();
        let failed = set_progress_detail(&mut ledger, detail(&key, ProgressStatus::Failed, "boom"), t0());
        assert!(failed.is_some_and(|e| e.warning));

        for status in [ProgressStatus::Pending, ProgressStatus::Processing] {
            assert!(set_progress_detail(&mut ledger, detail(&key, status, "retry"), t0()).is_none());
            assert_eq!(ledger[0].status, ProgressStatus::Failed);
        }
        set_progress_detail(&mut ledger, detail(&key, ProgressStatus::Succeed, "ok"), t0());
        assert_eq!(ledger[0].status, ProgressStatus::Succeed);
    }

    #[test]
    fn test_tally_counts_terminal_records() {
        let ledger = vec![
            detail("Pod/a", ProgressStatus::Succeed, ""),
            detail("Pod/b", ProgressStatus::Failed, ""),
            detail("Pod/c", ProgressStatus::Processing, ""),
            detail("Pod/d", ProgressStatus::Pending, ""),
        ];
        assert_eq!(tally(&ledger), (2, 1, 1));
    }
}

mod component_health_tests {
    use super::*;

    fn observed(phase: ComponentPhase) -> ComponentStatus {
        ComponentStatus {
            phase,
            message: Some("pod pg-db-0 crash looping".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_failure_before_processing_is_ignored() {
        let mut status = OpsRequestComponentStatus::default();
        let health = check_component_health(
            &mut status,
            Some(&observed(ComponentPhase::Failed)),
            false,
            Duration::from_secs(60),
            t0(),
        );
        assert_eq!(health, ComponentHealth::Healthy);
        assert_eq!(status.phase, Some(ComponentPhase::Failed));
        assert!(status.last_failed_time.is_none());
    }

    #[test]
    fn test_failure_outlasting_grace_fails_the_component() {
        let mut status = OpsRequestComponentStatus::default();
        let first = check_component_health(
            &mut status,
            Some(&observed(ComponentPhase::Abnormal)),
            true,
            Duration::from_secs(60),
            t0(),
        );
        assert_eq!(first, ComponentHealth::Grace(Duration::from_secs(60)));

        let later = check_component_health(
            &mut status,
            Some(&observed(ComponentPhase::Abnormal)),
            true,
            Duration::from_secs(60),
            t0() + secs(61),
        );
        assert_eq!(later, ComponentHealth::Failed("pod pg-db-0 crash looping".into()));
        assert_eq!(status.message.as_deref(), Some("pod pg-db-0 crash looping"));
    }

    #[test]
    fn test_recovery_resets_the_grace_window() {
        let mut status = OpsRequestComponentStatus::default();
        check_component_health(
            &mut status,
            Some(&observed(ComponentPhase::Failed)),
            true,
            Duration::from_secs(60),
            t0(),
        );
        check_component_health(
            &mut status,
            Some(&observed(ComponentPhase::Running)),
            true,
            Duration::from_secs(60),
            t0() + secs(30),
        );
        assert!(status.last_failed_time.is_none());
    }
}
