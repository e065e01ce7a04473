//! Unit tests for request validation and the cluster phase gate

use ops_operator::controller::queue::OpsQueue;
use ops_operator::controller::registry::{OpsKind, OpsRegistry};
use ops_operator::controller::validation::{
    PHASE_WAIT_REQUEUE, PhaseCheck, check_cluster_phase, validate_ops_request,
};
use ops_operator::crd::{
    ClusterComponentSpec, ClusterPhase, OpsPhase, OpsType, ShardingSpec,
};

use crate::common::*;

fn gate(kind: OpsKind, ops: &ops_operator::crd::OpsRequest, phase: ClusterPhase) -> PhaseCheck {
    let registry = OpsRegistry::new();
    let behaviour = registry.get(kind.ops_type()).unwrap();
    let cluster = ClusterBuilder::new("pg", "default")
        .component("db", 3)
        .phase(phase)
        .build();
    check_cluster_phase(ops, &cluster, behaviour, &OpsQueue::default(), t0() + secs(1))
}

mod payload_tests {
    use super::*;

    #[test]
    fn test_known_components_pass() {
        let cluster = ClusterBuilder::new("pg", "default")
            .component("db", 3)
            .component("proxy", 2)
            .build();
        let ops = OpsRequestBuilder::new("restart", "default", "pg", OpsType::Restart)
            .restart("db")
            .restart("proxy")
            .build();
        assert!(validate_ops_request(&ops, &cluster).is_ok());
    }

    #[test]
    fn test_sharding_group_is_a_valid_target() {
        let mut cluster = ClusterBuilder::new("pg", "default").build();
        cluster.spec.shardings.push(ShardingSpec {
            name: "shard".into(),
            shards: 2,
            template: ClusterComponentSpec {
                name: "shard".into(),
                replicas: 2,
                ..Default::default()
            },
        });
        let ops = OpsRequestBuilder::new("scale", "default", "pg", OpsType::HorizontalScaling)
            .horizontal_scaling("shard", 3)
            .build();
        assert!(validate_ops_request(&ops, &cluster).is_ok());
    }

    #[test]
    fn test_unknown_component_is_rejected() {
        let cluster = ClusterBuilder::new("pg", "default").component("db", 3).build();
        let ops = OpsRequestBuilder::new("expand", "default", "pg", OpsType::VolumeExpansion)
            .volume_expansion("cache", "data", "20Gi")
            .build();
        let err = validate_ops_request(&ops, &cluster).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("component cache not found in cluster pg"));
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let cluster = ClusterBuilder::new("pg", "default").component("db", 3).build();
        let ops = OpsRequestBuilder::new("switch", "default", "pg", OpsType::Switchover).build();
        let err = validate_ops_request(&ops, &cluster).unwrap_err();
        assert!(err.to_string().contains("names no components"));
    }

    #[test]
    fn test_duplicate_component_is_rejected() {
        let cluster = ClusterBuilder::new("pg", "default").component("db", 3).build();
        let ops = OpsRequestBuilder::new("switch", "default", "pg", OpsType::Switchover)
            .switchover("db", "pg-db-1")
            .switchover("db", "pg-db-2")
            .build();
        let err = validate_ops_request(&ops, &cluster).unwrap_err();
        assert!(err.to_string().contains("listed more than once"));
    }
}

mod phase_gate_tests {
    use super::*;

    #[test]
    fn test_restart_requires_an_up_cluster() {
        let ops = OpsRequestBuilder::new("restart", "default", "pg", OpsType::Restart)
            .restart("db")
            .build();
        for phase in [ClusterPhase::Running, ClusterPhase::Failed, ClusterPhase::Abnormal] {
            assert_eq!(gate(OpsKind::Restart, &ops, phase), PhaseCheck::Allowed);
        }
        let rejected = gate(OpsKind::Restart, &ops, ClusterPhase::Stopped);
        assert_eq!(
            rejected,
            PhaseCheck::Rejected(
                "OpsRequest.spec.type=Restart is forbidden when Cluster.status.phase=Stopped".into()
            )
        );
    }

    #[test]
    fn test_volume_expansion_runs_from_any_phase() {
        let ops = OpsRequestBuilder::new("expand", "default", "pg", OpsType::VolumeExpansion)
            .volume_expansion("db", "data", "20Gi")
            .build();
        for phase in [ClusterPhase::Stopped, ClusterPhase::Updating, ClusterPhase::Creating] {
            assert_eq!(gate(OpsKind::VolumeExpansion, &ops, phase), PhaseCheck::Allowed);
        }
    }

    #[test]
    fn test_rebuild_is_for_broken_clusters() {
        let ops = OpsRequestBuilder::new("rebuild", "default", "pg", OpsType::RebuildInstance).build();
        assert!(matches!(
            gate(OpsKind::RebuildInstance, &ops, ClusterPhase::Running),
            PhaseCheck::Rejected(_)
        ));
        assert_eq!(
            gate(OpsKind::RebuildInstance, &ops, ClusterPhase::Abnormal),
            PhaseCheck::Allowed
        );
    }

    #[test]
    fn test_deadline_turns_rejection_into_waiting() {
        let mut ops = OpsRequestBuilder::new("scale", "default", "pg", OpsType::HorizontalScaling)
            .horizontal_scaling("db", 5)
            .build();
        ops.spec.pre_condition_deadline_seconds = Some(60);
        assert_eq!(
            gate(OpsKind::HorizontalScaling, &ops, ClusterPhase::Updating),
            PhaseCheck::Wait(PHASE_WAIT_REQUEUE)
        );
    }

    #[test]
    fn test_gate_only_applies_to_pending_requests() {
        let ops = OpsRequestBuilder::new("restart", "default", "pg", OpsType::Restart)
            .restart("db")
            .phase(OpsPhase::Running)
            .build();
        assert_eq!(
            gate(OpsKind::Restart, &ops, ClusterPhase::Stopped),
            PhaseCheck::Allowed
        );
    }

    #[test]
    fn test_force_skips_the_gate() {
        let ops = OpsRequestBuilder::new("restart", "default", "pg", OpsType::Restart)
            .restart("db")
            .force()
            .build();
        assert_eq!(gate(OpsKind::Restart, &ops, ClusterPhase::Stopped), PhaseCheck::Allowed);
    }
}
