//! End-to-end progress scenarios driven through the pure progress rules

use std::collections::BTreeSet;
use std::time::Duration;

use ops_operator::controller::aggregator::{
    PodRules, ProgressSummary, ScalingSets, generate_pod_names, scaling_progress,
};
use ops_operator::controller::error::Error;
use ops_operator::controller::queue::{OpsQueue, QueueMode, Removal};
use ops_operator::controller::registry::{OpsKind, OpsRegistry};
use ops_operator::crd::{
    ClusterPhase, ComponentPhase, OpsPhase, OpsType, ProgressStatus, ProgressStatusDetail,
};
use ops_operator::handlers::expose::expose_progress;
use ops_operator::handlers::switchover::{
    Precheck, mark_skipped, precheck, role_converged, skip_message,
};
use ops_operator::handlers::{OpsResource, mutated_cluster};
use ops_operator::handlers::volume_expansion::{PvcRules, pvc_progress};

use crate::common::*;

fn rules<'a>(cluster: &'a ops_operator::crd::Cluster, now: chrono::DateTime<chrono::Utc>) -> PodRules<'a> {
    PodRules {
        cluster,
        component: "db",
        group: None,
        verb: "restart",
        min_ready_seconds: 0,
        ops_start: t0(),
        processed: false,
        now,
    }
}

mod horizontal_scale_in {
    use super::*;

    fn sets() -> ScalingSets {
        ScalingSets::between(
            &generate_pod_names("pg", "db", 3, &[]),
            &generate_pod_names("pg", "db", 1, &[]),
        )
    }

    #[test]
    fn test_scale_in_tracks_only_deleted_pods() {
        let sets = sets();
        assert!(sets.created.is_empty());
        assert_eq!(
            sets.deleted.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["pg-db-1", "pg-db-2"]
        );
    }

    #[test]
    fn test_scale_in_progress_while_pods_terminate() {
        let cluster = ClusterBuilder::new("pg", "default")
            .component("db", 1)
            .component_phase("db", ComponentPhase::Updating)
            .build();
        let old = t0() - secs(3600);
        let pods = vec![
            pod("pg", "db", "pg-db-0", old, true),
            pod("pg", "db", "pg-db-1", old, true),
            pod("pg", "db", "pg-db-2", old, true),
        ];
        let mut ledger: Vec<ProgressStatusDetail> = Vec::new();
        let mut events = Vec::new();
        let summary = scaling_progress(
            &rules(&cluster, t0() + secs(5)),
            1,
            &pods,
            &sets(),
            &mut ledger,
            &mut events,
        )
        .unwrap();

        assert_eq!(summary, ProgressSummary::new(2, 0, 0));
        assert_eq!(summary.verdict(false), None);
        assert!(ledger.iter().all(|d| d.status == ProgressStatus::Processing));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_scale_in_three_to_one_reports_two_of_two() {
        let cluster = ClusterBuilder::new("pg", "default").component("db", 1).build();
        let pods = vec![pod("pg", "db", "pg-db-0", t0() - secs(3600), true)];
        let mut ledger = Vec::new();
        let mut events = Vec::new();
        let summary = scaling_progress(
            &rules(&cluster, t0() + secs(60)),
            1,
            &pods,
            &sets(),
            &mut ledger,
            &mut events,
        )
        .unwrap();

        assert_eq!(summary.to_string(), "2/2");
        assert_eq!(summary.verdict(false), Some(OpsPhase::Succeed));
        assert!(ledger.iter().all(|d| d.status == ProgressStatus::Succeed));
        assert!(ledger.iter().any(|d| d.object_key == "Pod/pg-db-2"));
    }

    #[test]
    fn test_stale_pod_list_waits_for_cache() {
        let cluster = ClusterBuilder::new("pg", "default").component("db", 1).build();
        let old = t0() - secs(3600);
        let pods = vec![
            pod("pg", "db", "pg-db-0", old, true),
            pod("pg", "db", "pg-db-1", old, true),
        ];
        let err = scaling_progress(
            &rules(&cluster, t0()),
            1,
            &pods,
            &sets(),
            &mut Vec::new(),
            &mut Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::WaitCacheRefresh(_)));
    }
}

mod switchover_to_current_primary {
    use super::*;

    fn pods() -> Vec<k8s_openapi::api::core::v1::Pod> {
        let created = t0() - secs(600);
        vec![
            with_role(pod("pg", "db", "pg-db-0", created, true), "primary"),
            with_role(pod("pg", "db", "pg-db-1", created, true), "secondary"),
        ]
    }

    #[test]
    fn test_candidate_already_primary_is_skipped() {
        let cluster = ClusterBuilder::new("pg", "default")
            .component("db", 2)
            .with_primary_secondary_roles("db")
            .build();
        let roles = &cluster.component_spec("db").unwrap().roles;

        assert_eq!(precheck("db", "pg-db-0", &pods(), roles).unwrap(), Precheck::Skip);
        assert_eq!(
            skip_message("db"),
            "This component db is already in the expected state, skip the switchover operation"
        );
    }

    #[test]
    fn test_other_candidate_switches_from_current() {
        let cluster = ClusterBuilder::new("pg", "default")
            .component("db", 2)
            .with_primary_secondary_roles("db")
            .build();
        let roles = &cluster.component_spec("db").unwrap().roles;
        assert_eq!(
            precheck("db", "pg-db-1", &pods(), roles).unwrap(),
            Precheck::Switch {
                current: "pg-db-0".into()
            }
        );

        let created = t0() - secs(600);
        let after = vec![
            with_role(pod("pg", "db", "pg-db-0", created, true), "secondary"),
            with_role(pod("pg", "db", "pg-db-1", created, true), "primary"),
        ];
        assert!(!role_converged("db", &pods(), roles, "pg-db-1", "pg-db-0").unwrap());
        assert!(role_converged("db", &after, roles, "pg-db-1", "pg-db-0").unwrap());
        assert!(role_converged("db", &after, roles, "*", "pg-db-0").unwrap());
    }

    #[test]
    fn test_fully_skipped_switchover_leaves_cluster_phase_alone() {
        let cluster = ClusterBuilder::new("pg", "default")
            .component("db", 2)
            .component("proxy", 2)
            .with_primary_secondary_roles("db")
            .with_primary_secondary_roles("proxy")
            .build();
        let behaviour = OpsRegistry::new().get(OpsType::Switchover).cloned().unwrap();
        let ops = OpsRequestBuilder::new("switch", "default", "pg", OpsType::Switchover)
            .switchover("db", "pg-db-0")
            .switchover("proxy", "pg-proxy-1")
            .build();
        let mut res = OpsResource::new(ops, cluster, behaviour, t0());

        let db = res.ops.spec.switchover[0].clone();
        mark_skipped(&mut res, &db, "Job/switch-switchover-db");
        assert!(mutated_cluster(OpsKind::Switchover, &res));

        let proxy = res.ops.spec.switchover[1].clone();
        mark_skipped(&mut res, &proxy, "Job/switch-switchover-proxy");
        assert!(!mutated_cluster(OpsKind::Switchover, &res));
        assert!(mutated_cluster(OpsKind::Restart, &res));
    }
}

mod queued_requests {
    use super::*;

    #[test]
    fn test_second_cluster_request_waits_for_the_first() {
        let registry = OpsRegistry::new();
        let restart = registry.get(OpsType::Restart).unwrap();
        let scale = registry.get(OpsType::HorizontalScaling).unwrap();
        let mut queue = OpsQueue::default();

        let first = queue
            .enqueue("restart-db", OpsType::Restart, restart.to_cluster_phase, restart.queue_mode, false)
            .unwrap();
        let second = queue
            .enqueue(
                "scale-db",
                OpsType::HorizontalScaling,
                scale.to_cluster_phase,
                scale.queue_mode,
                false,
            )
            .unwrap();
        assert!(!first.in_queue);
        assert!(second.in_queue);
        assert_eq!(first.to_cluster_phase, Some(ClusterPhase::Updating));

        let out = queue.dequeue("restart-db", Removal::Succeed);
        assert_eq!(out.promoted.as_deref(), Some("scale-db"));
        assert!(queue.get("scale-db").is_some_and(|r| !r.in_queue));
        assert_eq!(queue.waiting().count(), 0);
    }

    #[test]
    fn test_failed_request_cancels_cluster_waiters() {
        let mut queue = OpsQueue::default();
        for name in ["restart-db", "scale-db", "restart-again"] {
            queue
                .enqueue(name, OpsType::Restart, None, QueueMode::ByCluster, false)
                .unwrap();
        }
        let out = queue.dequeue("restart-db", Removal::Failed);
        assert_eq!(out.cancelled, vec!["scale-db".to_string(), "restart-again".to_string()]);
        assert_eq!(out.promoted, None);
        assert!(queue.is_empty());
    }
}

mod volume_expansion_timeout {
    use super::*;

    fn claims_of(n: i32) -> BTreeSet<String> {
        generate_pod_names("pg", "db", n, &[])
            .iter()
            .map(|pod| format!("data-{}", pod))
            .collect()
    }

    fn pvc_rules(now: chrono::DateTime<chrono::Utc>) -> PvcRules<'static> {
        PvcRules {
            component: "db",
            group: "db.data".into(),
            requested: "20Gi",
            ops_start: t0(),
            timeout: Duration::from_secs(30 * 60),
            now,
        }
    }

    #[test]
    fn test_waiting_claim_stays_pending_before_timeout() {
        let claims = vec![pvc("data-pg-db-0", "20Gi", "10Gi")];
        let mut ledger = Vec::new();
        let summary = pvc_progress(&pvc_rules(t0() + secs(600)), &claims_of(1), &claims, &mut ledger, &mut Vec::new());
        assert_eq!(summary, ProgressSummary::new(1, 0, 0));
        assert_eq!(ledger[0].status, ProgressStatus::Pending);
        assert_eq!(ledger[0].group.as_deref(), Some("db.data"));
    }

    #[test]
    fn test_claim_fails_once_the_timeout_passes() {
        let claims = vec![pvc("data-pg-db-0", "20Gi", "10Gi")];
        let mut ledger = Vec::new();
        pvc_progress(&pvc_rules(t0() + secs(600)), &claims_of(1), &claims, &mut ledger, &mut Vec::new());
        let summary = pvc_progress(
            &pvc_rules(t0() + secs(31 * 60)),
            &claims_of(1),
            &claims,
            &mut ledger,
            &mut Vec::new(),
        );

        assert_eq!(summary.to_string(), "1/1");
        assert_eq!(summary.verdict(false), Some(OpsPhase::Failed));
        assert_eq!(ledger[0].status, ProgressStatus::Failed);
        assert!(ledger[0].message.contains(
            "Timed out waiting for volume expansion to complete, the timeout value is 30 minutes"
        ));
    }

    #[test]
    fn test_expanded_claim_succeeds() {
        let claims = vec![
            pvc("data-pg-db-0", "20Gi", "20Gi"),
            pvc("data-pg-db-1", "20Gi", "10Gi"),
        ];
        let mut ledger = Vec::new();
        let summary = pvc_progress(&pvc_rules(t0() + secs(60)), &claims_of(2), &claims, &mut ledger, &mut Vec::new());
        assert_eq!(summary, ProgressSummary::new(2, 1, 1));
    }

    #[test]
    fn test_missing_claim_waits_then_fails() {
        let claims = vec![pvc("data-pg-db-0", "20Gi", "20Gi")];
        let mut ledger = Vec::new();
        let summary = pvc_progress(
            &pvc_rules(t0() + secs(60)),
            &claims_of(2),
            &claims,
            &mut ledger,
            &mut Vec::new(),
        );
        assert_eq!(summary, ProgressSummary::new(2, 1, 1));
        let missing = ledger
            .iter()
            .find(|d| d.object_key == "PersistentVolumeClaim/data-pg-db-1")
            .unwrap();
        assert_eq!(missing.status, ProgressStatus::Pending);

        let summary = pvc_progress(
            &pvc_rules(t0() + secs(5 * 3600)),
            &claims_of(2),
            &claims,
            &mut ledger,
            &mut Vec::new(),
        );
        assert_eq!(summary.to_string(), "2/2");
        assert_eq!(summary.verdict(false), Some(OpsPhase::Failed));
        let missing = ledger
            .iter()
            .find(|d| d.object_key == "PersistentVolumeClaim/data-pg-db-1")
            .unwrap();
        assert_eq!(missing.status, ProgressStatus::Failed);
        assert!(missing.message.contains("the pvc is not found"));
    }
}

mod expose_services {
    use super::*;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Service, ServiceStatus};
    use ops_operator::crd::{Expose, ExposeSwitch, OpsService, ServiceType};

    fn expose(switch: ExposeSwitch) -> Expose {
        Expose {
            component_name: "db".into(),
            switch,
            services: vec![
                OpsService {
                    name: "internet".into(),
                    service_type: ServiceType::LoadBalancer,
                    role_selector: Some("primary".into()),
                    ..Default::default()
                },
                OpsService {
                    name: "vpc".into(),
                    role_selector: Some("primary".into()),
                    ..Default::default()
                },
            ],
        }
    }

    fn service(name: &str, address: Option<&str>) -> Service {
        let mut svc = Service::default();
        svc.metadata.name = Some(name.to_string());
        svc.status = address.map(|ip| ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some(ip.to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        svc
    }

    #[test]
    fn test_load_balancer_counts_once_it_has_an_address() {
        let mut ledger = Vec::new();
        let mut events = Vec::new();
        let pending = vec![service("pg-db-internet", None), service("pg-db-vpc", None)];
        let summary =
            expose_progress("pg", &expose(ExposeSwitch::Enable), &pending, &mut ledger, &mut events, t0());
        assert_eq!(summary, ProgressSummary::new(2, 1, 1));
        assert_eq!(summary.verdict(false), None);
        let internet = ledger
            .iter()
            .find(|d| d.object_key == "Service/pg-db-internet")
            .unwrap();
        assert_eq!(internet.status, ProgressStatus::Processing);

        let ready = vec![
            service("pg-db-internet", Some("34.1.2.3")),
            service("pg-db-vpc", None),
        ];
        let summary =
            expose_progress("pg", &expose(ExposeSwitch::Enable), &ready, &mut ledger, &mut events, t0() + secs(30));
        assert_eq!(summary.to_string(), "2/2");
        assert_eq!(summary.verdict(false), Some(OpsPhase::Succeed));
        assert!(ledger.iter().all(|d| d.status == ProgressStatus::Succeed));
    }

    #[test]
    fn test_disable_waits_for_the_service_to_go() {
        let mut ledger = Vec::new();
        let mut events = Vec::new();
        let still_there = vec![service("pg-db-internet", Some("34.1.2.3"))];
        let summary = expose_progress(
            "pg",
            &expose(ExposeSwitch::Disable),
            &still_there,
            &mut ledger,
            &mut events,
            t0(),
        );
        assert_eq!(summary.to_string(), "1/2");

        let summary =
            expose_progress("pg", &expose(ExposeSwitch::Disable), &[], &mut ledger, &mut events, t0());
        assert_eq!(summary.verdict(false), Some(OpsPhase::Succeed));
    }
}
