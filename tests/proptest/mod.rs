// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for the admission queue, the progress ledger and
//! the phase state machine
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. The queue never admits two conflicting requests and never outgrows its capacity
//! 2. A failed request cancels exactly the cluster-wide waiters
//! 3. Progress tracking is idempotent and failures are sticky
//! 4. The state machine only ever moves forward

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeSet;

use proptest::prelude::*;

use common::*;
use ops_operator::controller::aggregator::{
    PodRules, ProgressSummary, ScalingSets, generate_pod_names, pods_progress, scaling_progress,
};
use ops_operator::controller::progress::{detail, set_progress_detail};
use ops_operator::controller::queue::{OpsQueue, QUEUE_CAPACITY, QueueMode, Removal};
use ops_operator::controller::registry::OpsRegistry;
use ops_operator::controller::state_machine::{OpsEvent, OpsStateMachine, TransitionResult};
use ops_operator::crd::{ComponentPhase, OpsPhase, OpsType, ProgressStatus};

// =============================================================================
// Strategy generators
// =============================================================================

/// Queued kinds with their registered queue behaviour
fn queued_type() -> impl Strategy<Value = OpsType> {
    prop_oneof![
        Just(OpsType::HorizontalScaling),
        Just(OpsType::Restart),
        Just(OpsType::Switchover),
        Just(OpsType::Reconfiguring),
        Just(OpsType::RebuildInstance),
        Just(OpsType::VolumeExpansion),
    ]
}

fn removal() -> impl Strategy<Value = Removal> {
    prop_oneof![
        Just(Removal::Succeed),
        Just(Removal::Failed),
        Just(Removal::Cancelled),
        Just(Removal::Deleted),
    ]
}

#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue(OpsType),
    /// Remove the record at this index (modulo the queue length)
    Dequeue(usize, Removal),
}

fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        3 => queued_type().prop_map(QueueOp::Enqueue),
        2 => (0..32usize, removal()).prop_map(|(i, r)| QueueOp::Dequeue(i, r)),
    ]
}

fn progress_status() -> impl Strategy<Value = ProgressStatus> {
    prop_oneof![
        Just(ProgressStatus::Pending),
        Just(ProgressStatus::Processing),
        Just(ProgressStatus::Succeed),
        Just(ProgressStatus::Failed),
    ]
}

fn component_phase() -> impl Strategy<Value = ComponentPhase> {
    prop_oneof![
        Just(ComponentPhase::Running),
        Just(ComponentPhase::Updating),
        Just(ComponentPhase::Failed),
        Just(ComponentPhase::Abnormal),
    ]
}

fn ops_event() -> impl Strategy<Value = OpsEvent> {
    prop_oneof![
        Just(OpsEvent::Admitted),
        Just(OpsEvent::ActionApplied),
        Just(OpsEvent::Completed),
        Just(OpsEvent::Failed),
        Just(OpsEvent::Cancelled),
    ]
}

/// (created seconds relative to the ops start, ready)
fn pod_states(max: usize) -> impl Strategy<Value = Vec<(i64, bool)>> {
    prop::collection::vec((-600i64..600, any::<bool>()), 1..=max)
}

// =============================================================================
// Helpers
// =============================================================================

fn mode_of(type_: OpsType) -> QueueMode {
    OpsRegistry::new()
        .get(type_)
        .map(|b| b.queue_mode)
        .unwrap_or(QueueMode::None)
}

/// Admitted records never conflict with each other
fn assert_exclusion(queue: &OpsQueue) {
    let admitted: Vec<_> = queue.records().iter().filter(|r| !r.in_queue).collect();
    let cluster_wide = admitted.iter().filter(|r| !r.queue_by_self).count();
    assert!(cluster_wide <= 1, "{} cluster-wide requests admitted", cluster_wide);

    let mut self_types = BTreeSet::new();
    for r in admitted.iter().filter(|r| r.queue_by_self) {
        assert!(
            self_types.insert(r.type_.to_string()),
            "two {} requests admitted",
            r.type_
        );
    }

    let names: BTreeSet<_> = queue.records().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names.len(), queue.len());
    assert!(queue.len() <= QUEUE_CAPACITY);
}

fn rank(phase: OpsPhase) -> u8 {
    match phase {
        OpsPhase::Pending => 0,
        OpsPhase::Creating => 1,
        OpsPhase::Running => 2,
        OpsPhase::Succeed | OpsPhase::Failed | OpsPhase::Cancelled => 3,
    }
}

// =============================================================================
// Property tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Any interleaving of enqueues and removals keeps admitted requests exclusive
    #[test]
    fn prop_queue_exclusion_and_capacity(ops in prop::collection::vec(queue_op(), 1..80)) {
        let mut queue = OpsQueue::default();
        let mut next = 0;
        for op in ops {
            match op {
                QueueOp::Enqueue(type_) => {
                    let name = format!("ops-{}", next);
                    next += 1;
                    let before = queue.len();
                    match queue.enqueue(&name, type_, None, mode_of(type_), false) {
                        Ok(_) => prop_assert_eq!(queue.len(), before + 1),
                        Err(_) => prop_assert_eq!(before, QUEUE_CAPACITY),
                    }
                }
                QueueOp::Dequeue(idx, removal) => {
                    if queue.is_empty() {
                        continue;
                    }
                    let name = queue.records()[idx % queue.len()].name.clone();
                    let out = queue.dequeue(&name, removal);
                    prop_assert!(out.removed.is_some());
                    prop_assert!(queue.get(&name).is_none());
                }
            }
            assert_exclusion(&queue);
        }
    }

    /// A failure cancels every waiting cluster-wide request and nothing else
    #[test]
    fn prop_failure_cascade_scope(types in prop::collection::vec(queued_type(), 2..20)) {
        let mut queue = OpsQueue::default();
        for (i, type_) in types.iter().enumerate() {
            queue.enqueue(&format!("ops-{}", i), *type_, None, mode_of(*type_), false).unwrap();
        }
        let Some(failing) = queue.records().iter().find(|r| !r.in_queue).map(|r| r.name.clone()) else {
            return Ok(());
        };
        let expected: Vec<String> = queue
            .records()
            .iter()
            .filter(|r| r.in_queue && !r.queue_by_self)
            .map(|r| r.name.clone())
            .collect();
        let survivors: Vec<String> = queue
            .records()
            .iter()
            .filter(|r| r.name != failing && (r.queue_by_self || !r.in_queue))
            .map(|r| r.name.clone())
            .collect();

        let out = queue.dequeue(&failing, Removal::Failed);
        prop_assert_eq!(out.cancelled, expected);
        prop_assert!(queue.records().iter().all(|r| r.queue_by_self || !r.in_queue));
        let left: Vec<String> = queue.records().iter().map(|r| r.name.clone()).collect();
        prop_assert_eq!(left, survivors);
    }

    /// Non-failure removals never cancel anything
    #[test]
    fn prop_only_failure_cascades(
        types in prop::collection::vec(queued_type(), 1..20),
        removal in prop_oneof![Just(Removal::Succeed), Just(Removal::Cancelled), Just(Removal::Deleted)],
    ) {
        let mut queue = OpsQueue::default();
        for (i, type_) in types.iter().enumerate() {
            queue.enqueue(&format!("ops-{}", i), *type_, None, mode_of(*type_), false).unwrap();
        }
        let before = queue.len();
        let out = queue.dequeue("ops-0", removal);
        prop_assert!(out.cancelled.is_empty());
        prop_assert_eq!(queue.len(), before - 1);
    }

    /// The ledger keeps Failed until a Succeed arrives
    #[test]
    fn prop_failed_is_sticky(statuses in prop::collection::vec(progress_status(), 1..30)) {
        let mut ledger = Vec::new();
        let mut model: Option<ProgressStatus> = None;
        for (i, status) in statuses.into_iter().enumerate() {
            let now = t0() + secs(i as i64);
            let event = set_progress_detail(&mut ledger, detail("Pod/pg-db-0", status, "m"), now);
            let next = match model {
                Some(ProgressStatus::Failed) if status != ProgressStatus::Succeed => ProgressStatus::Failed,
                _ => status,
            };
            let changed = model != Some(next);
            model = Some(next);

            prop_assert_eq!(ledger.len(), 1);
            prop_assert_eq!(ledger[0].status, next);
            prop_assert_eq!(event.is_some(), changed && next != ProgressStatus::Pending);
        }
    }

    /// Re-running pod tracking on the same observation changes nothing
    #[test]
    fn prop_pods_progress_is_idempotent(
        pods in pod_states(6),
        phase in component_phase(),
        processed in any::<bool>(),
    ) {
        let replicas = pods.len() as i32;
        let cluster = ClusterBuilder::new("pg", "default")
            .component("db", replicas)
            .component_phase("db", phase)
            .pod_message("db", "pg-db-0", "OOMKilled")
            .build();
        let pods: Vec<_> = pods
            .iter()
            .enumerate()
            .map(|(i, (created, ready))| pod("pg", "db", &format!("pg-db-{}", i), t0() + secs(*created), *ready))
            .collect();
        let rules = PodRules {
            cluster: &cluster,
            component: "db",
            group: None,
            verb: "restart",
            min_ready_seconds: 0,
            ops_start: t0(),
            processed,
            now: t0() + secs(900),
        };

        let mut ledger = Vec::new();
        let first = pods_progress(&rules, replicas, &pods, &mut ledger, &mut Vec::new()).unwrap();
        let snapshot = ledger.clone();
        let mut events = Vec::new();
        let second = pods_progress(&rules, replicas, &pods, &mut ledger, &mut events).unwrap();

        prop_assert_eq!(first, second);
        prop_assert_eq!(ledger, snapshot);
        prop_assert!(events.is_empty());
        prop_assert!(first.succeeded <= first.completed);
        prop_assert!(first.completed <= first.expected);
    }

    /// Once scaling converges every created and deleted pod counts as done
    #[test]
    fn prop_converged_scaling_completes(before in 1..8i32, after in 1..8i32) {
        let cluster = ClusterBuilder::new("pg", "default").component("db", after).build();
        let sets = ScalingSets::between(
            &generate_pod_names("pg", "db", before, &[]),
            &generate_pod_names("pg", "db", after, &[]),
        );
        let pods: Vec<_> = generate_pod_names("pg", "db", after, &[])
            .iter()
            .map(|name| pod("pg", "db", name, t0() + secs(10), true))
            .collect();
        let rules = PodRules {
            cluster: &cluster,
            component: "db",
            group: None,
            verb: "scale",
            min_ready_seconds: 0,
            ops_start: t0(),
            processed: true,
            now: t0() + secs(120),
        };

        let summary = scaling_progress(&rules, after, &pods, &sets, &mut Vec::new(), &mut Vec::new()).unwrap();
        let changed = (before - after).abs();
        prop_assert_eq!(summary, ProgressSummary::new(changed, changed, changed));
        prop_assert_eq!(summary.verdict(false), Some(OpsPhase::Succeed));
    }

    /// A verdict exists only once every object is done, and any failure fails the request
    #[test]
    fn prop_verdict(expected in 0..20i32, done in 0..20i32, ok in 0..20i32, component_failed in any::<bool>()) {
        let completed = done.min(expected);
        let succeeded = ok.min(completed);
        let summary = ProgressSummary::new(expected, completed, succeeded);
        match summary.verdict(component_failed) {
            None => prop_assert!(completed < expected),
            Some(OpsPhase::Succeed) => {
                prop_assert_eq!(completed, expected);
                prop_assert_eq!(succeeded, completed);
                prop_assert!(!component_failed);
            }
            Some(OpsPhase::Failed) => prop_assert!(succeeded < completed || component_failed),
            Some(other) => prop_assert!(false, "unexpected verdict {:?}", other),
        }
    }

    /// Phases only move forward and terminal phases absorb every event
    #[test]
    fn prop_state_machine_is_monotonic(events in prop::collection::vec(ops_event(), 0..20)) {
        let sm = OpsStateMachine::new();
        let mut phase = OpsPhase::Pending;
        for event in events {
            match sm.transition(phase, event) {
                TransitionResult::Success { from, to, .. } => {
                    prop_assert_eq!(from, phase);
                    prop_assert!(!phase.is_terminal());
                    prop_assert!(rank(to) > rank(from));
                    phase = to;
                }
                TransitionResult::InvalidTransition { current, .. } => prop_assert_eq!(current, phase),
            }
        }
    }
}
