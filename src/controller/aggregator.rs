//! Progress aggregator: folds child objects into `(expected, completed, succeeded)`.
//!
//! The functions here are pure over snapshots of pods and the cluster, so a
//! reconcile can list objects once and feed them through. Handlers pick the
//! rule set (all pods, scaling sets, or their own objects) and merge the
//! per-component summaries into the request's progress string.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::controller::progress::{
    ProgressEvent, detail, failed_message, object_key, processing_message, set_progress_detail,
    succeed_message,
};
use crate::crd::{
    Cluster, ClusterPhase, ComponentPhase, ComponentStatus, OpsPhase, OpsRequestComponentStatus,
    ProgressStatus, ProgressStatusDetail, format_time, from_k8s_time, parse_time,
};

pub const POD_KIND: &str = "Pod";

/// Progress counts of one component or a whole request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub expected: i32,
    pub completed: i32,
    pub succeeded: i32,
}

impl ProgressSummary {
    pub fn new(expected: i32, completed: i32, succeeded: i32) -> Self {
        Self {
            expected,
            completed,
            succeeded,
        }
    }

    pub fn merge(&mut self, other: ProgressSummary) {
        self.expected += other.expected;
        self.completed += other.completed;
        self.succeeded += other.succeeded;
    }

    pub fn failed(&self) -> i32 {
        self.completed - self.succeeded
    }

    /// Every expected object reached a terminal status
    pub fn is_complete(&self) -> bool {
        self.completed >= self.expected
    }

    /// Terminal phase once complete: Succeed only when nothing failed
    pub fn verdict(&self, component_failed: bool) -> Option<OpsPhase> {
        if !self.is_complete() {
            return None;
        }
        if component_failed || self.failed() > 0 {
            Some(OpsPhase::Failed)
        } else {
            Some(OpsPhase::Succeed)
        }
    }
}

impl std::fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.completed, self.expected)
    }
}

/// One concrete component a target resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedComponent {
    /// Component name as it appears in cluster status and pod labels
    pub name: String,
    /// Sharding group, when the target names one
    pub group: Option<String>,
}

/// Resolve a target name to the plain component or the discovered shards of a sharding group
pub fn resolve_components(cluster: &Cluster, target: &str) -> Vec<ResolvedComponent> {
    if cluster.sharding(target).is_some() {
        return cluster
            .shard_components(target)
            .into_iter()
            .map(|name| ResolvedComponent {
                name,
                group: Some(target.to_string()),
            })
            .collect();
    }
    vec![ResolvedComponent {
        name: target.to_string(),
        group: None,
    }]
}

/// The cluster controller has picked up the mutation and left the target phase
pub fn ops_processed(
    cluster: &Cluster,
    to_phase: Option<ClusterPhase>,
    cluster_generation: Option<i64>,
) -> bool {
    let left_target = to_phase.is_none_or(|p| cluster.phase() != p);
    left_target && cluster.observed(cluster_generation)
}

pub fn pod_created_at(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata.creation_timestamp.as_ref().map(from_k8s_time)
}

fn pod_deleting(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Ready for at least `min_ready_seconds`
pub fn pod_is_available(pod: &Pod, min_ready_seconds: i32, now: DateTime<Utc>) -> bool {
    if pod_deleting(pod) {
        return false;
    }
    let Some(ready) = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
    else {
        return false;
    };
    if ready.status != "True" {
        return false;
    }
    if min_ready_seconds <= 0 {
        return true;
    }
    ready
        .last_transition_time
        .as_ref()
        .map(from_k8s_time)
        .is_some_and(|t| now - t >= chrono::Duration::seconds(i64::from(min_ready_seconds)))
}

/// Inputs shared by the pod rules of one component
#[derive(Debug, Clone)]
pub struct PodRules<'a> {
    pub cluster: &'a Cluster,
    pub component: &'a str,
    pub group: Option<&'a str>,
    /// Verb used in ledger messages ("restart", "created", ...)
    pub verb: &'a str,
    pub min_ready_seconds: i32,
    pub ops_start: DateTime<Utc>,
    pub processed: bool,
    pub now: DateTime<Utc>,
}

impl PodRules<'_> {
    fn component_phase(&self) -> Option<ComponentPhase> {
        self.cluster.component_status(self.component).map(|s| s.phase)
    }

    fn created_after_start(&self, pod: &Pod) -> bool {
        pod_created_at(pod).is_some_and(|t| t >= self.ops_start)
    }

    fn succeeded(&self, pod: &Pod) -> bool {
        if !pod_is_available(pod, self.min_ready_seconds, self.now) {
            return false;
        }
        let running = self.component_phase() == Some(ComponentPhase::Running);
        (self.processed && running) || self.created_after_start(pod)
    }

    fn pending(&self, pod: &Pod) -> bool {
        !self.created_after_start(pod) && !pod_deleting(pod)
    }

    fn failed(&self, pod: &Pod) -> bool {
        let failing = self.component_phase().is_some_and(|p| p.is_failed_or_abnormal());
        failing && (self.created_after_start(pod) || self.processed)
    }

    fn pod_message(&self, pod: &Pod) -> Option<String> {
        self.cluster
            .component_status(self.component)
            .and_then(|s| s.pod_messages.get(&pod.name_any()))
            .cloned()
            .filter(|m| !m.is_empty())
    }

    fn with_group(&self, mut d: ProgressStatusDetail) -> ProgressStatusDetail {
        d.group = self.group.map(|_| self.component.to_string());
        d
    }

    /// Failed when the component is failing and the pod carries a message, else Processing
    fn failed_or_processing(&self, pod: &Pod, key: &str) -> ProgressStatusDetail {
        if self.failed(pod)
            && let Some(msg) = self.pod_message(pod)
        {
            return self.with_group(detail(
                key,
                ProgressStatus::Failed,
                failed_message(self.verb, key, self.component, &msg),
            ));
        }
        self.with_group(detail(
            key,
            ProgressStatus::Processing,
            processing_message(self.verb, key, self.component),
        ))
    }
}

/// Reject a reconcile whose pod list lags the component's replicas
pub fn check_pod_cache(rules: &PodRules<'_>, replicas: i32, pods: &[Pod]) -> Result<()> {
    let running = rules.component_phase() == Some(ComponentPhase::Running);
    if running && usize::try_from(replicas).unwrap_or(0) != pods.len() {
        return Err(Error::WaitCacheRefresh(format!(
            "pods of component {} are not synchronized",
            rules.component
        )));
    }
    Ok(())
}

/// Count the ledger records of `keys`
fn summarize(ledger: &[ProgressStatusDetail], keys: &BTreeSet<String>, expected: i32) -> ProgressSummary {
    let mut summary = ProgressSummary::new(expected, 0, 0);
    for d in ledger.iter().filter(|d| keys.contains(&d.object_key)) {
        match d.status {
            ProgressStatus::Succeed => {
                summary.completed += 1;
                summary.succeeded += 1;
            }
            ProgressStatus::Failed => summary.completed += 1,
            _ => {}
        }
    }
    summary
}

/// Track every pod of a component (restart, reconfigure with restart)
pub fn pods_progress(
    rules: &PodRules<'_>,
    replicas: i32,
    pods: &[Pod],
    ledger: &mut Vec<ProgressStatusDetail>,
    events: &mut Vec<ProgressEvent>,
) -> Result<ProgressSummary> {
    check_pod_cache(rules, replicas, pods)?;

    let mut keys = BTreeSet::new();
    for pod in pods {
        let key = object_key(POD_KIND, &pod.name_any());
        let new = if rules.succeeded(pod) {
            rules.with_group(detail(
                &key,
                ProgressStatus::Succeed,
                succeed_message(rules.verb, &key, rules.component),
            ))
        } else if rules.pending(pod) {
            rules.with_group(detail(&key, ProgressStatus::Pending, ""))
        } else {
            rules.failed_or_processing(pod, &key)
        };
        events.extend(set_progress_detail(ledger, new, rules.now));
        keys.insert(key);
    }
    Ok(summarize(ledger, &keys, replicas))
}

/// Pod names of a component: `<cluster>-<component>-<ordinal>`, skipping offline instances
pub fn generate_pod_names(
    cluster_name: &str,
    component: &str,
    replicas: i32,
    offline: &[String],
) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut ordinal = 0;
    let wanted = usize::try_from(replicas).unwrap_or(0);
    while names.len() < wanted {
        let name = format!("{}-{}-{}", cluster_name, component, ordinal);
        if !offline.contains(&name) {
            names.insert(name);
        }
        ordinal += 1;
    }
    names
}

/// Pods a scaling operation creates and deletes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalingSets {
    pub created: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl ScalingSets {
    pub fn between(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Self {
        Self {
            created: after.difference(before).cloned().collect(),
            deleted: before.difference(after).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty()
    }
}

/// Track the pods created and deleted by horizontal scaling
pub fn scaling_progress(
    rules: &PodRules<'_>,
    replicas: i32,
    pods: &[Pod],
    sets: &ScalingSets,
    ledger: &mut Vec<ProgressStatusDetail>,
    events: &mut Vec<ProgressEvent>,
) -> Result<ProgressSummary> {
    check_pod_cache(rules, replicas, pods)?;

    let mut keys = BTreeSet::new();
    for name in &sets.deleted {
        let key = object_key(POD_KIND, name);
        let new = if pods.iter().any(|p| p.name_any() == *name) {
            detail(
                &key,
                ProgressStatus::Processing,
                format!("Start to delete pod: {} in Component: {}", key, rules.component),
            )
        } else {
            detail(
                &key,
                ProgressStatus::Succeed,
                format!("Successfully deleted pod: {} in Component: {}", key, rules.component),
            )
        };
        events.extend(set_progress_detail(ledger, rules.with_group(new), rules.now));
        keys.insert(key);
    }

    let created_rules = PodRules {
        verb: "created",
        ..rules.clone()
    };
    for name in &sets.created {
        let key = object_key(POD_KIND, name);
        let new = match pods.iter().find(|p| p.name_any() == *name) {
            Some(pod) if pod_is_available(pod, rules.min_ready_seconds, rules.now) => {
                rules.with_group(detail(
                    &key,
                    ProgressStatus::Succeed,
                    succeed_message("created", &key, rules.component),
                ))
            }
            Some(pod) => created_rules.failed_or_processing(pod, &key),
            None => rules.with_group(detail(
                &key,
                ProgressStatus::Pending,
                processing_message("create", &key, rules.component),
            )),
        };
        events.extend(set_progress_detail(ledger, new, rules.now));
        keys.insert(key);
    }

    // Pods tracked earlier for this component still count
    let group = rules.group.map(|_| rules.component.to_string());
    keys.extend(
        ledger
            .iter()
            .filter(|d| d.group == group)
            .map(|d| d.object_key.clone()),
    );
    let expected = (sets.created.len() + sets.deleted.len()).max(keys.len());
    Ok(summarize(
        ledger,
        &keys,
        i32::try_from(expected).unwrap_or(i32::MAX),
    ))
}

/// Outcome of checking a targeted component's controller-reported phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentHealth {
    Healthy,
    /// Failing, but still inside the grace window; recheck after the remaining time
    Grace(Duration),
    /// Failing beyond the grace window
    Failed(String),
}

/// Record the observed phase and decide whether a failing component fails the request
pub fn check_component_health(
    status: &mut OpsRequestComponentStatus,
    observed: Option<&ComponentStatus>,
    processed: bool,
    timeout: Duration,
    now: DateTime<Utc>,
) -> ComponentHealth {
    let Some(observed) = observed else {
        return ComponentHealth::Healthy;
    };
    status.phase = Some(observed.phase);
    if !observed.phase.is_failed_or_abnormal() || !processed {
        status.last_failed_time = None;
        return ComponentHealth::Healthy;
    }

    let since = status
        .last_failed_time
        .as_deref()
        .and_then(parse_time)
        .unwrap_or(now);
    if status.last_failed_time.is_none() {
        status.last_failed_time = Some(format_time(now));
    }
    let elapsed = (now - since).to_std().unwrap_or_default();
    if elapsed < timeout {
        return ComponentHealth::Grace(timeout - elapsed);
    }
    let msg = observed
        .message
        .clone()
        .unwrap_or_else(|| format!("component is {}", observed.phase));
    status.message = Some(msg.clone());
    ComponentHealth::Failed(msg)
}
