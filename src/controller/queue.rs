//! Admission and mutual-exclusion queue.
//!
//! The queue of in-flight requests is persisted on the Cluster under the
//! `ops.smoketurner.com/ops-queue` annotation. [`OpsQueue`] is a plain value
//! with pure operations; a [`QueueStore`] loads it together with a version
//! and writes it back with compare-and-swap, and [`update_queue`] retries the
//! read-modify-write cycle on conflict. No in-process lock is involved: every
//! request actor coordinates with the others only through the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::{Cluster, ClusterPhase, OpsType, annotations};

/// Maximum number of records a cluster queue holds
pub const QUEUE_CAPACITY: usize = 20;

/// Attempts of one read-modify-write cycle before giving up
pub const MAX_CAS_ATTEMPTS: u32 = 5;

/// How a request kind excludes others
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Never queued
    None,
    /// Waits for every other cluster-scoped request
    ByCluster,
    /// Waits only for requests of the same type
    BySelf,
}

/// One in-flight request on a cluster
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: OpsType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_cluster_phase: Option<ClusterPhase>,
    #[serde(default)]
    pub queue_by_self: bool,
    /// Still waiting for admission
    #[serde(default)]
    pub in_queue: bool,
}

impl QueueRecord {
    /// Would this record have to wait behind the admitted record `other`
    fn blocked_by(&self, other: &QueueRecord) -> bool {
        if other.in_queue || other.name == self.name {
            return false;
        }
        if self.queue_by_self {
            other.type_ == self.type_
        } else {
            !other.queue_by_self
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("the ops queue is full")]
pub struct QueueFull;

/// Why a record leaves the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Succeed,
    Failed,
    Cancelled,
    /// The request object was deleted; never cascades
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DequeueOutcome {
    pub removed: Option<QueueRecord>,
    /// Request admitted because the removal unblocked it
    pub promoted: Option<String>,
    /// Waiting requests cancelled because the removed request failed
    pub cancelled: Vec<String>,
}

/// FIFO queue of in-flight requests on one cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct OpsQueue {
    records: Vec<QueueRecord>,
}

impl OpsQueue {
    /// Parse the annotation value; absence is an empty queue
    pub fn from_annotation(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(Self::default()),
            Some(v) if v.trim().is_empty() => Ok(Self::default()),
            Some(v) => Ok(serde_json::from_str(v)?),
        }
    }

    pub fn to_annotation(&self) -> Result<Option<String>> {
        if self.records.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string(&self.records)?))
    }

    pub fn from_cluster(cluster: &Cluster) -> Result<Self> {
        let value = cluster
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::OPS_QUEUE));
        Self::from_annotation(value.map(String::as_str))
    }

    pub fn records(&self) -> &[QueueRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&QueueRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Requests still waiting for admission
    pub fn waiting(&self) -> impl Iterator<Item = &QueueRecord> {
        self.records.iter().filter(|r| r.in_queue)
    }

    fn blocked(&self, record: &QueueRecord) -> bool {
        self.records.iter().any(|other| record.blocked_by(other))
    }

    /// Whether `name` already holds a record, or would have to wait behind
    /// an admitted conflicting record if it entered now
    pub fn holds_or_would_wait(&self, name: &str, type_: OpsType, mode: QueueMode) -> bool {
        if mode == QueueMode::None {
            return false;
        }
        if self.get(name).is_some() {
            return true;
        }
        self.blocked(&QueueRecord {
            name: name.to_string(),
            type_,
            to_cluster_phase: None,
            queue_by_self: mode == QueueMode::BySelf,
            in_queue: true,
        })
    }

    /// Append a record for `name`; an existing record is returned unchanged.
    ///
    /// A forced request is admitted regardless of conflicts.
    pub fn enqueue(
        &mut self,
        name: &str,
        type_: OpsType,
        to_cluster_phase: Option<ClusterPhase>,
        mode: QueueMode,
        force: bool,
    ) -> std::result::Result<QueueRecord, QueueFull> {
        if let Some(existing) = self.get(name) {
            return Ok(existing.clone());
        }
        if self.records.len() >= QUEUE_CAPACITY {
            return Err(QueueFull);
        }
        let mut record = QueueRecord {
            name: name.to_string(),
            type_,
            to_cluster_phase,
            queue_by_self: mode == QueueMode::BySelf,
            in_queue: false,
        };
        record.in_queue = !force && self.blocked(&record);
        self.records.push(record.clone());
        Ok(record)
    }

    /// Remove `name`, cascade-cancel on failure, then promote at most one waiter
    pub fn dequeue(&mut self, name: &str, removal: Removal) -> DequeueOutcome {
        let Some(idx) = self.records.iter().position(|r| r.name == name) else {
            return DequeueOutcome::default();
        };
        let removed = self.records.remove(idx);

        let mut cancelled = Vec::new();
        if removal == Removal::Failed {
            cancelled = self
                .records
                .iter()
                .filter(|r| r.in_queue && !r.queue_by_self)
                .map(|r| r.name.clone())
                .collect();
            self.records.retain(|r| !cancelled.contains(&r.name));
        }

        let promoted = self.promote();
        DequeueOutcome {
            removed: Some(removed),
            promoted,
            cancelled,
        }
    }

    /// Admit the first waiting record, in FIFO order, that nothing blocks anymore
    pub fn promote(&mut self) -> Option<String> {
        let idx = self
            .records
            .iter()
            .position(|r| r.in_queue && !self.blocked(r))?;
        let record = self.records.get_mut(idx)?;
        record.in_queue = false;
        Some(record.name.clone())
    }
}

/// A value read together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: Option<String>,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    Conflict,
}

/// Persistence of cluster queues with optimistic concurrency
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self, namespace: &str, cluster: &str) -> Result<Versioned<OpsQueue>>;

    /// Write `queue` only if the stored version still equals `expected_version`
    async fn compare_and_swap(
        &self,
        namespace: &str,
        cluster: &str,
        expected_version: Option<&str>,
        queue: &OpsQueue,
    ) -> Result<CasOutcome>;
}

/// Read-modify-write the queue of a cluster, retrying on version conflicts.
///
/// `f` may run several times and must only mutate the queue it is given.
/// Nothing is written when `f` leaves the queue unchanged.
pub async fn update_queue<S, F, R>(store: &S, namespace: &str, cluster: &str, mut f: F) -> Result<R>
where
    S: QueueStore + ?Sized,
    F: FnMut(&mut OpsQueue) -> Result<R> + Send,
    R: Send,
{
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let current = store.load(namespace, cluster).await?;
        let mut queue = current.value.clone();
        let out = f(&mut queue)?;
        if queue == current.value {
            return Ok(out);
        }
        match store
            .compare_and_swap(namespace, cluster, current.version.as_deref(), &queue)
            .await?
        {
            CasOutcome::Swapped => return Ok(out),
            CasOutcome::Conflict => {
                debug!(cluster, attempt, "ops queue changed concurrently, retrying");
            }
        }
    }
    Err(Error::QueueConflict(cluster.to_string()))
}

/// Queue store backed by the Cluster annotation and `metadata.resourceVersion`
#[derive(Clone)]
pub struct KubeQueueStore {
    client: Client,
}

impl KubeQueueStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueueStore for KubeQueueStore {
    async fn load(&self, namespace: &str, cluster: &str) -> Result<Versioned<OpsQueue>> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        let obj = api.get(cluster).await?;
        Ok(Versioned {
            version: obj.metadata.resource_version.clone(),
            value: OpsQueue::from_cluster(&obj)?,
        })
    }

    async fn compare_and_swap(
        &self,
        namespace: &str,
        cluster: &str,
        expected_version: Option<&str>,
        queue: &OpsQueue,
    ) -> Result<CasOutcome> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        // A merge patch carrying resourceVersion is rejected with 409 when stale
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": expected_version,
                "annotations": {
                    (annotations::OPS_QUEUE): queue.to_annotation()?
                }
            }
        });
        match api
            .patch(cluster, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(CasOutcome::Swapped),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(CasOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process queue store with the same CAS contract
#[derive(Default)]
pub struct MemoryQueueStore {
    queues: Mutex<HashMap<(String, String), (u64, OpsQueue)>>,
    forced_conflicts: AtomicU32,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` swaps report a conflict
    pub fn inject_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    pub async fn snapshot(&self, namespace: &str, cluster: &str) -> OpsQueue {
        self.queues
            .lock()
            .await
            .get(&(namespace.to_string(), cluster.to_string()))
            .map(|(_, q)| q.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self, namespace: &str, cluster: &str) -> Result<Versioned<OpsQueue>> {
        let queues = self.queues.lock().await;
        let (version, value) = queues
            .get(&(namespace.to_string(), cluster.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(Versioned {
            version: Some(version.to_string()),
            value,
        })
    }

    async fn compare_and_swap(
        &self,
        namespace: &str,
        cluster: &str,
        expected_version: Option<&str>,
        queue: &OpsQueue,
    ) -> Result<CasOutcome> {
        let forced = self.forced_conflicts.load(Ordering::SeqCst);
        if forced > 0 {
            self.forced_conflicts.store(forced - 1, Ordering::SeqCst);
            return Ok(CasOutcome::Conflict);
        }
        let mut queues = self.queues.lock().await;
        let entry = queues
            .entry((namespace.to_string(), cluster.to_string()))
            .or_default();
        if expected_version != Some(entry.0.to_string().as_str()) {
            return Ok(CasOutcome::Conflict);
        }
        *entry = (entry.0 + 1, queue.clone());
        Ok(CasOutcome::Swapped)
    }
}
