pub mod controller;
pub mod crd;
pub mod handlers;
pub mod health;
pub mod resources;

pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, OperatorConfig, OpsKind, OpsRegistry, Result,
    error_policy, reconcile,
};
pub use crd::{Cluster, OpsDefinition, OpsRequest};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::controller::{Config as ControllerConfig, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use controller::queue::OpsQueue;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Requests named in a cluster's queue annotation
pub fn queued_requests(cluster: &Cluster) -> Vec<ObjectRef<OpsRequest>> {
    let ns = cluster.namespace().unwrap_or_default();
    match OpsQueue::from_cluster(cluster) {
        Ok(queue) => queue
            .records()
            .iter()
            .map(|r| ObjectRef::new(&r.name).within(&ns))
            .collect(),
        Err(e) => {
            tracing::warn!(cluster = %cluster.name_any(), "Unreadable ops queue annotation: {}", e);
            Vec::new()
        }
    }
}

/// Run the OpsRequest controller until its stream ends.
///
/// Each request is reconciled by at most one worker at a time; distinct
/// requests run concurrently up to `config.reconcile_concurrency`.
pub async fn run_controller(client: Client, config: OperatorConfig, health_state: Option<Arc<HealthState>>) {
    let namespace = config.watch_namespace.clone();
    let scope_msg = namespace.as_deref().unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for OpsRequest resources (scope: {})",
        scope_msg
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let concurrency = config.reconcile_concurrency;
    let ctx = Arc::new(Context::new(client.clone(), config, health_state));

    let ns = namespace.as_deref();
    let requests: Api<OpsRequest> = scoped_api(client.clone(), ns);
    let clusters: Api<Cluster> = scoped_api(client.clone(), ns);
    let jobs: Api<Job> = scoped_api(client.clone(), ns);
    let pods: Api<Pod> = scoped_api(client.clone(), ns);
    let pvcs: Api<PersistentVolumeClaim> = scoped_api(client.clone(), ns);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(requests, watcher_config.clone())
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .owns(jobs, watcher_config.clone())
        .owns(pods, watcher_config.clone())
        .owns(pvcs, watcher_config.clone())
        .watches(clusters, watcher_config, |cluster| queued_requests(&cluster))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // Watch events can still arrive for a request that was just deleted
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    tracing::error!("Controller stream ended unexpectedly");
}
