//! Expose: add or withdraw extra services of a component.
//!
//! The mutation only edits `Cluster.spec.services`; the cluster controller
//! renders the Service objects. Progress counts one ledger record per
//! requested service: Enable completes once the Service exists (with an
//! ingress address for a LoadBalancer), Disable once it is gone.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::info;

use crate::controller::Context;
use crate::controller::aggregator::ProgressSummary;
use crate::controller::error::{Error, Result};
use crate::controller::progress::{
    ProgressEvent, detail, object_key, processing_message, set_progress_detail, succeed_message,
};
use crate::crd::{
    Cluster, ClusterComponentSpec, ClusterService, ComponentPhase, Expose, ExposeSwitch,
    LastComponentConfiguration, OpsService, ProgressStatus, ProgressStatusDetail, ServicePort,
    ServiceType,
};
use crate::handlers::{OpsResource, ReconcileOutcome, component_not_found, update_cluster};
use crate::resources::service::{list_cluster_services, service_object_name, service_reachable};

const REQUEUE: Duration = Duration::from_secs(5);
const SERVICE_KIND: &str = "Service";

/// Name of the cluster service entry: `<component>-<service>`
pub fn cluster_service_name(component: &str, service: &str) -> String {
    format!("{}-{}", component, service)
}

pub fn validate(res: &mut OpsResource) -> Result<()> {
    for expose in &res.ops.spec.expose {
        if res.cluster.component_spec(&expose.component_name).is_none() {
            return Err(component_not_found(&res.cluster, &expose.component_name));
        }
        let mut seen = BTreeSet::new();
        for svc in &expose.services {
            if svc.name.is_empty() {
                return Err(Error::ValidationError(format!(
                    "service name of component {} can not be empty",
                    expose.component_name
                )));
            }
            if !seen.insert(svc.name.as_str()) {
                return Err(Error::ValidationError(format!(
                    "service {} of component {} is listed more than once",
                    svc.name, expose.component_name
                )));
            }
        }
    }
    Ok(())
}

/// Snapshot the services each targeted component had
pub fn save_last_configuration(res: &mut OpsResource) {
    for expose in &res.ops.spec.expose {
        let services: Vec<ClusterService> = res
            .cluster
            .spec
            .services
            .iter()
            .filter(|s| s.component_selector == expose.component_name)
            .cloned()
            .collect();
        res.status.last_configuration.components.insert(
            expose.component_name.clone(),
            LastComponentConfiguration {
                services,
                ..Default::default()
            },
        );
    }
}

/// Ports of the component's declared in-cluster services, deduplicated by protocol and port
pub fn default_ports(
    cluster_name: &str,
    component: &str,
    spec: &ClusterComponentSpec,
) -> Result<Vec<ServicePort>> {
    if spec.services.is_empty() {
        return Err(Error::fatal(format!(
            "component service is not defined, expose operation is not supported, cluster: {}, component: {}",
            cluster_name, component
        )));
    }
    let mut seen = BTreeSet::new();
    let ports: Vec<ServicePort> = spec
        .services
        .iter()
        .filter(|s| !matches!(s.service_type, ServiceType::LoadBalancer | ServiceType::NodePort))
        .flat_map(|s| s.ports.iter())
        .filter(|p| seen.insert(p.key()))
        .cloned()
        .collect();
    if ports.is_empty() {
        return Err(Error::fatal(format!(
            "component does not define an available service, expose operation is not supported, cluster: {}, component: {}",
            cluster_name, component
        )));
    }
    Ok(ports)
}

/// Render the cluster service entry for one requested service
pub fn build_cluster_service(
    cluster_name: &str,
    component: &str,
    spec: &ClusterComponentSpec,
    svc: &OpsService,
) -> Result<ClusterService> {
    if svc.role_selector.is_none() && svc.pod_selector.is_empty() && !spec.roles.is_empty() {
        return Err(Error::fatal(format!(
            "component has roles, at least one of 'roleSelector' or 'podSelector' must be specified, cluster: {}, component: {}",
            cluster_name, component
        )));
    }
    let ports = if svc.ports.is_empty() {
        default_ports(cluster_name, component, spec)?
    } else {
        svc.ports.clone()
    };
    let name = cluster_service_name(component, &svc.name);
    Ok(ClusterService {
        service_name: name.clone(),
        name,
        annotations: svc.annotations.clone(),
        service_type: svc.service_type,
        ports,
        role_selector: svc.role_selector.clone(),
        pod_selector: svc.pod_selector.clone(),
        component_selector: component.to_string(),
    })
}

/// Add or remove the requested services on the cluster spec; existing entries are kept as they are
pub fn apply_expose(cluster: &mut Cluster, exposes: &[Expose]) -> Result<()> {
    let cluster_name = cluster.name_any();
    for expose in exposes {
        let component = expose.component_name.as_str();
        let spec = cluster.component_spec(component).cloned().ok_or_else(|| {
            Error::fatal(format!("component spec not found: {}", component))
        })?;
        for svc in &expose.services {
            let name = cluster_service_name(component, &svc.name);
            let selected = |s: &ClusterService| s.name == name && s.component_selector == component;
            match expose.switch {
                ExposeSwitch::Enable => {
                    if cluster.spec.services.iter().any(selected) {
                        continue;
                    }
                    let service = build_cluster_service(&cluster_name, component, &spec, svc)?;
                    cluster.spec.services.push(service);
                }
                ExposeSwitch::Disable => cluster.spec.services.retain(|s| !selected(s)),
            }
        }
    }
    Ok(())
}

pub async fn action(ctx: &Context, res: &mut OpsResource) -> Result<()> {
    let exposes = res.ops.spec.expose.clone();
    update_cluster(ctx, res, |cluster| apply_expose(cluster, &exposes)).await?;
    info!(services = res.cluster.spec.services.len(), "Cluster services updated");
    Ok(())
}

/// Progress of one expose item against the observed Service objects
pub fn expose_progress(
    cluster_name: &str,
    expose: &Expose,
    services: &[Service],
    ledger: &mut Vec<ProgressStatusDetail>,
    events: &mut Vec<ProgressEvent>,
    now: DateTime<Utc>,
) -> ProgressSummary {
    let component = expose.component_name.as_str();
    let verb = match expose.switch {
        ExposeSwitch::Enable => "expose",
        ExposeSwitch::Disable => "remove",
    };
    let mut summary = ProgressSummary::default();
    for svc in &expose.services {
        summary.expected += 1;
        let object = service_object_name(cluster_name, component, &svc.name);
        let key = object_key(SERVICE_KIND, &object);
        let found = services.iter().find(|s| s.name_any() == object);
        let done = match expose.switch {
            ExposeSwitch::Enable => found.is_some_and(|s| service_reachable(s, svc.service_type)),
            ExposeSwitch::Disable => found.is_none(),
        };
        let new = if done {
            summary.completed += 1;
            summary.succeeded += 1;
            detail(&key, ProgressStatus::Succeed, succeed_message(verb, &key, component))
        } else {
            detail(&key, ProgressStatus::Processing, processing_message(verb, &key, component))
        };
        events.extend(set_progress_detail(ledger, new, now));
    }
    summary
}

pub async fn reconcile_action(ctx: &Context, res: &mut OpsResource) -> Result<ReconcileOutcome> {
    let cluster_name = res.cluster.name_any();
    let services = list_cluster_services(&ctx.client, &res.namespace(), &cluster_name).await?;
    let mut total = ProgressSummary::default();
    let now = res.now;

    for expose in res.ops.spec.expose.clone() {
        let status = res
            .status
            .components
            .entry(expose.component_name.clone())
            .or_default();
        let summary = expose_progress(
            &cluster_name,
            &expose,
            &services,
            &mut status.progress_details,
            &mut res.events,
            now,
        );
        status.phase = Some(if summary.is_complete() {
            ComponentPhase::Running
        } else {
            ComponentPhase::Updating
        });
        total.merge(summary);
    }
    Ok(ReconcileOutcome::new(total, REQUEUE))
}
