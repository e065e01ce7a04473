//! Service lookups for exposed endpoints

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

use crate::controller::error::Result;
use crate::crd::{ServiceType, cluster_labels};
use crate::resources::common::selector;

/// Services stamped with the cluster instance label, sorted by name
pub async fn list_cluster_services(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
) -> Result<Vec<Service>> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let labels = BTreeMap::from([(
        cluster_labels::INSTANCE.to_string(),
        cluster_name.to_string(),
    )]);
    let lp = ListParams::default().labels(&selector(&labels));
    let mut services = api.list(&lp).await?.items;
    services.sort_by_key(|s| s.name_any());
    Ok(services)
}

/// Name the cluster controller gives the Service object: `<cluster>-<component>-<name>`
pub fn service_object_name(cluster_name: &str, component: &str, name: &str) -> String {
    [cluster_name, component, name]
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
}

/// A LoadBalancer only counts once it reports an ingress address
pub fn service_reachable(service: &Service, service_type: ServiceType) -> bool {
    if service_type != ServiceType::LoadBalancer {
        return true;
    }
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| {
            ingress.iter().any(|i| {
                i.ip.as_deref().is_some_and(|ip| !ip.is_empty())
                    || i.hostname.as_deref().is_some_and(|h| !h.is_empty())
            })
        })
}
